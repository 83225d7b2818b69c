use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use framepull_core::pipeline::drain_frames_use_case::{DrainFramesUseCase, ProgressCallback};
use framepull_core::pipeline::pipeline_logger::StdoutPipelineLogger;
use framepull_core::producer::domain::source_descriptor::{OptionValue, SourceDescriptor};
use framepull_core::producer::infrastructure::test_pattern_producer::TestPatternProducer;
use framepull_core::scheduler::scheduler_config::SchedulerConfig;
use framepull_core::shared::constants::TEST_PATTERN_SOURCE;
use framepull_core::video::domain::video_reader::VideoReader;
use framepull_core::video::domain::video_writer::VideoWriter;
use framepull_core::video::infrastructure::raw_frame_writer::RawFrameWriter;
use framepull_core::video::infrastructure::scheduled_video_reader::ScheduledVideoReader;

/// Pulls frames from an asynchronous producer in order and writes them out
/// as raw interleaved pictures.
#[derive(Parser)]
#[command(name = "framepull")]
struct Cli {
    /// Raw output file (frames written back to back).
    output: PathBuf,

    /// Source to evaluate.
    #[arg(long, default_value = TEST_PATTERN_SOURCE)]
    source: String,

    /// Source option as key=value (repeatable). Integers and num/den pairs
    /// are typed, anything else is passed as text.
    #[arg(long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// Requests kept in flight (default: one per CPU core).
    #[arg(long)]
    requests: Option<usize>,

    /// Output node of the source to read.
    #[arg(long, default_value = "0")]
    output_node: usize,

    /// First frame to deliver.
    #[arg(long, default_value = "0")]
    seek: usize,

    /// Maximum number of frames to deliver.
    #[arg(long)]
    frames: Option<usize>,

    /// Give up when a single frame takes longer than this many milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print progress every N frames.
    #[arg(long, default_value = "100")]
    progress_every: usize,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    validate(&cli)?;

    let descriptor = build_descriptor(&cli.source, &cli.options)?;
    let config = build_config(&cli);

    let producer = Arc::new(TestPatternProducer::new());
    let reader: Box<dyn VideoReader> = Box::new(ScheduledVideoReader::new(producer, config));
    let writer: Box<dyn VideoWriter> = Box::new(RawFrameWriter::new());

    let progress: ProgressCallback = Box::new(|current, total| {
        match total {
            Some(total) => eprint!("\rPulled frame {current}/{total}"),
            None => eprint!("\rPulled frame {current}"),
        }
        true
    });

    let mut use_case = DrainFramesUseCase::new(
        reader,
        writer,
        Box::new(StdoutPipelineLogger::new(cli.progress_every)),
        Some(progress),
        None,
    );
    let report = use_case.execute(&descriptor, &cli.output);
    eprintln!();
    let report = report?;

    log::info!(
        "{} frames written to {}",
        report.frames_written,
        cli.output.display()
    );
    Ok(())
}

fn validate(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if cli.requests == Some(0) {
        return Err("--requests must be at least 1".into());
    }
    if cli.frames == Some(0) {
        return Err("--frames must be at least 1".into());
    }
    if cli.timeout_ms == Some(0) {
        return Err("--timeout-ms must be at least 1".into());
    }
    if cli.progress_every == 0 {
        return Err("--progress-every must be at least 1".into());
    }
    Ok(())
}

fn build_config(cli: &Cli) -> SchedulerConfig {
    SchedulerConfig {
        window_size: cli.requests,
        output_index: cli.output_node,
        first_frame: cli.seek,
        frame_limit: cli.frames,
        wait_timeout: cli.timeout_ms.map(Duration::from_millis),
        ..SchedulerConfig::default()
    }
}

fn build_descriptor(
    source: &str,
    options: &[String],
) -> Result<SourceDescriptor, Box<dyn std::error::Error>> {
    let mut descriptor = SourceDescriptor::new(source);
    for raw in options {
        let (key, value) = parse_option(raw)?;
        descriptor.set_option(key, OptionValue::parse(value));
    }
    Ok(descriptor)
}

fn parse_option(raw: &str) -> Result<(&str, &str), Box<dyn std::error::Error>> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value.trim())),
        _ => Err(format!("Option must look like key=value, got '{raw}'").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_option_splits_on_first_equals() {
        assert_eq!(parse_option("expr=a=b").unwrap(), ("expr", "a=b"));
        assert_eq!(parse_option(" width = 320 ").unwrap(), ("width", "320"));
    }

    #[test]
    fn test_parse_option_rejects_missing_key_or_value() {
        assert!(parse_option("width").is_err());
        assert!(parse_option("=320").is_err());
    }

    #[test]
    fn test_build_descriptor_types_values() {
        let options = vec![
            "width=320".to_string(),
            "fps=30000/1001".to_string(),
            "mode=bars".to_string(),
        ];
        let d = build_descriptor("testsrc", &options).unwrap();
        assert_eq!(d.source(), "testsrc");
        assert_eq!(d.int_option("width"), Some(320));
        assert_eq!(d.option("fps").and_then(|v| v.as_pair()), Some((30000, 1001)));
        assert_eq!(d.option("mode").and_then(|v| v.as_str()), Some("bars"));
    }

    #[test]
    fn test_cli_flags_map_to_config() {
        let cli = Cli::parse_from([
            "framepull",
            "out.rgb",
            "--requests",
            "6",
            "--seek",
            "10",
            "--frames",
            "5",
            "--timeout-ms",
            "250",
        ]);
        let config = build_config(&cli);
        assert_eq!(config.window_size, Some(6));
        assert_eq!(config.first_frame, 10);
        assert_eq!(config.frame_limit, Some(5));
        assert_eq!(config.wait_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.drain_timeout, None);
    }

    #[test]
    fn test_validate_rejects_zero_requests() {
        let cli = Cli::parse_from(["framepull", "out.rgb", "--requests", "0"]);
        assert!(validate(&cli).is_err());
    }
}
