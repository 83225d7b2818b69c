pub mod video_reader;
pub mod video_writer;
