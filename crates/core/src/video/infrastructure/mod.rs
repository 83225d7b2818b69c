pub mod raw_frame_writer;
pub mod scheduled_video_reader;
