pub mod frame_producer;
pub mod source_descriptor;
