pub mod pipeline;
pub mod producer;
pub mod scheduler;
pub mod shared;
pub mod video;
