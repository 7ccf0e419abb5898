pub mod jobs;
pub mod stats;
pub mod submit;
