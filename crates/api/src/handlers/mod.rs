pub mod devices;
pub mod downloads;
pub mod jobs;
