// Landmark extraction pipeline: workers, result sinks and post-processing

pub mod checkpoint;
pub mod landmark_files;
pub mod merge;
pub mod orchestrator;
pub mod relabel;
pub mod schema;
pub mod types;
pub mod worker;
