pub mod chunker;
pub mod decode;
pub mod extraction;
pub mod merge;
pub mod pipeline;

pub use pipeline::{
    DefaultPipelineServices, IngestionOutcome, IngestionPipeline, IngestionRequest,
    PipelineServices,
};
