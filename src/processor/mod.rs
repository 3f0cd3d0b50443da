//! The processing engine: context, state machines, writers and assembly.

pub mod context;
pub mod processing;
pub mod reprocessing;
pub mod response;
pub mod stream_processor;
pub mod writer;

pub use context::{CursorState, EnginePositions, ProcessorConfig, RecordFilter};
pub use processing::ProcessingStateMachine;
pub use reprocessing::{ReprocessingReport, ReprocessingStateMachine};
pub use response::{CommandResponse, NoopResponseTransport, ResponseTransport, ResponseWriter};
pub use stream_processor::{
    EnginePhase, StreamProcessor, StreamProcessorBuilder, StreamProcessorHandle,
};
pub use writer::StreamWriter;
