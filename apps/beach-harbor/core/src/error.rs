use thiserror::Error;

/// A downstream queue an actor hands work to has gone away.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    #[error("event sink queue closed")]
    EventSinkClosed,
    #[error("inbound line queue closed")]
    LineSinkClosed,
}
