//! Error kinds and the reporting policy shaders and the VM report through.
//!
//! Compile-time and runtime failures both collapse into one `RenderError`
//! enum tagged by kind, rather than separate parser/runtime error types.

use bitflags::bitflags;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Exact error message text that callers may match against.
pub const BREAK_OUTSIDE_OF_LOOP: &str = "Break outside of a loop";
pub const BREAK_TO_LEVEL_OUTSIDE_OF_LOOP: &str = "Break to a level outside of a loop";

#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error("{message} (line {line})")]
    SyntaxError { line: u32, message: String },

    #[error("{message} (line {line})")]
    SemanticError { line: u32, message: String },

    #[error("{message} (line {line})")]
    CodeGenerationFailed { line: u32, message: String },

    #[error("{message}")]
    RuntimeShadingError {
        vertex_count: Option<usize>,
        message: String,
    },

    #[error("{message}")]
    UnsupportedGeometry { message: String },

    #[error("{message}")]
    ResourceMissing { message: String },

    #[error("render cancelled")]
    Cancelled,
}

impl RenderError {
    pub fn syntax(line: u32, message: impl Into<String>) -> Self {
        RenderError::SyntaxError {
            line,
            message: message.into(),
        }
    }

    pub fn semantic(line: u32, message: impl Into<String>) -> Self {
        RenderError::SemanticError {
            line,
            message: message.into(),
        }
    }

    pub fn codegen(line: u32, message: impl Into<String>) -> Self {
        RenderError::CodeGenerationFailed {
            line,
            message: message.into(),
        }
    }

    pub fn break_outside_of_loop(line: u32) -> Self {
        RenderError::codegen(line, BREAK_OUTSIDE_OF_LOOP)
    }

    pub fn break_to_level_outside_of_loop(line: u32) -> Self {
        RenderError::codegen(line, BREAK_TO_LEVEL_OUTSIDE_OF_LOOP)
    }

    pub fn line(&self) -> Option<u32> {
        match self {
            RenderError::SyntaxError { line, .. }
            | RenderError::SemanticError { line, .. }
            | RenderError::CodeGenerationFailed { line, .. } => Some(*line),
            _ => None,
        }
    }
}

bitflags! {
    /// Action bitmap an [`ErrorPolicy`] takes when an error is reported.
    /// Bits may be combined, e.g. `LOG | THROW`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorAction: u8 {
        const LOG = 0b0001;
        const THROW = 0b0010;
        const CONTINUE = 0b0100;
        const IGNORE = 0b1000;
    }
}

impl Default for ErrorAction {
    fn default() -> Self {
        ErrorAction::LOG | ErrorAction::THROW
    }
}

/// Sink errors are reported to. Stored behind a trait object so callers can
/// plug in whatever collects diagnostics (stderr, a test fixture, a UI panel).
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &RenderError);
}

/// Sink that appends every reported error to an in-memory log; the test
/// fixtures in `tests/` use this to assert on exact kind/line/message.
#[derive(Default)]
pub struct RecordingSink {
    errors: Mutex<Vec<RenderError>>,
}

impl RecordingSink {
    pub fn errors(&self) -> Vec<RenderError> {
        self.errors.lock().unwrap().clone()
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, error: &RenderError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

struct StderrSink;

impl ErrorSink for StderrSink {
    fn report(&self, error: &RenderError) {
        log::error!("{error}");
    }
}

/// Carries the action bitmap and the sink errors are reported to.
///
/// Components call [`ErrorPolicy::report`]; depending on the bitmap this
/// logs, unwinds (`Err` is returned to the caller, who is expected to
/// propagate it as a hard stop), records and continues, or is a no-op.
#[derive(Clone)]
pub struct ErrorPolicy {
    action: ErrorAction,
    sink: Arc<dyn ErrorSink>,
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorPolicy")
            .field("action", &self.action)
            .finish()
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy {
            action: ErrorAction::default(),
            sink: Arc::new(StderrSink),
        }
    }
}

impl ErrorPolicy {
    pub fn new(action: ErrorAction, sink: Arc<dyn ErrorSink>) -> Self {
        ErrorPolicy { action, sink }
    }

    pub fn with_recording_sink(action: ErrorAction) -> (Self, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (ErrorPolicy::new(action, sink.clone()), sink)
    }

    pub fn actions(&mut self, action: ErrorAction) {
        self.action = action;
    }

    /// Report `error` per the bitmap. Returns `Err` iff `THROW` is set,
    /// so call sites can use `policy.report(e)?;`.
    pub fn report(&self, error: RenderError) -> Result<(), RenderError> {
        if self.action.contains(ErrorAction::IGNORE) {
            return Ok(());
        }
        if self.action.contains(ErrorAction::LOG) {
            self.sink.report(&error);
        }
        if self.action.contains(ErrorAction::THROW) {
            return Err(error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throw_propagates_the_error() {
        let (policy, _sink) = ErrorPolicy::with_recording_sink(ErrorAction::THROW);
        let err = policy.report(RenderError::break_outside_of_loop(2));
        assert!(err.is_err());
    }

    #[test]
    fn continue_records_but_does_not_throw() {
        let (policy, sink) = ErrorPolicy::with_recording_sink(ErrorAction::LOG | ErrorAction::CONTINUE);
        let result = policy.report(RenderError::break_outside_of_loop(2));
        assert!(result.is_ok());
        assert_eq!(sink.errors().len(), 1);
    }

    #[test]
    fn ignore_drops_the_error_silently() {
        let (policy, sink) = ErrorPolicy::with_recording_sink(ErrorAction::IGNORE);
        let result = policy.report(RenderError::break_outside_of_loop(2));
        assert!(result.is_ok());
        assert!(sink.errors().is_empty());
    }
}
