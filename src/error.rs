//! Crate-wide error types.
//!
//! Each fallible boundary gets its own `thiserror` enum; `EngineError`
//! composes them the way `ProtocolError` composes `FrameError` in the
//! protocols this crate is modeled on.

use thiserror::Error;

/// Errors raised while parsing bytes into a field map, or validating a
/// plugin's declarative schema.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected end of input at offset {offset} (reason: {reason})")]
    Eof { offset: usize, reason: String },

    #[error("declared size {declared} at offset {offset} exceeds remaining input ({remaining})")]
    SizeExceedsInput {
        offset: usize,
        declared: usize,
        remaining: usize,
    },

    #[error("bit width {0} exceeds 64 bits")]
    BitWidthTooLarge(u32),

    #[error("field '{0}' not found in model")]
    UnknownField(String),

    #[error("invalid checksum region for field '{0}': {1}")]
    InvalidChecksumRegion(String, String),
}

/// Errors raised when a plugin's declarative schema violates §3 invariants.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("duplicate field name '{0}' in data model")]
    DuplicateField(String),

    #[error("field '{0}' marks is_size_field but size_of references unknown field '{1}'")]
    UnknownSizeOfTarget(String, String),

    #[error("variable-size field '{0}' is neither the last block nor has a known size field")]
    UnboundedVariableField(String),

    #[error("state '{0}' referenced by a transition is not declared in states")]
    UnknownState(String),

    #[error("initial_state '{0}' is not present in states")]
    UnknownInitialState(String),

    #[error("state model declares transitions but no way to detect advancement (no response_model/response_handlers and no expected_response on any transition)")]
    NoAdvancementSignal,

    #[error("splice mutator requires at least two seeds, found {0}")]
    InsufficientSeedsForSplice(usize),

    #[error("malformed plugin manifest: {0}")]
    Malformed(String),
}

/// Errors at the connection / transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailure { endpoint: String, reason: String },

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection closed by peer")]
    Closed,
}

/// Top-level engine error, covering every boundary in §7.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing context key '{0}'")]
    MissingContext(String),

    #[error("plugin '{0}' not found")]
    PluginNotFound(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("finding '{0}' not found")]
    FindingNotFound(String),

    #[error("session is in state {0:?}, operation not permitted")]
    InvalidState(String),

    #[error("concurrency limit reached ({limit}); running sessions: {running:?}")]
    ConcurrencyLimit { limit: usize, running: Vec<String> },

    #[error("validator returned false")]
    ValidatorReturnedFalse,

    #[error("validator raised {kind}: {message}")]
    ValidatorRaised { kind: String, message: String },

    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
