/// Crate-wide result alias.
pub type SmaltResult<T> = Result<T, SmaltError>;

/// Unified error type of the render core.
///
/// `Aborted` travels through the same channel as real failures so that `?`
/// unwinds tile loops and recursive pulls, but it is not a failure: callers
/// that record failure state must check [`SmaltError::is_abort`] first.
#[derive(thiserror::Error, Debug)]
pub enum SmaltError {
    #[error("render aborted")]
    Aborted,

    #[error("plugin failure: {0}")]
    PluginFailure(String),

    #[error("allocation failure: {0}")]
    Allocation(String),

    #[error("missing upstream: input {input} of '{node}' is not connected")]
    MissingUpstream { node: String, input: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SmaltError {
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::PluginFailure(msg.into())
    }

    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InternalInvariant(msg.into())
    }

    pub fn serde(msg: impl Into<String>) -> Self {
        Self::Serde(msg.into())
    }

    /// True for cooperative cancellation, which must never be recorded as a
    /// render failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
