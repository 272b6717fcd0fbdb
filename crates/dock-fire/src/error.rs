use crate::command::CommandError;
use crate::network::NetworkError;
use crate::vmm::ApiError;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container {0:?} does not exist")]
    NotFound(String),

    #[error("container {0:?} already exists")]
    AlreadyExists(String),

    #[error("container {id:?} is not in {expected} state (status: {actual})")]
    InvalidState {
        id: String,
        expected: &'static str,
        actual: String,
    },

    #[error("container {id:?} state file is corrupt: {detail}")]
    CorruptState { id: String, detail: String },

    #[error("invalid bundle: {0}")]
    Bundle(String),

    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    #[error("required command not found: {0}")]
    MissingTool(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("firecracker API: {0}")]
    Api(#[from] ApiError),

    #[error("{0}")]
    Internal(String),
}

impl RuntimeError {
    /// Wrap an I/O error with the path or operation it concerns.
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::Internal(format!("{context}: {err}"))
    }
}
