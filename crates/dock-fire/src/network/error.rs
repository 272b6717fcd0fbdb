use crate::command::CommandError;

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("no free /30 subnets available in {pool}")]
    NoSubnet { pool: &'static str },

    #[error("failed to detect default network interface from: {0:?}")]
    NoDefaultInterface(String),

    #[error("scan container records: {0}")]
    Store(String),
}
