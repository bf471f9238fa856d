use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer manager out of memory: {0}")]
    BufferManagerOom(String),

    #[error("corrupt WAL: {0}")]
    CorruptWal(String),

    #[error("value of {0} bytes exceeds the maximum overflow payload size")]
    OverLargeValue(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, DbError>;
