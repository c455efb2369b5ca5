use thiserror::Error;

/// Driver errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("translation of {func} failed: {message}")]
    Translation { func: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
