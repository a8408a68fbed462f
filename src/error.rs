use thiserror::Error;

/// Errors surfaced by the interpreter.
///
/// Three categories: image/save validation problems (rejected without
/// touching prior state), runtime faults raised by the running program
/// (these abort the interpreter loop), and IO errors from the host's
/// save/load streams.
#[derive(Error, Debug)]
pub enum TerpError {
    #[error("bad image: {0}")]
    BadImage(String),

    #[error("bad save file: {0}")]
    BadSave(String),

    #[error("runtime fault: {0}")]
    Fault(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TerpError {
    pub fn fault(msg: impl Into<String>) -> TerpError {
        TerpError::Fault(msg.into())
    }

    pub fn bad_image(msg: impl Into<String>) -> TerpError {
        TerpError::BadImage(msg.into())
    }

    pub fn bad_save(msg: impl Into<String>) -> TerpError {
        TerpError::BadSave(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TerpError>;
