use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid segment")]
    InvalidSegment,
    #[error("conversation mismatch: expected {expected} but got {actual}")]
    ConvMismatch { expected: u32, actual: u32 },
    #[error("send buffer is full")]
    SendBufferFull,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
