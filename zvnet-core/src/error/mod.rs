use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("truncated: len is {len} but at least {required} is required")]
    Truncated { len: usize, required: usize },
    #[error("invalid protocol")]
    InvalidProtocol,
    #[error("invalid address family: {0}")]
    InvalidAddress(u8),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
