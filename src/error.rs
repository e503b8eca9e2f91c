use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown session")]
    UnknownSession,
    #[error("session is closing or closed")]
    SessionClosed,
    #[error("already listening")]
    AlreadyListening,
    #[error("not listening")]
    NotListening,
    #[error("invalid argument:{0}")]
    InvalidArgument(String),
    #[error("send buffer is full")]
    SendBufferFull,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] zvnet_core::Error),
    #[error(transparent)]
    Reliable(zvnet_reliable::Error),
}

impl From<zvnet_reliable::Error> for Error {
    fn from(value: zvnet_reliable::Error) -> Self {
        match value {
            zvnet_reliable::Error::SendBufferFull => Error::SendBufferFull,
            e => Error::Reliable(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
