use sip_types::{HeaderError, ParseError};
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("request timed out")]
    RequestTimedOut,
    #[error("no transaction {0}")]
    UnknownTransaction(crate::TsxKey),
    #[error("transaction cannot send this response in its current state")]
    InvalidTransactionState,
}
