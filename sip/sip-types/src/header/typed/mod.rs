//! Typed views of individual header field values.
//!
//! Each type parses from and prints to the raw field value stored in
//! [`Headers`](crate::Headers).

mod auth;
mod contact;
mod cseq;
mod from_to;
mod via;

pub use auth::{
    Algorithm, AuthChallenge, DigestChallenge, DigestResponse, QopOption, QopResponse,
};
pub use contact::Contact;
pub use cseq::CSeq;
pub use from_to::FromTo;
pub use via::Via;

use crate::header::{HeaderError, Name};
use bytesstr::BytesStr;

/// Parse an integer-valued header such as Expires or Content-Length
pub fn parse_u32(name: &Name, value: &BytesStr) -> Result<u32, HeaderError> {
    value
        .trim()
        .parse()
        .map_err(|_| HeaderError::Malformed(name.clone()))
}
