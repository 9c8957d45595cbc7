#![warn(unreachable_pub)]
#![deny(unsafe_code)]

//! SDP (RFC 4566) session descriptions for offer/answer exchanges.
//!
//! The model keeps only what a SIP softphone needs: origin, connection,
//! audio/video media descriptions with rtpmap and direction attributes,
//! and the ICE attributes used for candidate exchange. Unknown lines are
//! skipped on parse.

use internal::IResult;
use nom::character::complete::{char, digit1};
use nom::combinator::map_res;
use nom::sequence::preceded;
use std::str::FromStr;

mod attributes;
mod connection;
mod media;
mod media_description;
mod origin;
mod session_description;

pub use attributes::{
    Direction, IceCandidate, IcePassword, IceUsernameFragment, RtpMap, UnknownAttribute,
    UntaggedAddress,
};
pub use connection::Connection;
pub use media::{Media, MediaType, TransportProtocol};
pub use media_description::MediaDescription;
pub use origin::Origin;
pub use session_description::{ParseSessionDescriptionError, SessionDescription};

fn slash_num(i: &str) -> IResult<&str, u32> {
    preceded(char('/'), map_res(digit1, FromStr::from_str))(i)
}

fn not_whitespace(c: char) -> bool {
    !c.is_ascii_whitespace()
}

fn ice_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '/')
}
