//! Internal util functions shared between the lark crates.

mod ws;

pub type IResult<I, O> = nom::IResult<I, O, nom::error::VerboseError<I>>;
pub use nom::Finish;
use nom::error::VerboseError;
pub use ws::{Ws, ws};

/// Detach a borrowed nom error from its input so it can be returned upwards
pub fn verbose_error_to_owned(i: VerboseError<&str>) -> VerboseError<String> {
    VerboseError {
        errors: i
            .errors
            .into_iter()
            .map(|(i, kind)| (i.into(), kind))
            .collect(),
    }
}

/// Parser that consumes and returns the complete remaining input
pub fn identity<E>() -> impl Fn(&str) -> nom::IResult<&str, &str, E> {
    move |i| Ok(("", i))
}
