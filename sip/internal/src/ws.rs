use crate::IResult;
use nom::Parser;
use nom::character::complete::space0;
use nom::error::VerboseError;

/// Tuple of parsers which are applied in sequence, each one preceded by
/// optional whitespace.
pub trait Ws<'i, O> {
    fn parse_ws(&mut self, input: &'i str) -> IResult<&'i str, O>;
}

/// Sequence the given tuple of parsers, skipping leading whitespace before
/// each element.
pub fn ws<'i, O, T>(mut parsers: T) -> impl FnMut(&'i str) -> IResult<&'i str, O>
where
    T: Ws<'i, O>,
{
    move |i| parsers.parse_ws(i)
}

macro_rules! impl_ws {
    ($($parser:ident/$output:ident/$idx:tt),+) => {
        impl<'i, $($parser, $output,)+> Ws<'i, ($($output,)+)> for ($($parser,)+)
        where
            $($parser: Parser<&'i str, $output, VerboseError<&'i str>>,)+
        {
            fn parse_ws(&mut self, input: &'i str) -> IResult<&'i str, ($($output,)+)> {
                $(
                    let (input, _) = space0(input)?;
                    let (input, $output) = self.$idx.parse(input)?;
                )+

                Ok((input, ($($output,)+)))
            }
        }
    };
}

#[allow(non_snake_case)]
mod impls {
    use super::*;

    impl_ws!(P1/O1/0);
    impl_ws!(P1/O1/0, P2/O2/1);
    impl_ws!(P1/O1/0, P2/O2/1, P3/O3/2);
    impl_ws!(P1/O1/0, P2/O2/1, P3/O3/2, P4/O4/3);
    impl_ws!(P1/O1/0, P2/O2/1, P3/O3/2, P4/O4/3, P5/O5/4);
    impl_ws!(P1/O1/0, P2/O2/1, P3/O3/2, P4/O4/3, P5/O5/4, P6/O6/5);
}

#[cfg(test)]
mod test {
    use super::*;
    use nom::bytes::complete::tag;

    #[test]
    fn skips_leading_whitespace() {
        let (rem, (a, b)) = ws((tag::<_, _, VerboseError<&str>>("a"), tag("b")))("  a   b").unwrap();

        assert!(rem.is_empty());
        assert_eq!(a, "a");
        assert_eq!(b, "b");
    }

    #[test]
    fn no_whitespace_needed() {
        let (rem, (a,)) = ws((tag::<_, _, VerboseError<&str>>("a"),))("a rest").unwrap();

        assert_eq!(rem, " rest");
        assert_eq!(a, "a");
    }
}
