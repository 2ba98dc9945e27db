use std::fmt;

use crate::{parser, token::Spanned};

impl fmt::Display for parser::Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use parser::Error::*;
        match self {
            Unexpected { actual, expected } => {
                write!(f, "expected token {expected:?}, but got {actual:?}")
            }
            UnexpectedAny { actual, expected } => {
                write!(f, "expected one of {expected:?}, but got {actual:?}")
            }
            UnexpectedToken { token } => write!(f, "unexpected token {token:?}"),
            ExpectedType => write!(f, "expected a type"),
            ExpectedName => write!(f, "expected a name"),
            UnexpectedName => write!(f, "unexpected name in type"),
            SkippedDeclaration { text, reason } => {
                write!(f, "skipped declaration `{text}`")?;
                if let Some(reason) = reason {
                    write!(f, ": {reason}")?;
                }
                Ok(())
            }
            UnsupportedMacro { name } => {
                write!(f, "unsupported macro `{name}` in declaration position")
            }
            Unmodeled { what, text } => write!(f, "{what} `{text}` is not modeled"),
        }
    }
}

/// With the alternate flag (`{:#}`), the error is prefixed with its location.
impl fmt::Display for Spanned<'_, parser::Error> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "{}: ", self.loc)?;
        }
        write!(f, "{}", self.inner)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        parser::Error,
        token::{Location, Span, Spanned, TokenKind},
    };

    #[test]
    fn skipped_declarations_carry_their_reason() {
        let error = Spanned {
            inner: Error::SkippedDeclaration {
                text: "int x y;".into(),
                reason: Some(Box::new(Error::Unexpected {
                    actual: TokenKind::Identifier,
                    expected: TokenKind::Semicolon,
                })),
            },
            span: Span::new_of_length(0, 8),
            loc: Location {
                file: "a.h",
                line: 3,
                column: 1,
            },
        };
        assert_eq!(
            format!("{error:#}"),
            "a.h:3:1: skipped declaration `int x y;`: expected token Semicolon, but got Identifier"
        );
        assert_eq!(
            error.to_string(),
            "skipped declaration `int x y;`: expected token Semicolon, but got Identifier"
        );
    }
}
