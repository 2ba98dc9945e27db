use std::{iter::Peekable, str::Chars};

use crate::{
    token::{LexErrorKind, Location, Span, Token, TokenKind, KEYWORDS},
    util::TakeThroughExt,
};

pub const SUGGESTED_TOKENS_CAPACITY: usize = 8_192;

/// Lexes the provided file, producing the tokens (including the final
/// [`TokenKind::Eof`]) into the provided buffer.
pub fn lex<'src>(file: &'src str, src: &'src str, tokens: &mut Vec<Token<'src>>) {
    tokens.extend(Lexer::new(file, src).take_through(Token::is_eof));
}

/// A convenience function that allocates a new buffer per lexed input and
/// returns it.
pub fn lex_in_new<'src>(file: &'src str, src: &'src str) -> Vec<Token<'src>> {
    let mut tokens = Vec::with_capacity(SUGGESTED_TOKENS_CAPACITY.min(src.len() / 2 + 1));
    lex(file, src, &mut tokens);
    tokens
}

/// The C/C++ lexer.
///
/// This is a lazy iterator: tokens are only scanned as they're requested. The
/// last produced item is always a [`TokenKind::Eof`] token, after which the
/// iterator is exhausted. Comments and whitespace are dropped, but recorded in
/// the [`Token::line_start`] and [`Token::spaced`] flags, which the
/// preprocessor relies on.
#[derive(Clone)]
pub struct Lexer<'src> {
    file: &'src str,
    src: &'src str,
    iter: Peekable<Chars<'src>>,
    cursor: usize,
    current_lo: usize,
    line: u32,
    column: u32,
    current_loc: Location<'src>,
    at_line_start: bool,
    spaced: bool,
    finished: bool,
}

impl<'src> Iterator for Lexer<'src> {
    type Item = Token<'src>;

    fn next(&mut self) -> Option<Token<'src>> {
        if self.finished {
            return None;
        }
        let kind = match self.skip_trivia() {
            Some(error) => error,
            None => self.scan_token_kind(),
        };
        if matches!(kind, TokenKind::Eof | TokenKind::Error(LexErrorKind::UnclosedComment)) {
            self.finished = true;
        }
        Some(self.produce(kind))
    }
}

impl<'src> Lexer<'src> {
    /// Constructs a new lexer with the default state.
    pub fn new(file: &'src str, src: &'src str) -> Lexer<'src> {
        Lexer {
            file,
            src,
            iter: src.chars().peekable(),
            cursor: 0,
            current_lo: 0,
            line: 1,
            column: 1,
            current_loc: Location {
                file,
                line: 1,
                column: 1,
            },
            at_line_start: true,
            spaced: false,
            finished: false,
        }
    }

    /// Rewinds the lexer to the beginning of its input.
    pub fn restart(&mut self) {
        *self = Lexer::new(self.file, self.src);
    }

    /// Skips whitespace, line splices and comments. Returns an error kind if
    /// an unterminated block comment was found.
    fn skip_trivia(&mut self) -> Option<TokenKind> {
        loop {
            match self.peek() {
                '\n' => {
                    self.advance();
                    self.at_line_start = true;
                    self.spaced = true;
                }
                c if c.is_whitespace() => {
                    self.advance();
                    self.spaced = true;
                }
                '\\' if matches!(self.peek_nth(1), '\n' | '\r') => {
                    self.advance();
                    if self.advance() == '\r' && self.peek() == '\n' {
                        self.advance();
                    }
                    self.spaced = true;
                }
                '/' if self.peek_nth(1) == '/' => {
                    while !matches!(self.peek(), '\n' | '\0') {
                        self.advance();
                    }
                    self.spaced = true;
                }
                '/' if self.peek_nth(1) == '*' => {
                    self.mark();
                    self.advance();
                    self.advance();
                    loop {
                        match self.advance() {
                            '*' if self.peek() == '/' => {
                                self.advance();
                                break;
                            }
                            '\0' => return Some(TokenKind::Error(LexErrorKind::UnclosedComment)),
                            _ => (),
                        }
                    }
                    self.spaced = true;
                }
                _ => return None,
            }
        }
    }

    /// Tries to scan the current character.
    fn scan_token_kind(&mut self) -> TokenKind {
        use TokenKind::*;
        self.mark();
        match self.advance() {
            '\0' => Eof,
            '(' => LParen,
            ')' => RParen,
            '{' => LBrace,
            '}' => RBrace,
            '[' => LBracket,
            ']' => RBracket,
            ';' => Semicolon,
            ',' => Comma,
            '?' => Question,
            '~' => Tilde,
            ':' => match self.peek() {
                ':' => self.advance_with(ColonColon),
                _ => Colon,
            },
            '.' => match (self.peek(), self.peek_nth(1)) {
                ('.', '.') => {
                    self.advance();
                    self.advance_with(Ellipsis)
                }
                (c, _) if c.is_ascii_digit() => self.number(),
                _ => Dot,
            },
            '-' => match self.peek() {
                '>' => self.advance_with(Arrow),
                '-' => self.advance_with(MinusMinus),
                '=' => self.advance_with(OpAssign),
                _ => Minus,
            },
            '+' => match self.peek() {
                '+' => self.advance_with(PlusPlus),
                '=' => self.advance_with(OpAssign),
                _ => Plus,
            },
            '&' => match self.peek() {
                '&' => self.advance_with(AmpAmp),
                '=' => self.advance_with(OpAssign),
                _ => Amp,
            },
            '|' => match self.peek() {
                '|' => self.advance_with(PipePipe),
                '=' => self.advance_with(OpAssign),
                _ => Pipe,
            },
            '*' => self.maybe_assign(Star),
            '/' => self.maybe_assign(Slash),
            '%' => self.maybe_assign(Percent),
            '^' => self.maybe_assign(Caret),
            '!' => match self.peek() {
                '=' => self.advance_with(NotEq),
                _ => Bang,
            },
            '=' => match self.peek() {
                '=' => self.advance_with(EqEq),
                _ => Eq,
            },
            '<' => match self.peek() {
                '=' => self.advance_with(LessEq),
                '<' => {
                    self.advance();
                    self.maybe_assign(LessLess)
                }
                _ => Less,
            },
            '>' => match self.peek() {
                '=' => self.advance_with(GreaterEq),
                _ => Greater,
            },
            '#' => match self.peek() {
                '#' => self.advance_with(HashHash),
                _ => Hash,
            },
            '"' => self.quoted('"'),
            '\'' => self.quoted('\''),
            c if c.is_ascii_digit() => self.number(),
            c if is_identifier_start(c) => self.identifier_or_keyword(),
            _ => Unknown,
        }
    }

    /// Lexes a string or character literal, whose opening quote has already
    /// been consumed. Neither may contain an unescaped line break.
    fn quoted(&mut self, quote: char) -> TokenKind {
        let error = if quote == '"' {
            LexErrorKind::UnclosedString
        } else {
            LexErrorKind::UnclosedChar
        };
        let mut is_escaping = false;
        loop {
            match (is_escaping, self.peek()) {
                (_, '\0') | (false, '\n') => return TokenKind::Error(error),
                (false, c) if c == quote => {
                    self.advance();
                    return if quote == '"' {
                        TokenKind::String
                    } else {
                        TokenKind::CharLiteral
                    };
                }
                (false, '\\') => {
                    self.advance();
                    is_escaping = true;
                }
                (_, _) => {
                    self.advance();
                    is_escaping = false;
                }
            }
        }
    }

    fn identifier_or_keyword(&mut self) -> TokenKind {
        while is_identifier_continue(self.peek()) {
            self.advance();
        }
        // Encoding prefixes, such as in `L"wide"` or `u8"text"`.
        if matches!(self.substr(), "L" | "u" | "U" | "u8") && matches!(self.peek(), '"' | '\'') {
            let quote = self.advance();
            return self.quoted(quote);
        }
        KEYWORDS.get(self.substr()).copied().unwrap_or(TokenKind::Identifier)
    }

    /// Lexes a preprocessing number: digits, letters (suffixes, hexadecimal
    /// digits), dots and exponent signs.
    fn number(&mut self) -> TokenKind {
        loop {
            match self.peek() {
                c if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '\'' => {
                    let prev = self.advance();
                    if matches!(prev, 'e' | 'E' | 'p' | 'P') && matches!(self.peek(), '+' | '-') {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
        TokenKind::Number
    }

    fn maybe_assign(&mut self, kind: TokenKind) -> TokenKind {
        match self.peek() {
            '=' => self.advance_with(TokenKind::OpAssign),
            _ => kind,
        }
    }
}

impl<'src> Lexer<'src> {
    /// Starts a new token "mark".
    fn mark(&mut self) {
        self.current_lo = self.cursor;
        self.current_loc = Location {
            file: self.file,
            line: self.line,
            column: self.column,
        };
    }

    /// Returns the next char and advances the iterator.
    fn advance(&mut self) -> char {
        let Some(c) = self.iter.next() else {
            return '\0';
        };
        self.cursor += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    /// Advances and returns the provided value.
    fn advance_with<T>(&mut self, value: T) -> T {
        self.advance();
        value
    }

    /// Returns the next char without advancing the iterator.
    fn peek(&mut self) -> char {
        self.iter.peek().copied().unwrap_or('\0')
    }

    /// Returns the char `n` positions after the next one, without advancing.
    fn peek_nth(&self, n: usize) -> char {
        self.src[self.cursor..].chars().nth(n).unwrap_or('\0')
    }

    /// Returns the current span.
    fn span(&self) -> Span {
        Span::new_of_bounds(self.current_lo..self.cursor)
    }

    /// Returns the substring of the current marked bounds.
    fn substr(&self) -> &'src str {
        let src: &'src str = self.src;
        self.span().substr(src)
    }

    /// Produces a token using the marked bounds, resetting the trivia flags.
    fn produce(&mut self, kind: TokenKind) -> Token<'src> {
        let mut token = Token::new(kind, self.substr(), self.span(), self.current_loc);
        token.line_start = std::mem::take(&mut self.at_line_start);
        token.spaced = std::mem::take(&mut self.spaced);
        token
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_identifier_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

pub mod extract {
    /// Parses an integer literal, honoring the `0x`, `0b` and octal prefixes
    /// and ignoring any integer suffix or digit separator.
    pub fn int(text: &str) -> Option<i64> {
        let digits: String = text
            .trim_end_matches(['u', 'U', 'l', 'L', 'z', 'Z'])
            .chars()
            .filter(|c| *c != '\'')
            .collect();
        let (radix, digits) = if let Some(hex) = digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
        {
            (16, hex)
        } else if let Some(bin) = digits
            .strip_prefix("0b")
            .or_else(|| digits.strip_prefix("0B"))
        {
            (2, bin)
        } else if digits.len() > 1 && digits.starts_with('0') {
            (8, &digits[1..])
        } else {
            (10, digits.as_str())
        };
        let value = u64::from_str_radix(digits, radix).ok()?;
        // Unsigned literals above `i64::MAX` wrap, as they would in C.
        Some(value as i64)
    }

    /// Parses a floating literal, ignoring any floating suffix.
    pub fn float(text: &str) -> Option<f64> {
        let is_hex = text.starts_with("0x") || text.starts_with("0X");
        let trimmed = if is_hex {
            text
        } else {
            text.trim_end_matches(['f', 'F', 'l', 'L'])
        };
        trimmed.parse().ok()
    }

    /// Returns the contents of a string literal, with its prefix and quotes
    /// removed. Escape sequences are preserved verbatim.
    pub fn string(text: &str) -> &str {
        let start = text.find('"').map_or(0, |i| i + 1);
        let end = text.len().saturating_sub(1).max(start);
        &text[start..end]
    }

    /// Returns the value of a character literal such as `'a'` or `'\n'`.
    pub fn char(text: &str) -> Option<i64> {
        let start = text.find('\'')? + 1;
        let inner = text.get(start..text.len().checked_sub(1)?)?;
        let mut chars = inner.chars();
        let value = match chars.next()? {
            '\\' => match chars.next()? {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                '\\' => '\\',
                '\'' => '\'',
                '"' => '"',
                other => other,
            },
            c => c,
        };
        Some(i64::from(u32::from(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(src: &str) -> Vec<(TokenKind, String)> {
        lex_in_new("test.h", src)
            .into_iter()
            .map(|t| (t.kind, t.text.into_owned()))
            .collect()
    }

    #[test]
    fn tests_with_span() {
        use TokenKind::*;
        let cases = cases!(match .. {
            "int x;" => [
                (Int, 0..3),
                (Identifier, 4..5),
                (Semicolon, 5..6),
                (Eof, 6..6),
            ],
            "a::b<c>>" => [
                (Identifier, 0..1),
                (ColonColon, 1..3),
                (Identifier, 3..4),
                (Less, 4..5),
                (Identifier, 5..6),
                (Greater, 6..7),
                (Greater, 7..8),
                (Eof, 8..8),
            ],
            "f(...)" => [
                (Identifier, 0..1),
                (LParen, 1..2),
                (Ellipsis, 2..5),
                (RParen, 5..6),
                (Eof, 6..6),
            ],
            "0x1Fu 1.5e-3f 42" => [
                (Number, 0..5),
                (Number, 6..13),
                (Number, 14..16),
                (Eof, 16..16),
            ],
            r#"L"wide" 'c' "s\"q""# => [
                (String, 0..7),
                (CharLiteral, 8..11),
                (String, 12..18),
                (Eof, 18..18),
            ],
        });

        for (input, tokens) in cases {
            let lexed: Vec<_> = lex_in_new("test.h", input)
                .into_iter()
                .map(|t| (t.kind, t.span))
                .collect();
            assert_eq!(&lexed, tokens);
        }
    }

    #[test]
    fn comments_are_dropped() {
        use TokenKind::*;
        assert_eq!(
            kinds("/* block\n comment */ int // line\n x;"),
            [
                (Int, "int".to_string()),
                (Identifier, "x".to_string()),
                (Semicolon, ";".to_string()),
                (Eof, "".to_owned()),
            ]
        );
    }

    #[test]
    fn line_start_and_locations() {
        let tokens = lex_in_new("a.h", "#define X \\\n  1\nint y;");
        let flags: Vec<_> = tokens
            .iter()
            .map(|t| (t.text(), t.line_start, t.loc.line, t.loc.column))
            .collect();
        assert_eq!(
            flags,
            [
                ("#", true, 1, 1),
                ("define", false, 1, 2),
                ("X", false, 1, 9),
                // The line splice keeps `1` on the directive's logical line.
                ("1", false, 2, 3),
                ("int", true, 3, 1),
                ("y", false, 3, 5),
                (";", false, 3, 6),
                ("", false, 3, 7),
            ]
        );
    }

    #[test]
    fn unterminated_literals_and_comments() {
        use TokenKind::*;
        let tokens = kinds("\"abc\nint");
        assert_eq!(tokens[0].0, Error(LexErrorKind::UnclosedString));

        let tokens = kinds("'a");
        assert_eq!(tokens[0].0, Error(LexErrorKind::UnclosedChar));

        // An unterminated block comment ends the token stream.
        let tokens = kinds("int /* never closed");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1].0, Error(LexErrorKind::UnclosedComment));
    }

    #[test]
    fn restart_rewinds() {
        let mut lexer = Lexer::new("a.h", "struct S;");
        let first: Vec<_> = lexer.by_ref().collect();
        assert!(lexer.next().is_none());
        lexer.restart();
        let second: Vec<_> = lexer.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn extract_literals() {
        assert_eq!(extract::int("0x10"), Some(16));
        assert_eq!(extract::int("010"), Some(8));
        assert_eq!(extract::int("2048UL"), Some(2048));
        assert_eq!(extract::int("1.5"), None);
        assert_eq!(extract::float("1.5f"), Some(1.5));
        assert_eq!(extract::string(r#"u8"hi""#), "hi");
        assert_eq!(extract::char(r"'\n'"), Some(10));
    }

    macro_rules! cases {
        (match .. {
            $($str:expr => [$(($kind:expr, $range:expr)),* $(,)?]),* $(,)?
        }) => {{
            &[$((
                $str,
                vec![
                    $(($kind, Span::new_of_bounds($range.start..$range.end))),*
                ],
            )),*]
        }};
    }
    use cases;
}
