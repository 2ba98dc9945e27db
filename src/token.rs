use std::{borrow::Cow, fmt, ops::Range};

/// A lexed token. Its text is borrowed from the source map, except for tokens
/// synthesized by the preprocessor (stringification, pasting, configuration
/// flags), which own their text.
#[derive(Clone, PartialEq, Eq)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub text: Cow<'src, str>,
    pub span: Span,
    pub loc: Location<'src>,
    /// Whether this is the first token of its (logical) line.
    pub line_start: bool,
    /// Whether this token is preceded by whitespace or a comment.
    pub spaced: bool,
}

impl<'src> Token<'src> {
    pub fn new(kind: TokenKind, text: impl Into<Cow<'src, str>>, span: Span, loc: Location<'src>) -> Self {
        Token {
            kind,
            text: text.into(),
            span,
            loc,
            line_start: false,
            spaced: false,
        }
    }

    /// A token with no source position, such as the body of a macro defined
    /// from the configuration.
    pub fn synthetic(kind: TokenKind, text: impl Into<Cow<'src, str>>) -> Self {
        Token::new(kind, text, Span::new_of_length(0, 0), Location::SYNTHETIC)
    }

    pub fn eof(loc: Location<'src>) -> Self {
        Token::new(TokenKind::Eof, "", Span::new_of_length(0, 0), loc)
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Wraps the provided value with this token's span and location.
    pub fn wrap<T>(&self, inner: T) -> Spanned<'src, T> {
        Spanned {
            inner,
            span: self.span,
            loc: self.loc,
        }
    }

    /// Returns the same token, detached from the source lifetime.
    pub fn into_owned(self) -> Token<'static> {
        Token {
            kind: self.kind,
            text: Cow::Owned(self.text.into_owned()),
            span: self.span,
            loc: Location::SYNTHETIC,
            line_start: self.line_start,
            spaced: self.spaced,
        }
    }
}

impl fmt::Debug for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:?}, {:?}, {})", self.kind, self.text, self.span)
    }
}

/// Spells tokens back as source text, separating them where the source had
/// whitespace.
pub fn spell(tokens: &[Token<'_>]) -> String {
    let mut text = String::new();
    for (i, t) in tokens.iter().enumerate() {
        if i > 0 && t.spaced {
            text.push(' ');
        }
        text.push_str(t.text());
    }
    text
}

/// A value paired with the source position it was produced from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<'src, T> {
    pub inner: T,
    pub span: Span,
    pub loc: Location<'src>,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Span {
    pub len: u32,
    pub lo: usize,
}

impl Span {
    pub fn new_of_bounds(Range { start: lo, end: hi }: Range<usize>) -> Span {
        debug_assert!(hi >= lo);
        Self::new_of_length(lo, u32::try_from(hi - lo).unwrap_or(u32::MAX))
    }

    pub fn new_of_length(lo: usize, len: u32) -> Span {
        Span { len, lo }
    }

    pub fn hi(self) -> usize {
        self.lo + self.len as usize
    }

    /// Returns a span covering both spans (and everything in between).
    pub fn to(self, other: Span) -> Span {
        let lo = self.lo.min(other.lo);
        let hi = self.hi().max(other.hi());
        Span::new_of_bounds(lo..hi)
    }

    pub fn substr(self, src: &str) -> &str {
        &src[self.lo..self.hi()]
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Span({self}, len: {})", self.len)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lo = self.lo;
        let hi = self.hi();
        write!(f, "{lo}..{hi}")
    }
}

/// A position in some file of the source map. Lines and columns are 1-based.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Location<'src> {
    pub file: &'src str,
    pub line: u32,
    pub column: u32,
}

impl Location<'_> {
    pub const SYNTHETIC: Location<'static> = Location {
        file: "<built-in>",
        line: 0,
        column: 0,
    };
}

impl fmt::Display for Location<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Keywords
    Struct,
    Class,
    Union,
    Enum,
    Typedef,
    Namespace,
    Template,
    Typename,
    Using,
    Operator,
    Extern,
    Static,
    Inline,
    Virtual,
    Explicit,
    Friend,
    Mutable,
    Constexpr,
    Register,
    Const,
    Volatile,
    Restrict,
    Public,
    Protected,
    Private,
    Void,
    Bool,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Signed,
    Unsigned,
    True,
    False,
    /// `__attribute__`, `__declspec`, `alignas` and friends.
    AttributeKeyword,

    Identifier,
    Number,
    String,
    CharLiteral,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Colon,
    /// `::`
    ColonColon,
    /// `...`
    Ellipsis,
    Dot,
    /// `->`
    Arrow,
    Question,
    Star,
    Amp,
    AmpAmp,
    Pipe,
    PipePipe,
    Caret,
    Tilde,
    Bang,
    Eq,
    EqEq,
    NotEq,
    Less,
    LessEq,
    /// `<<`. Notice that `>>` is never produced: two [`TokenKind::Greater`]
    /// are lexed instead, which keeps nested template argument lists simple.
    LessLess,
    Greater,
    GreaterEq,
    Plus,
    PlusPlus,
    Minus,
    MinusMinus,
    Slash,
    Percent,
    /// Any compound assignment (`+=`, `<<=`, ...).
    OpAssign,
    Hash,
    HashHash,
    /// A character outside of the language's character set.
    Unknown,

    Eof,
    Error(LexErrorKind),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LexErrorKind {
    UnclosedString,
    UnclosedChar,
    UnclosedComment,
}

impl fmt::Display for LexErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LexErrorKind::UnclosedString => "unterminated string literal",
            LexErrorKind::UnclosedChar => "unterminated character literal",
            LexErrorKind::UnclosedComment => "unterminated block comment",
        })
    }
}

impl TokenKind {
    /// Whether the token is spelled like an identifier, which makes it a
    /// candidate for macro names.
    pub fn is_word(self) -> bool {
        matches!(self, TokenKind::Identifier) || KEYWORDS.values().any(|k| *k == self)
    }

    /// Whether this keyword names (part of) a builtin arithmetic type.
    pub fn is_primitive(self) -> bool {
        use TokenKind::*;
        matches!(
            self,
            Void | Bool | Char | Short | Int | Long | Float | Double | Signed | Unsigned
        )
    }

    pub fn is_error(self) -> bool {
        matches!(self, TokenKind::Error(_))
    }
}

pub static KEYWORDS: phf::Map<&'static str, TokenKind> = phf::phf_map! {
    "struct" => TokenKind::Struct,
    "class" => TokenKind::Class,
    "union" => TokenKind::Union,
    "enum" => TokenKind::Enum,
    "typedef" => TokenKind::Typedef,
    "namespace" => TokenKind::Namespace,
    "template" => TokenKind::Template,
    "typename" => TokenKind::Typename,
    "using" => TokenKind::Using,
    "operator" => TokenKind::Operator,
    "extern" => TokenKind::Extern,
    "static" => TokenKind::Static,
    "inline" => TokenKind::Inline,
    "__inline" => TokenKind::Inline,
    "__inline__" => TokenKind::Inline,
    "virtual" => TokenKind::Virtual,
    "explicit" => TokenKind::Explicit,
    "friend" => TokenKind::Friend,
    "mutable" => TokenKind::Mutable,
    "constexpr" => TokenKind::Constexpr,
    "register" => TokenKind::Register,
    "const" => TokenKind::Const,
    "__const" => TokenKind::Const,
    "volatile" => TokenKind::Volatile,
    "restrict" => TokenKind::Restrict,
    "__restrict" => TokenKind::Restrict,
    "__restrict__" => TokenKind::Restrict,
    "public" => TokenKind::Public,
    "protected" => TokenKind::Protected,
    "private" => TokenKind::Private,
    "void" => TokenKind::Void,
    "bool" => TokenKind::Bool,
    "_Bool" => TokenKind::Bool,
    "char" => TokenKind::Char,
    "short" => TokenKind::Short,
    "int" => TokenKind::Int,
    "long" => TokenKind::Long,
    "float" => TokenKind::Float,
    "double" => TokenKind::Double,
    "signed" => TokenKind::Signed,
    "__signed__" => TokenKind::Signed,
    "unsigned" => TokenKind::Unsigned,
    "true" => TokenKind::True,
    "false" => TokenKind::False,
    "__attribute__" => TokenKind::AttributeKeyword,
    "__attribute" => TokenKind::AttributeKeyword,
    "__declspec" => TokenKind::AttributeKeyword,
    "alignas" => TokenKind::AttributeKeyword,
    "_Alignas" => TokenKind::AttributeKeyword,
};
