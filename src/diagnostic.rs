use std::fmt;

use serde::{Deserialize, Serialize};

use crate::token::{LexErrorKind, Location};

/// A line and column within some file. Both are 1-based; built-in positions
/// (such as configuration-defined macros) use `0:0`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl From<Location<'_>> for Position {
    fn from(loc: Location<'_>) -> Self {
        Position {
            line: loc.line,
            column: loc.column,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// Malformed token. Fatal for the file.
    LexError,
    /// A declaration the parser could not recognize; the file continues.
    SkippedDeclaration,
    /// A function-like macro in declaration position, not in the allow-list.
    UnsupportedMacro,
    /// A type name with no declaration. Fatal for the file.
    UnresolvedType,
    /// A typedef chain with no terminal type. Fatal for the file.
    CyclicTypedef,
    /// The same qualified name with a materially different definition. The
    /// first definition wins.
    ConflictingRedeclaration,
    /// A specialization whose primary template was never seen.
    OrphanedSpecialization,
    /// A well-formed declaration with no counterpart in the model, such as
    /// an alias or variable template.
    UnmodeledDeclaration,
    /// `#error` in a live branch.
    ErrorDirective,
    /// `#warning` in a live branch.
    WarningDirective,
    UnbalancedConditional,
    IncludeDepthExceeded,
    MalformedDirective,
}

impl DiagnosticKind {
    pub fn severity(self) -> Severity {
        use DiagnosticKind::*;
        match self {
            LexError | UnresolvedType | CyclicTypedef | ErrorDirective => Severity::Error,
            SkippedDeclaration
            | UnsupportedMacro
            | ConflictingRedeclaration
            | WarningDirective
            | UnbalancedConditional
            | IncludeDepthExceeded
            | MalformedDirective => Severity::Warning,
            OrphanedSpecialization | UnmodeledDeclaration => Severity::Note,
        }
    }
}

/// A non-fatal (or converted fatal) finding, reported alongside the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub file: String,
    pub location: Position,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, loc: Location<'_>, message: impl Into<String>) -> Diagnostic {
        Diagnostic::at(kind, loc.file, loc.into(), message)
    }

    pub fn at(
        kind: DiagnosticKind,
        file: impl Into<String>,
        location: Position,
        message: impl Into<String>,
    ) -> Diagnostic {
        Diagnostic {
            severity: kind.severity(),
            kind,
            file: file.into(),
            location,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Diagnostic {
            severity,
            kind,
            file,
            location,
            message,
        } = self;
        write!(f, "{file}:{location}: {severity}: {message} [{kind:?}]")
    }
}

/// Errors which abort the extraction of a single file.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("{file}:{location}: {kind}")]
    Lex {
        file: String,
        location: Position,
        kind: LexErrorKind,
    },

    #[error("{file}:{location}: unresolved type `{name}`")]
    UnresolvedType {
        file: String,
        location: Position,
        name: String,
    },

    #[error("{file}:{location}: typedef `{name}` does not reach a terminal type within {depth} steps")]
    CyclicTypedef {
        file: String,
        location: Position,
        name: String,
        depth: usize,
    },
}

impl ExtractError {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            ExtractError::Lex { .. } => DiagnosticKind::LexError,
            ExtractError::UnresolvedType { .. } => DiagnosticKind::UnresolvedType,
            ExtractError::CyclicTypedef { .. } => DiagnosticKind::CyclicTypedef,
        }
    }
}

impl From<&ExtractError> for Diagnostic {
    fn from(error: &ExtractError) -> Self {
        let (file, location, message) = match error {
            ExtractError::Lex {
                file,
                location,
                kind,
            } => (file, *location, kind.to_string()),
            ExtractError::UnresolvedType {
                file,
                location,
                name,
            } => (file, *location, format!("unresolved type `{name}`")),
            ExtractError::CyclicTypedef {
                file,
                location,
                name,
                depth,
            } => (
                file,
                *location,
                format!("typedef `{name}` does not reach a terminal type within {depth} steps"),
            ),
        };
        Diagnostic::at(error.kind(), file.clone(), location, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fatal_errors_become_one_diagnostic() {
        let error = ExtractError::UnresolvedType {
            file: "a.h".into(),
            location: Position { line: 3, column: 5 },
            name: "Missing".into(),
        };
        let diagnostic = Diagnostic::from(&error);
        assert_eq!(diagnostic.severity, Severity::Error);
        assert_eq!(
            diagnostic.to_string(),
            "a.h:3:5: error: unresolved type `Missing` [UnresolvedType]"
        );
        assert_eq!(error.to_string(), "a.h:3:5: unresolved type `Missing`");
    }

    #[test]
    fn orphaned_specializations_are_notes() {
        assert_eq!(
            DiagnosticKind::OrphanedSpecialization.severity(),
            Severity::Note
        );
        assert_eq!(
            DiagnosticKind::ConflictingRedeclaration.severity(),
            Severity::Warning
        );
    }
}
