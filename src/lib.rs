//! Structural extraction of C and C++ header declarations into a
//! language-neutral model, suitable for generating foreign-language bindings.
//!
//! The pipeline for a single file is
//! [`preprocess`] → [`lexer`] → [`parser`] → [`resolver`], producing a partial
//! [`model::DeclarationModel`]. [`extract`] runs these pipelines for a set of
//! files and merges the partial models deterministically.

/// The lexer takes the source input, mapping it into a sequence of tokens.
pub mod lexer;

/// The preprocessor resolves conditional compilation, includes and macros,
/// producing the flat token stream consumed by the parser.
pub mod preprocess;

/// The parser takes the preprocessed tokens, mapping them into a tree of
/// unresolved declarations.
pub mod parser;

/// The resolver binds every type name of a parsed file to a declaration (or
/// a primitive) and builds the file's declaration model.
pub mod resolver;

pub mod ast;
pub mod config;
pub mod diagnostic;
pub mod extract;
pub mod model;
pub mod token;

pub mod util {
    pub mod fmt;
    #[cfg(test)]
    pub(crate) mod test_utils;

    mod iter;
    pub use iter::*;
}
