use crate::{
    config::Config,
    extract::{self, SourceMap},
    lexer, parser,
    token::Spanned,
    util::fmt::tree,
};

pub const TEST_FILE: &str = "test.h";

pub fn format_errors(errors: &[Spanned<'_, parser::Error>]) -> Vec<String> {
    errors.iter().map(|e| format!("{e:#}")).collect()
}

/// Each variant contains the header text, which is extracted as `test.h`.
pub enum Test {
    /// Lexes and parses, with no preprocessing.
    Parser(&'static str),
    /// Runs the whole pipeline of a single file.
    Resolver(&'static str),
}

pub enum Assertion {
    TreeOk(&'static str),
    TreeError(&'static str),
    ExpectedErrors(&'static [&'static str]),
}

#[track_caller]
pub fn run_pipeline(test: Test) -> (String, Vec<String>) {
    match test {
        Test::Parser(header) => {
            let tokens = lexer::lex_in_new(TEST_FILE, header);
            let (unit, errors) = match parser::parse_unit(&tokens) {
                Ok(unit) => (unit, vec![]),
                Err((unit, errors)) => (unit, errors),
            };
            let tree = tree::print_unit_string(&unit);
            (tree, format_errors(&errors))
        }
        Test::Resolver(header) => {
            let mut sources = SourceMap::new();
            sources.insert(TEST_FILE, header);
            let outcome = extract::extract_file(&sources, TEST_FILE, &Config::default());
            let tree = outcome
                .model
                .as_ref()
                .map(tree::print_model_string)
                .unwrap_or_default();
            let errors = outcome.diagnostics.iter().map(ToString::to_string).collect();
            (tree, errors)
        }
    }
}

#[track_caller]
pub fn run_assertion(
    assertion: Assertion,
    formatted_actual_tree: &str,
    formatted_actual_errors: &[String],
) {
    match assertion {
        Assertion::TreeOk(expected_tree) => {
            let expected_errors: &[&str] = &[];
            ::pretty_assertions::assert_eq!(formatted_actual_errors, expected_errors);
            ::pretty_assertions::assert_eq!(formatted_actual_tree.trim(), expected_tree.trim());
        }
        Assertion::TreeError(expected_tree) => {
            ::pretty_assertions::assert_eq!(formatted_actual_tree.trim(), expected_tree.trim())
        }
        Assertion::ExpectedErrors(expected_errors) => {
            ::pretty_assertions::assert_eq!(formatted_actual_errors, expected_errors)
        }
    }
}

macro_rules! tree_tests {
    (
        use $test_kind:ident;

        $(
            fn $test_name:ident() {
                let $source_kind:ident = $source:expr;
                $($assertions_tt:tt)*
            }
        )*
    ) => {
        $(
            #[test]
            fn $test_name() {
                let test: crate::util::test_utils::Test =
                    tree_tests!(@@get_test($test_kind, $source_kind), ::indoc::indoc! { $source });
                let (formatted_actual_tree, formatted_actual_errors) =
                    crate::util::test_utils::run_pipeline(test);
                let ctx = (&formatted_actual_tree, &formatted_actual_errors);
                tree_tests!(@@expand_assertions, ctx, [$($assertions_tt)*]);
            }
        )*
    };

    (@@expand_assertions, $ctx:expr, []) => {};
    (@@expand_assertions, $ctx:expr, [
        let $assertion:ident = $assertion_expected:expr;
        $($rest_assertions_tt:tt)*
    ]) => {
        crate::util::test_utils::run_assertion(
            tree_tests!(@@assertion, $assertion, $assertion_expected),
            $ctx.0,
            $ctx.1,
        );
        tree_tests!(@@expand_assertions, $ctx, [$($rest_assertions_tt)*]);
    };

    (@@assertion, tree_ok, $expected:expr) => {
        crate::util::test_utils::Assertion::TreeOk(::indoc::indoc! { $expected })
    };
    (@@assertion, tree_error, $expected:expr) => {
        crate::util::test_utils::Assertion::TreeError(::indoc::indoc! { $expected })
    };
    (@@assertion, expected_errors, $expected:expr) => {
        crate::util::test_utils::Assertion::ExpectedErrors($expected)
    };

    (@@get_test(parser, header), $source:expr) => {
        crate::util::test_utils::Test::Parser($source)
    };
    (@@get_test(resolver, header), $source:expr) => {
        crate::util::test_utils::Test::Resolver($source)
    };
}
pub(crate) use tree_tests;
