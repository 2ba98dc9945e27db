//! Runs the per-file pipelines over a set of headers and merges their
//! partial models.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use serde::Serialize;
use tracing::{debug, debug_span, warn};

use crate::{
    config::Config,
    diagnostic::{Diagnostic, ExtractError},
    model::DeclarationModel,
    parser,
    preprocess::{normalize_path, preprocess},
    resolver,
};

/// The headers of an extraction, by path. Iteration follows insertion order,
/// which is also the order files are merged in.
#[derive(Clone, Debug, Default)]
pub struct SourceMap {
    files: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl SourceMap {
    pub fn new() -> SourceMap {
        SourceMap::default()
    }

    /// Adds a file. Adding a path twice replaces its text, keeping its
    /// original position.
    pub fn insert(&mut self, path: impl AsRef<str>, text: impl Into<String>) {
        let path = normalize_path(path.as_ref());
        let text = text.into();
        match self.index.get(&path) {
            Some(&i) => self.files[i].1 = text,
            None => {
                self.index.insert(path.clone(), self.files.len());
                self.files.push((path, text));
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.get_entry(path).map(|(_, text)| text)
    }

    /// Returns the stored path along with the text, so that locations may
    /// borrow the path for as long as the source map lives.
    pub fn get_entry(&self, path: &str) -> Option<(&str, &str)> {
        let i = match self.index.get(path) {
            Some(&i) => i,
            None => *self.index.get(&normalize_path(path))?,
        };
        let (path, text) = &self.files[i];
        Some((path.as_str(), text.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.files.iter().map(|(path, _)| path.as_str())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<P: AsRef<str>, T: Into<String>> FromIterator<(P, T)> for SourceMap {
    fn from_iter<I: IntoIterator<Item = (P, T)>>(iter: I) -> Self {
        let mut sources = SourceMap::new();
        for (path, text) in iter {
            sources.insert(path, text);
        }
        sources
    }
}

/// The result of extracting a single file.
#[derive(Clone, Debug)]
pub struct FileOutcome {
    pub path: String,
    /// `None` if a fatal error dropped the file. The error is then the last
    /// of the diagnostics.
    pub model: Option<DeclarationModel>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Extracts a single file, in isolation from any other file of the map
/// (except for what it includes).
pub fn extract_file(sources: &SourceMap, path: &str, config: &Config) -> FileOutcome {
    let span = debug_span!("extract_file", file = path);
    let _guard = span.enter();

    let mut diagnostics = Vec::new();
    let model = match run_pipeline(sources, path, config, &mut diagnostics) {
        Ok(model) => Some(model),
        Err(error) => {
            warn!(%error, "file dropped");
            diagnostics.push(Diagnostic::from(&error));
            None
        }
    };
    FileOutcome {
        path: path.to_owned(),
        model,
        diagnostics,
    }
}

fn run_pipeline(
    sources: &SourceMap,
    path: &str,
    config: &Config,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<DeclarationModel, ExtractError> {
    let preprocessed = preprocess(sources, path, config, diagnostics)?;

    let unit = match parser::parse_unit(&preprocessed.tokens) {
        Ok(unit) => unit,
        Err((unit, errors)) => {
            diagnostics.extend(errors.iter().map(|e| {
                Diagnostic::new(e.inner.diagnostic_kind(), e.loc, e.inner.to_string())
            }));
            unit
        }
    };
    debug!(items = unit.items.len(), "parsed");

    resolver::resolve(&unit, &preprocessed.constants, config, diagnostics)
}

/// The merged result of an extraction.
#[derive(Clone, Debug, Serialize)]
pub struct Extraction {
    pub model: DeclarationModel,
    /// Diagnostics of every file, in file order.
    pub diagnostics: Vec<Diagnostic>,
    /// Files which were not started because the extraction was cancelled.
    pub cancelled: Vec<String>,
}

/// Extracts the files of a source map on worker threads.
///
/// Each file is extracted independently. The partial models are merged one
/// at a time in source map order, so the result doesn't depend on how the
/// files were scheduled.
#[derive(Clone, Debug)]
pub struct Extractor {
    config: Config,
    cancel: Arc<AtomicBool>,
}

impl Extractor {
    pub fn new(config: Config) -> Extractor {
        Extractor {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares a cancellation flag with the caller. Once set, files which
    /// haven't been started are skipped.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Extractor {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run(&self, sources: &SourceMap) -> Extraction {
        let paths: Vec<&str> = sources.paths().collect();
        let workers = self.config.worker_count(paths.len());
        debug!(files = paths.len(), workers, "extraction started");

        let mut outcomes: Vec<Option<FileOutcome>> = vec![None; paths.len()];
        let next = AtomicUsize::new(0);
        thread::scope(|s| {
            let (next, paths) = (&next, &paths);
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(move || {
                        let mut done = Vec::new();
                        loop {
                            let i = next.fetch_add(1, Ordering::Relaxed);
                            let Some(path) = paths.get(i) else { break };
                            if self.cancel.load(Ordering::Relaxed) {
                                break;
                            }
                            done.push((i, extract_file(sources, path, &self.config)));
                        }
                        done
                    })
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(done) => {
                        for (i, outcome) in done {
                            outcomes[i] = Some(outcome);
                        }
                    }
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
        });

        let mut model = DeclarationModel::new();
        let mut diagnostics = Vec::new();
        let mut cancelled = Vec::new();
        for (path, outcome) in paths.iter().zip(outcomes) {
            let Some(outcome) = outcome else {
                cancelled.push((*path).to_owned());
                continue;
            };
            diagnostics.extend(outcome.diagnostics);
            if let Some(partial) = outcome.model {
                model.merge(partial, &mut diagnostics);
            }
        }
        debug!(
            decls = model.len(),
            diagnostics = diagnostics.len(),
            cancelled = cancelled.len(),
            "extraction merged"
        );
        Extraction {
            model,
            diagnostics,
            cancelled,
        }
    }
}

/// Extracts every file of the source map with the provided configuration.
pub fn extract(sources: &SourceMap, config: &Config) -> Extraction {
    Extractor::new(config.clone()).run(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::DiagnosticKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn source_map_keeps_insertion_order() {
        let mut sources = SourceMap::new();
        sources.insert("b.h", "int b;");
        sources.insert("./a.h", "int a;");
        sources.insert("b.h", "int bb;");
        assert_eq!(sources.paths().collect::<Vec<_>>(), ["b.h", "a.h"]);
        assert_eq!(sources.get("b.h"), Some("int bb;"));
        assert_eq!(sources.get("sub/../a.h"), Some("int a;"));
        assert_eq!(sources.len(), 2);
    }

    #[test]
    fn fatal_errors_drop_only_their_file() {
        let sources: SourceMap = [
            ("good.h", "struct Point { int x; int y; };"),
            ("bad.h", "struct Line { Missing *start; };"),
        ]
        .into_iter()
        .collect();

        let outcome = extract_file(&sources, "bad.h", &Config::default());
        assert!(outcome.model.is_none());
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].kind, DiagnosticKind::UnresolvedType);

        let extraction = extract(&sources, &Config::default());
        assert!(extraction.model.get("Point").is_some());
        assert!(extraction.model.get("Line").is_none());
        assert_eq!(extraction.diagnostics.len(), 1);
    }

    #[test]
    fn cancelled_extractions_report_unstarted_files() {
        let sources: SourceMap = [("a.h", "int a;"), ("b.h", "int b;")].into_iter().collect();
        let extractor = Extractor::new(Config::default());
        extractor.cancel_flag().store(true, Ordering::Relaxed);
        let extraction = extractor.run(&sources);
        assert_eq!(extraction.cancelled, ["a.h", "b.h"]);
        assert!(extraction.model.is_empty());
    }
}
