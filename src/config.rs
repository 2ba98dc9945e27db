use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroUsize,
};

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_TYPEDEF_DEPTH: usize = 32;
pub const DEFAULT_MAX_INCLUDE_DEPTH: usize = 64;

/// Per-invocation extraction settings.
///
/// A platform flag set to `true` is predefined as an object-like macro
/// expanding to `1`; one set to `false` starts undefined. Macros named in
/// `stripped_macros` (typically export/visibility decorations) are removed
/// from declarations along with their argument list, if any.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub platform_flags: BTreeMap<String, bool>,
    pub stripped_macros: BTreeSet<String>,
    pub max_typedef_depth: usize,
    pub max_include_depth: usize,
    /// Number of worker threads. Defaults to the available parallelism.
    pub workers: Option<NonZeroUsize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            platform_flags: BTreeMap::new(),
            stripped_macros: BTreeSet::new(),
            max_typedef_depth: DEFAULT_MAX_TYPEDEF_DEPTH,
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
            workers: None,
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_flag(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.platform_flags.insert(name.into(), enabled);
        self
    }

    #[must_use]
    pub fn with_stripped_macro(mut self, name: impl Into<String>) -> Self {
        self.stripped_macros.insert(name.into());
        self
    }

    #[must_use]
    pub fn with_max_typedef_depth(mut self, depth: usize) -> Self {
        self.max_typedef_depth = depth;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn is_stripped(&self, name: &str) -> bool {
        self.stripped_macros.contains(name)
    }

    pub(crate) fn worker_count(&self, files: usize) -> usize {
        let available = self
            .workers
            .or_else(|| std::thread::available_parallelism().ok())
            .map_or(1, NonZeroUsize::get);
        available.min(files).max(1)
    }
}
