//! Per-root configuration.

use crate::value::Value;
use std::rc::Rc;
use std::time::Duration;

pub type CloneHook = Rc<dyn Fn(&Value) -> Value>;
pub type CompareHook = Rc<dyn Fn(&Value, &Value) -> bool>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffScope {
    Recurse,
    Skip,
    Shallow,
}

pub type DiffFilterHook = Rc<dyn Fn(&chronicle_path::Path) -> DiffScope>;

/// Mirrors `configure`'s recognized options, each with the default named in
/// the facade.
#[derive(Clone)]
pub struct Options {
    pub merge_ungrouped: bool,
    pub merge_window: Duration,
    pub compact_consecutive_same_path: bool,
    pub max_history: usize,
    pub filter: Option<Rc<dyn Fn(&crate::record::ChangeRecord) -> bool>>,
    pub clone_hook: Option<CloneHook>,
    pub compare_hook: Option<CompareHook>,
    pub diff_filter: Option<DiffFilterHook>,
    pub cache_proxies: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            merge_ungrouped: true,
            merge_window: Duration::from_millis(300),
            compact_consecutive_same_path: true,
            max_history: 1000,
            filter: None,
            clone_hook: None,
            compare_hook: None,
            diff_filter: None,
            cache_proxies: true,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("merge_ungrouped", &self.merge_ungrouped)
            .field("merge_window", &self.merge_window)
            .field("compact_consecutive_same_path", &self.compact_consecutive_same_path)
            .field("max_history", &self.max_history)
            .field("cache_proxies", &self.cache_proxies)
            .finish()
    }
}

/// Builder for [`Options`], following the same incremental-construction
/// idiom the wrapped root's own configuration surface uses.
#[derive(Default)]
pub struct OptionsBuilder(Options);

impl OptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_ungrouped(mut self, value: bool) -> Self {
        self.0.merge_ungrouped = value;
        self
    }

    pub fn merge_window(mut self, value: Duration) -> Self {
        self.0.merge_window = value;
        self
    }

    pub fn compact_consecutive_same_path(mut self, value: bool) -> Self {
        self.0.compact_consecutive_same_path = value;
        self
    }

    pub fn max_history(mut self, value: usize) -> Self {
        self.0.max_history = value;
        self
    }

    pub fn filter(mut self, f: impl Fn(&crate::record::ChangeRecord) -> bool + 'static) -> Self {
        self.0.filter = Some(Rc::new(f));
        self
    }

    pub fn clone_hook(mut self, f: impl Fn(&Value) -> Value + 'static) -> Self {
        self.0.clone_hook = Some(Rc::new(f));
        self
    }

    pub fn compare_hook(mut self, f: impl Fn(&Value, &Value) -> bool + 'static) -> Self {
        self.0.compare_hook = Some(Rc::new(f));
        self
    }

    pub fn diff_filter(mut self, f: impl Fn(&chronicle_path::Path) -> DiffScope + 'static) -> Self {
        self.0.diff_filter = Some(Rc::new(f));
        self
    }

    pub fn cache_proxies(mut self, value: bool) -> Self {
        self.0.cache_proxies = value;
        self
    }

    pub fn build(self) -> Options {
        self.0
    }
}
