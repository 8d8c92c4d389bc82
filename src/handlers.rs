use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

/// Callback run on the driver's event thread with the triggering pin id.
pub type EdgeCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Named edge callbacks. Pin definitions refer to these by name and the
/// names are resolved once, when pins are configured.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: FxHashMap<String, EdgeCallback>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.insert(name, callback);
        self
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(callback));
    }

    pub fn resolve(&self, name: &str) -> Option<EdgeCallback> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HandlerSet").field("handlers", &names).finish()
    }
}
