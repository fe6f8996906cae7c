//! Model-load progress callbacks.
//!
//! Native loaders report progress through a C callback that only carries an
//! opaque user-data word. Instead of stashing "the current session" in a global,
//! each load registers its callback in a [`ProgressRegistry`] under a fresh
//! [`ProgressToken`]. The binding hands the token to the native side and resolves
//! it back through the registry when progress arrives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

/// Progress callback: receives a fraction in `[0, 1]`, returns `false` to abort the load.
pub type ProgressCallback = Box<dyn FnMut(f32) -> bool + Send + Sync>;

/// Opaque key for one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressToken(u64);

impl ProgressToken {
    /// The value to pass through a native `user_data` pointer.
    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Default)]
pub struct ProgressRegistry {
    next: AtomicU64,
    callbacks: DashMap<ProgressToken, ProgressCallback>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: ProgressCallback) -> ProgressToken {
        let token = ProgressToken(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.callbacks.insert(token, callback);
        token
    }

    pub fn unregister(&self, token: ProgressToken) -> bool {
        self.callbacks.remove(&token).is_some()
    }

    /// Deliver a progress report. Unknown tokens continue the load.
    pub fn dispatch(&self, token: ProgressToken, progress: f32) -> bool {
        match self.callbacks.get_mut(&token) {
            Some(mut callback) => (callback.value_mut())(progress.clamp(0.0, 1.0)),
            None => {
                trace!("Progress report for unregistered token {:?}", token);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// What a [`crate::engine::Backend`] receives during `load_model`.
///
/// Dropping it unregisters the callback.
pub struct LoadProgress {
    registry: Arc<ProgressRegistry>,
    token: Option<ProgressToken>,
}

impl LoadProgress {
    pub fn new(registry: Arc<ProgressRegistry>, callback: Option<ProgressCallback>) -> Self {
        let token = callback.map(|cb| registry.register(cb));
        Self { registry, token }
    }

    /// A progress sink that ignores every report.
    pub fn silent() -> Self {
        Self {
            registry: Arc::new(ProgressRegistry::new()),
            token: None,
        }
    }

    pub fn token(&self) -> Option<ProgressToken> {
        self.token
    }

    /// Report progress; `false` means the caller asked to abort.
    pub fn report(&self, progress: f32) -> bool {
        match self.token {
            Some(token) => self.registry.dispatch(token, progress),
            None => true,
        }
    }
}

impl Drop for LoadProgress {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.registry.unregister(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_dispatch_routes_by_token() {
        let registry = ProgressRegistry::new();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let seen = seen_a.clone();
            registry.register(Box::new(move |p| {
                seen.lock().unwrap().push(p);
                true
            }))
        };
        let b = {
            let seen = seen_b.clone();
            registry.register(Box::new(move |p| {
                seen.lock().unwrap().push(p);
                p < 0.5
            }))
        };

        assert!(registry.dispatch(a, 0.25));
        assert!(!registry.dispatch(b, 0.75));
        assert_eq!(*seen_a.lock().unwrap(), vec![0.25]);
        assert_eq!(*seen_b.lock().unwrap(), vec![0.75]);

        assert!(registry.dispatch(ProgressToken::from_raw(999), 0.1));
    }

    #[test]
    fn test_load_progress_unregisters_on_drop() {
        let registry = Arc::new(ProgressRegistry::new());
        {
            let progress = LoadProgress::new(registry.clone(), Some(Box::new(|_| false)));
            assert_eq!(registry.len(), 1);
            assert!(!progress.report(0.3));
        }
        assert!(registry.is_empty());
        assert!(LoadProgress::silent().report(1.0));
    }
}
