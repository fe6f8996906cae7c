//! Single-owner wrapper for native resources.
//!
//! [`NativeHandle`] holds a model, decode context or batch buffer and tracks
//! whether it has been released. After [`NativeHandle::release`] every access
//! returns [`SessionError::InvalidHandle`] instead of touching freed memory, and a
//! second release is a no-op.

use tracing::debug;

use crate::error::SessionError;

#[derive(Debug)]
pub struct NativeHandle<T> {
    kind: &'static str,
    slot: Option<T>,
}

impl<T> NativeHandle<T> {
    /// Take ownership of a live resource.
    pub fn new(kind: &'static str, value: T) -> Self {
        Self {
            kind,
            slot: Some(value),
        }
    }

    /// What this handle owns, for diagnostics ("model", "context", "batch").
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        self.slot.is_some()
    }

    pub fn get(&self) -> Result<&T, SessionError> {
        self.slot.as_ref().ok_or(SessionError::InvalidHandle(self.kind))
    }

    pub fn get_mut(&mut self) -> Result<&mut T, SessionError> {
        self.slot.as_mut().ok_or(SessionError::InvalidHandle(self.kind))
    }

    /// Drop the resource now. Returns `true` if something was released.
    pub fn release(&mut self) -> bool {
        match self.slot.take() {
            Some(value) => {
                drop(value);
                debug!("Released {} handle", self.kind);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_is_idempotent() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut handle = NativeHandle::new("context", Counted(drops.clone()));
        assert!(handle.is_live());

        assert!(handle.release());
        assert!(!handle.release());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_access_after_release_fails() {
        let mut handle = NativeHandle::new("model", 5u32);
        assert_eq!(*handle.get().unwrap(), 5);
        *handle.get_mut().unwrap() = 6;
        assert_eq!(*handle.get().unwrap(), 6);

        handle.release();
        assert!(matches!(handle.get(), Err(SessionError::InvalidHandle("model"))));
        assert!(matches!(
            handle.get_mut(),
            Err(SessionError::InvalidHandle("model"))
        ));
    }
}
