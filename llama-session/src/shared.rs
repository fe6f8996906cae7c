//! Async wrapper that lets several tasks share one [`Session`].
//!
//! Predictions are serialised through a `tokio::sync::Mutex` and run on the
//! blocking pool, since decoding is CPU bound and the callback is synchronous.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::Backend;
use crate::error::SessionError;
use crate::generation::{GenerationOutcome, PredictRequest};
use crate::session::Session;

pub struct SharedSession<B: Backend> {
    inner: Arc<Mutex<Session<B>>>,
}

impl<B: Backend> Clone for SharedSession<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B> SharedSession<B>
where
    B: Backend + 'static,
    B::Model: Send + 'static,
    B::Context: Send + 'static,
{
    pub fn new(session: Session<B>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Wait for any running prediction, then run this one.
    pub async fn predict<F>(
        &self,
        request: PredictRequest,
        callback: F,
    ) -> Result<GenerationOutcome, SessionError>
    where
        F: FnMut(&str, f64) -> bool + Send + 'static,
    {
        let guard = self.inner.clone().lock_owned().await;
        run_blocking(guard, request, callback).await
    }

    /// Run a prediction only if the session is idle; otherwise [`SessionError::Busy`].
    pub async fn try_predict<F>(
        &self,
        request: PredictRequest,
        callback: F,
    ) -> Result<GenerationOutcome, SessionError>
    where
        F: FnMut(&str, f64) -> bool + Send + 'static,
    {
        let guard = self.inner.clone().try_lock_owned().map_err(|_| {
            debug!("Session busy; rejecting prediction");
            SessionError::Busy
        })?;
        run_blocking(guard, request, callback).await
    }

    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    pub async fn save_state(&self) -> Result<bool, SessionError> {
        self.inner.lock().await.save_state()
    }

    pub async fn n_past(&self) -> usize {
        self.inner.lock().await.n_past()
    }

    /// Exclusive access for anything not covered above.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Session<B>> {
        self.inner.lock().await
    }
}

async fn run_blocking<B, F>(
    mut guard: tokio::sync::OwnedMutexGuard<Session<B>>,
    request: PredictRequest,
    callback: F,
) -> Result<GenerationOutcome, SessionError>
where
    B: Backend + 'static,
    B::Model: Send + 'static,
    B::Context: Send + 'static,
    F: FnMut(&str, f64) -> bool + Send + 'static,
{
    tokio::task::spawn_blocking(move || guard.predict_request(&request, callback))
        .await
        .map_err(|e| SessionError::Worker(e.to_string()))?
}
