//! Driver for protocol libraries with a blocking API.
//!
//! The session object lives behind a std mutex and every call runs on the
//! blocking thread pool. A call abandoned by a timed-out caller still runs
//! to completion on its thread; its result is simply dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use remotesync_common::{Error, Result};

pub(crate) struct BlockingSession<S> {
    inner: Arc<Mutex<Option<S>>>,
    connected: Arc<AtomicBool>,
}

impl<S: Send + 'static> BlockingSession<S> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open a session with `open`, replacing any previous one.
    pub(crate) async fn open<F>(&self, open: F) -> Result<()>
    where
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let inner = self.inner.clone();
        let connected = self.connected.clone();
        tokio::task::spawn_blocking(move || {
            let session = open()?;
            let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = Some(session);
            connected.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .map_err(|e| Error::Remote(format!("Session task failed: {}", e)))?
    }

    /// Run `f` against the open session.
    ///
    /// A connection-class failure clears the liveness flag.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let session = guard
                .as_mut()
                .ok_or_else(|| Error::Connection("Client is closed".to_string()))?;
            f(session)
        })
        .await
        .map_err(|e| Error::Remote(format!("Session task failed: {}", e)))?;

        if let Err(err) = &result {
            if err.is_connection_error() {
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    /// Take the session out and hand it to `close`. Errors are swallowed.
    pub(crate) async fn close<F>(&self, close: F)
    where
        F: FnOnce(S) + Send + 'static,
    {
        self.connected.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let session = inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(session) = session {
                close(session);
            }
        })
        .await;
    }
}
