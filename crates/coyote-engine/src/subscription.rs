//! Scoped event listeners.
//!
//! A [`Subscription`] owns the listener tasks registered through it and
//! detaches all of them when closed or dropped.

use std::future::Future;
use std::ops::ControlFlow;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Owner of a set of listener tasks.
#[derive(Debug, Default)]
pub struct Subscription {
    handles: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Empty subscription.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `handler` for every event on `rx` until it breaks, the channel
    /// closes, or the subscription is dropped. Lagged events are skipped.
    pub fn listen<E, F, Fut>(&mut self, mut rx: broadcast::Receiver<E>, mut handler: F)
    where
        E: Clone + Send + 'static,
        F: FnMut(E) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send,
    {
        self.handles.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if handler(event).await.is_break() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Number of listeners still running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Detach every listener.
    pub fn close(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
