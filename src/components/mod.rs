//! Long-running background components owned by a storage.

pub mod expiration;

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

/// A periodic task that runs until cancelled.
#[async_trait]
pub trait BackgroundComponent: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run cycles until `cancel` fires. Failures of a single cycle are
    /// reported and retried on the next one; they never end the loop.
    async fn run(&self, cancel: CancellationToken);
}

/// Handle to spawned background components.
#[derive(Debug)]
pub struct ComponentsHandle {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ComponentsHandle {
    /// Spawn every component on the current tokio runtime.
    pub fn spawn(components: Vec<Arc<dyn BackgroundComponent>>, cancel: CancellationToken) -> Self {
        let handles = components
            .into_iter()
            .map(|component| {
                let name = component.name();
                info!(component = name, "Starting background component");
                let span = info_span!("component", component = name);
                let cancel = cancel.clone();
                tokio::spawn(async move { component.run(cancel).await }.instrument(span))
            })
            .collect();

        Self { cancel, handles }
    }

    /// Number of running components.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every component and wait for them to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Wait for every component to stop on its own.
    pub async fn wait(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background component panicked");
            }
        });
    }
}
