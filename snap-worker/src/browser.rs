use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::renderer::{RenderError, Renderer, RendererFactory};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no renderer available within {0:?}")]
    Exhausted(Duration),
    #[error("pool is shut down")]
    Closed,
    #[error("failed to start renderer: {0}")]
    Startup(#[from] RenderError),
}

/// A bounded pool of reusable renderer instances. The semaphore caps true
/// render parallelism; instances are created lazily and replaced lazily when
/// one is discarded as unhealthy.
pub struct BrowserPool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Renderer>>>,
    factory: Box<dyn RendererFactory>,
    capacity: usize,
}

/// An exclusive claim on one renderer. Must go back through
/// [`BrowserPool::give_back`], healthy or not, so the slot frees up.
pub struct BrowserLease {
    renderer: Box<dyn Renderer>,
    permit: OwnedSemaphorePermit,
}

impl BrowserLease {
    pub fn renderer(&self) -> &dyn Renderer {
        self.renderer.as_ref()
    }
}

impl BrowserPool {
    pub fn new(factory: Box<dyn RendererFactory>, capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::with_capacity(capacity)),
            factory,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim a renderer, waiting at most `wait` for a slot.
    pub async fn checkout(&self, wait: Duration) -> Result<BrowserLease, PoolError> {
        let permit = match tokio::time::timeout(wait, self.permits.clone().acquire_owned()).await
        {
            Err(_) => {
                metrics::counter!("browser_pool_exhausted_total").increment(1);
                return Err(PoolError::Exhausted(wait));
            }
            Ok(Err(_)) => return Err(PoolError::Closed),
            Ok(Ok(permit)) => permit,
        };

        let reused = self.idle.lock().unwrap().pop();
        let renderer = match reused {
            Some(renderer) => renderer,
            // Permit drops on error, freeing the slot for the next caller.
            None => self.factory.create().await?,
        };
        Ok(BrowserLease { renderer, permit })
    }

    /// Return a renderer. Healthy instances go back on the idle list;
    /// unhealthy ones are closed and their slot refills lazily.
    pub async fn give_back(&self, lease: BrowserLease, healthy: bool) {
        let BrowserLease { renderer, permit } = lease;
        if healthy && renderer.is_healthy().await {
            self.idle.lock().unwrap().push(renderer);
        } else {
            debug!("discarding unhealthy renderer");
            metrics::counter!("browser_pool_discarded_total").increment(1);
            renderer.close().await;
        }
        drop(permit);
    }

    pub async fn shutdown(&self) {
        self.permits.close();
        let drained: Vec<Box<dyn Renderer>> = std::mem::take(&mut *self.idle.lock().unwrap());
        for renderer in drained {
            renderer.close().await;
        }
    }
}
