pub mod artifacts;
pub mod browser;
pub mod config;
pub mod metrics;
pub mod renderer;
pub mod scanners;
pub mod worker;

pub use artifacts::{LocalDiskStore, MemoryObjectStore, ObjectStore, ObjectStoreError};
pub use browser::{BrowserLease, BrowserPool, PoolError};
pub use renderer::{
    HttpRenderer, HttpRendererFactory, RenderError, RenderOutput, Renderer, RendererFactory,
};
pub use scanners::{ScannerConfig, Scanners};
pub use worker::{JobRunner, RunnerConfig, WorkerPool, WorkerPoolConfig};
