mod clock;
mod error;
mod events;
mod ids;
mod queue;
mod retry;
mod signing;
mod store;
mod token;
mod types;
mod urls;

// We privately declare modules and re-export the parts that form the public
// API, so internals can move around without breaking dependent crates.

// Types
pub use types::ImageFormat;
pub use types::Job;
pub use types::JobKind;
pub use types::JobStats;
pub use types::JobStatus;
pub use types::NewJob;
pub use types::QueuedJob;
pub use types::ResultMetadata;
pub use types::RetryType;
pub use types::ScreenshotRequest;

// Clock
pub use clock::Clock;
pub use clock::SystemClock;
pub use clock::TestClock;

// Errors
pub use error::QueueError;
pub use error::StoreError;

// Ids
pub use ids::delivery_id;
pub use ids::job_id;
pub use ids::worker_id;

// Store
pub use store::memory::MemoryJobStore;
pub use store::pg::PgJobStore;
pub use store::JobStore;

// Queue
pub use queue::JobQueue;
pub use queue::MemoryQueue;

// Retry
pub use retry::FailureKind;
pub use retry::RetryPolicy;

// Signing and artifact tokens
pub use signing::sign_payload;
pub use signing::verify_payload;
pub use token::ArtifactTokenizer;
pub use token::TokenError;

// Domain events
pub use events::EventData;
pub use events::EventSink;
pub use events::JobEvent;

// Webhook destination rules, shared by admission and webhook config handling
pub use urls::validate_webhook_url;
pub use urls::WebhookUrlError;
