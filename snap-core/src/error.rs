use thiserror::Error;

/// Errors surfaced by job store backends.
/// Database errors originate from sqlx and are wrapped to provide context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("{command} query failed with: {error}")]
    Query {
        command: String,
        #[source]
        error: sqlx::Error,
    },
    #[error("job {0} no longer exists")]
    RowVanished(String),
    #[error("could not encode stored payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by queue backends.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("ready queue is at capacity ({0} entries)")]
    Full(usize),
    #[error("queue is shut down")]
    Closed,
}
