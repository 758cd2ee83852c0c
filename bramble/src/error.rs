use std::io;

use thiserror::Error;

pub use bramble_api::ExecuteError;

/// Errors raised while building or tearing down a [`ThreadPool`](crate::ThreadPool).
///
/// Per-task rejection is reported separately through [`ExecuteError`].
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("Worker {0} terminated abnormally")]
    WorkerTerminated(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = PoolError::InvalidConfig("worker_count must be at least 1".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: worker_count must be at least 1");

        let err = PoolError::Spawn(io::Error::new(io::ErrorKind::Other, "no threads left"));
        assert!(std::error::Error::source(&err).is_some());

        assert_eq!(
            PoolError::WorkerTerminated(3).to_string(),
            "Worker 3 terminated abnormally"
        );
    }
}
