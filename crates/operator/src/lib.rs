pub mod backoff;
pub mod client;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod kubernetes;
pub mod lifecycle;
pub mod metrics;
pub mod server;
pub mod store;
pub mod topology;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(String),
    #[error("Cluster API unavailable: {0}")]
    Unavailable(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Job {name} failed: {message}")]
    JobFailed { name: String, message: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors worth retrying with backoff; never surfaced as a job failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kubernetes(_) | Error::Unavailable(_) | Error::Io(_) | Error::Timeout(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) => match resp.code {
                404 => Error::NotFound(resp.message.clone()),
                409 if resp.reason == "AlreadyExists" => Error::AlreadyExists(resp.message.clone()),
                409 => Error::Conflict(resp.message.clone()),
                400 | 422 => Error::InvalidSpec(resp.message.clone()),
                429 | 500..=599 => Error::Unavailable(resp.message.clone()),
                _ => Error::Kubernetes(err.to_string()),
            },
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                Error::Unavailable(err.to_string())
            }
            _ => Error::Kubernetes(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Unavailable("api down".into()).is_transient());
        assert!(Error::Kubernetes("connection reset".into()).is_transient());
        assert!(!Error::InvalidSpec("no replicas".into()).is_transient());
        assert!(!Error::Conflict("stale".into()).is_transient());
        assert!(Error::NotFound("pod".into()).is_not_found());
    }
}
