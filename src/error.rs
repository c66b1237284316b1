use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required environment value is absent.
    #[error("required configuration `{0}` is not set")]
    Config(&'static str),

    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with {status}: {body}")]
    Backend {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("provisioning backend sent an unusable response: {0}")]
    Protocol(String),

    #[error("gave up reading `{key}` from instance metadata after {attempts} attempts")]
    RetryExhausted { key: String, attempts: u32 },

    #[error("no instance was assigned to build task {task_id} within {waited:?}")]
    ProvisionTimeout { task_id: String, waited: Duration },

    #[error("state store: {0:#}")]
    State(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Error::Network {
            url: url.into(),
            source,
        }
    }
}
