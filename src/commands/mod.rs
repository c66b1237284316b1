pub mod post;
pub mod setup;

pub use post::post;
pub use setup::setup;

use crate::config::{Config, METADATA_API_TOKEN_KEY, METADATA_RETRY_SLEEP};
use crate::error::Result;
use crate::metadata::MetadataClient;

/// The backend token comes from the environment when set, otherwise from
/// instance metadata, which may need a few seconds to publish it after boot.
pub async fn resolve_api_token(config: &Config) -> Result<String> {
    if let Some(token) = &config.api_token {
        return Ok(token.clone());
    }
    tracing::debug!("BUILDER_API_TOKEN not set, reading it from instance metadata");
    let metadata = MetadataClient::new(&config.metadata_url)?;
    metadata
        .retry_get(METADATA_API_TOKEN_KEY, METADATA_RETRY_SLEEP)
        .await
        .map(|token| token.trim().to_string())
}
