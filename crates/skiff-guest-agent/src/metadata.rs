//! Boot metadata discovery.
//!
//! Real guests read the node-supplied metadata from the VMM's metadata
//! service. Sandboxless runs inject the same document through the
//! `SKIFF_GUEST_METADATA` environment variable.

use hyper::{Body, Client, Request};
use skiff_proto::GuestMetadata;

/// Well-known MMDS address inside a Firecracker guest.
const MMDS_URL: &str = "http://169.254.169.254/";

/// Errors during metadata discovery.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata fetch failed: {0}")]
    Fetch(String),

    #[error("metadata did not decode: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Load the guest metadata from the environment or the metadata service.
pub async fn load() -> Result<GuestMetadata, MetadataError> {
    if let Ok(raw) = std::env::var("SKIFF_GUEST_METADATA") {
        tracing::debug!("Loading guest metadata from environment");
        return Ok(serde_json::from_str(&raw)?);
    }
    fetch_mmds().await
}

async fn fetch_mmds() -> Result<GuestMetadata, MetadataError> {
    tracing::debug!(url = MMDS_URL, "Fetching guest metadata from MMDS");
    let request = Request::builder()
        .uri(MMDS_URL)
        .header("Accept", "application/json")
        .body(Body::empty())
        .map_err(|e| MetadataError::Fetch(e.to_string()))?;

    let client = Client::new();
    let response = client
        .request(request)
        .await
        .map_err(|e| MetadataError::Fetch(e.to_string()))?;
    if !response.status().is_success() {
        return Err(MetadataError::Fetch(format!(
            "MMDS returned {}",
            response.status()
        )));
    }

    let bytes = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|e| MetadataError::Fetch(e.to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_common::VmId;

    #[tokio::test]
    async fn test_load_from_environment() {
        let vm_id = VmId::new();
        let raw = format!(
            r#"{{
                "node_nats_host": "127.0.0.1",
                "node_nats_port": 9222,
                "node_nats_nkey_seed": "SUASTEST",
                "vm_id": "{vm_id}"
            }}"#
        );
        std::env::set_var("SKIFF_GUEST_METADATA", &raw);
        let metadata = load().await.expect("loads from env");
        std::env::remove_var("SKIFF_GUEST_METADATA");

        assert_eq!(metadata.vm_id, vm_id);
        assert_eq!(metadata.node_nats_port, 9222);
        assert_eq!(metadata.node_nats_nkey_seed, "SUASTEST");
        assert!(metadata.message.is_none());
    }
}
