//! Discovery service client.
//!
//! A member registers with `POST {discovery}/join`, sending its id and the URL
//! map it was configured with. The service answers with the authoritative
//! URL map for the cluster being formed.

use crate::error::{Result, TesseraError};
use crate::types::Id;
use reqwest::{Client, Proxy};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: Id,
    pub cluster: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub cluster: String,
}

fn join_error(reason: impl Into<String>) -> TesseraError {
    TesseraError::Discovery {
        op: "join".to_string(),
        reason: reason.into(),
    }
}

/// Register `id` with the discovery service and return the cluster URL map string.
pub async fn join_cluster(
    url: &str,
    proxy: Option<&str>,
    id: Id,
    cluster: &str,
    timeout: Duration,
) -> Result<String> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
        let proxy = Proxy::all(proxy).map_err(|e| join_error(format!("invalid proxy: {}", e)))?;
        builder = builder.proxy(proxy);
    }
    let client = builder.build().map_err(|e| join_error(e.to_string()))?;

    let endpoint = format!("{}/join", url.trim_end_matches('/'));
    let request = JoinRequest {
        id,
        cluster: cluster.to_string(),
    };

    let response = client
        .post(&endpoint)
        .json(&request)
        .send()
        .await
        .map_err(|e| join_error(e.to_string()))?;

    if !response.status().is_success() {
        return Err(join_error(format!(
            "{} answered with {}",
            endpoint,
            response.status()
        )));
    }

    let body: JoinResponse = response
        .json()
        .await
        .map_err(|e| join_error(format!("bad response: {}", e)))?;

    info!(discovery_url = %url, member_id = %id, cluster = %body.cluster, "Joined through discovery");
    Ok(body.cluster)
}
