//! Facts about the host that get injected into every container.

use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use crate::error::RuntimeError;

const EC2_PUBLIC_HOSTNAME_URL: &str = "http://169.254.169.254/latest/meta-data/public-hostname";
const LOOPBACK: &str = "127.0.0.1";

/// Public hostname from the EC2 instance metadata service.
pub async fn ec2_public_hostname(timeout: Duration) -> Result<String, RuntimeError> {
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RuntimeError::Metadata(e.to_string()))?;
    let response = client
        .get(EC2_PUBLIC_HOSTNAME_URL)
        .send()
        .await
        .map_err(|e| RuntimeError::Metadata(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(RuntimeError::Metadata(format!("metadata service returned {status}")));
    }
    let body = response
        .text()
        .await
        .map_err(|e| RuntimeError::Metadata(e.to_string()))?;
    let hostname = body.trim();
    if hostname.is_empty() {
        return Err(RuntimeError::Metadata("empty public hostname".into()));
    }
    Ok(hostname.to_string())
}

/// Public hostname, or the loopback address when not running on EC2.
pub async fn public_hostname_or_loopback(timeout: Duration) -> String {
    match ec2_public_hostname(timeout).await {
        Ok(hostname) => hostname,
        Err(err) => {
            warn!(%err, "unable to determine public hostname, not on AWS?");
            LOOPBACK.to_string()
        }
    }
}
