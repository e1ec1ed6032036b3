/// Public address detection for control plane allow-lists
use anyhow::{Context, Result};
use std::net::IpAddr;
use std::time::Duration;

const IP_ECHO_URL: &str = "https://ipv4.icanhazip.com";

/// Get current public IP address
pub async fn get_current_ip() -> Result<IpAddr> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(IP_ECHO_URL)
        .send()
        .await
        .context("Failed to get current IP address")?
        .error_for_status()
        .context("IP lookup service returned an error")?;

    let body = response
        .text()
        .await
        .context("Failed to read IP address response")?;

    body.trim()
        .parse()
        .with_context(|| format!("Unexpected IP address response: {}", body.trim()))
}

/// Single-host CIDR block for an address
pub fn host_cidr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}/32", v4),
        IpAddr::V6(v6) => format!("{}/128", v6),
    }
}
