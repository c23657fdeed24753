use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::LookupError;

/// Ask an address-lookup service for this host's public IP.
pub async fn lookup_public_ip(url: &str, timeout: Duration) -> Result<IpAddr, LookupError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(LookupError::Status(resp.status().as_u16()));
    }
    let body = resp.text().await?;
    parse_lookup_body(&body)
}

fn parse_lookup_body(body: &str) -> Result<IpAddr, LookupError> {
    let trimmed = body.trim();
    trimmed
        .parse::<IpAddr>()
        .map_err(|_| LookupError::InvalidBody(trimmed.chars().take(64).collect()))
}

/// Resolve the host advertised in `ConnectionInfo`. Runs once at startup; the
/// result is cached in `AppState` for the life of the process.
///
/// An explicit `advertised_host` wins. Otherwise the lookup service is asked,
/// falling back to the side-channel bind host when it cannot be reached.
pub async fn resolve_advertised_host(config: &ServerConfig) -> Arc<str> {
    if let Some(host) = config.external_address.advertised_host.as_deref() {
        tracing::info!(host, "Using configured advertised host");
        return Arc::from(host);
    }

    let ext = &config.external_address;
    let timeout = Duration::from_millis(ext.lookup_timeout_ms);
    match lookup_public_ip(&ext.lookup_url, timeout).await {
        Ok(ip) => {
            tracing::info!(%ip, url = %ext.lookup_url, "Resolved external address");
            Arc::from(ip.to_string())
        },
        Err(e) => {
            let fallback = config.side_channel.bind_host.as_str();
            tracing::warn!(
                error = %e,
                url = %ext.lookup_url,
                fallback,
                "External address lookup failed, advertising bind host"
            );
            Arc::from(fallback)
        },
    }
}

/// `host:port` as sent to clients. IPv6 hosts get brackets.
pub fn format_side_channel_address(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{v6}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}
