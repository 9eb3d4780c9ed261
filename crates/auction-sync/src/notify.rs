use std::collections::BTreeMap;

use async_trait::async_trait;
use auction_storage::HttpFetcher;
use serde_json::json;
use tracing::{info, warn};

/// Sink for operator alerts. Delivery problems are logged, never returned.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, command: &str, error: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, command: &str, error: &str) {
        info!(command, error, "notification (no sink configured)");
    }
}

pub fn host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "unknown-host".to_string())
}

pub fn format_alert(host: &str, command: &str, error: &str) -> String {
    format!("[{host}] {command} failed: {error}")
}

/// Posts `{"text": ...}` to a chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: HttpFetcher,
    url: String,
    host: String,
}

impl WebhookNotifier {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            host: host_name(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, command: &str, error: &str) {
        let body = json!({ "text": format_alert(&self.host, command, error) });
        if let Err(err) = self
            .http
            .post_json("notify", &self.url, &BTreeMap::new(), &body)
            .await
        {
            warn!(command, error = %err, "failed to deliver notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_names_host_command_and_error() {
        assert_eq!(
            format_alert("ingest-box", "ingest pickles_sale_info", "bulk insert failed"),
            "[ingest-box] ingest pickles_sale_info failed: bulk insert failed"
        );
        assert!(!host_name().is_empty());
    }
}
