//! Pushing resolved addresses into the router's firewall address list.
//!
//! The resolver reports addresses through [`AddressSink::report`], which
//! never blocks: [`AddressReporter`] queues the report and a worker task
//! upserts each address through the RouterOS REST API.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::error::SyncError;

/// Reports waiting for the router before new ones are dropped.
const REPORT_QUEUE_CAPACITY: usize = 1024;

/// Fallback used when a RouterOS duration cannot be parsed.
const DEFAULT_ENTRY_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

/// Addresses resolved for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressReport {
    pub domain: String,
    pub address: Vec<String>,
}

/// Receiver of resolved addresses. Implementations must not block.
pub trait AddressSink: Send + Sync {
    fn report(&self, report: AddressReport);
}

/// Sink used when no router is configured.
pub struct LogSink;

impl AddressSink for LogSink {
    fn report(&self, report: AddressReport) {
        info!(domain = %report.domain, addresses = ?report.address, "resolved");
    }
}

/// Parse a RouterOS duration such as `2h`, `5m11s` or `1h30m`.
///
/// Anything else yields 24 hours.
pub fn parse_router_timeout(value: &str) -> Duration {
    let mut total = 0u64;
    let mut digits = String::new();
    let mut last_unit = 0;

    for ch in value.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let (rank, seconds) = match ch {
            'h' => (1, 3600),
            'm' => (2, 60),
            's' => (3, 1),
            _ => return DEFAULT_ENTRY_TIMEOUT,
        };
        // Units must appear in h, m, s order, each at most once.
        if digits.is_empty() || rank <= last_unit {
            return DEFAULT_ENTRY_TIMEOUT;
        }
        let Ok(amount) = digits.parse::<u64>() else {
            return DEFAULT_ENTRY_TIMEOUT;
        };
        total = total.saturating_add(amount.saturating_mul(seconds));
        digits.clear();
        last_unit = rank;
    }

    if !digits.is_empty() || last_unit == 0 {
        return DEFAULT_ENTRY_TIMEOUT;
    }
    Duration::from_secs(total)
}

/// Render a duration the way RouterOS accepts it.
pub fn format_router_timeout(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, mins, secs) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}

#[derive(Debug, Deserialize)]
struct AddressEntry {
    #[serde(rename = ".id")]
    id: String,
}

#[derive(Debug, Serialize)]
struct NewEntry<'a> {
    list: &'a str,
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<&'a str>,
    comment: &'a str,
}

#[derive(Debug, Serialize)]
struct EntryUpdate<'a> {
    timeout: &'a str,
}

/// Client for `/rest/ip/firewall/address-list`.
pub struct RouterOsClient {
    http: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
    list: String,
    entry_timeout: String,
}

impl RouterOsClient {
    pub fn new(config: &RouterConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(2)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            http,
            endpoint: format!(
                "{}/rest/ip/firewall/address-list",
                config.url.trim_end_matches('/')
            ),
            user: config.user.clone(),
            password: config.password.clone(),
            list: config.list_name.clone(),
            entry_timeout: format_router_timeout(parse_router_timeout(&config.entry_timeout)),
        })
    }

    pub fn entry_timeout(&self) -> &str {
        &self.entry_timeout
    }

    /// Add `ip` to the list, or refresh its timeout if already present.
    pub async fn upsert(&self, ip: &str, domain: &str) -> Result<(), SyncError> {
        let existing: Vec<AddressEntry> = self
            .http
            .get(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .query(&[
                ("list", self.list.as_str()),
                ("address", ip),
                (".proplist", ".id"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match existing.first() {
            None => {
                self.put(&NewEntry {
                    list: &self.list,
                    address: ip,
                    timeout: Some(&self.entry_timeout),
                    comment: domain,
                })
                .await?;
                debug!(ip, domain, "address added");
            }
            Some(entry) => {
                self.http
                    .patch(format!("{}/{}", self.endpoint, entry.id))
                    .basic_auth(&self.user, Some(&self.password))
                    .json(&EntryUpdate {
                        timeout: &self.entry_timeout,
                    })
                    .send()
                    .await?
                    .error_for_status()?;
                debug!(ip, domain, id = %entry.id, "address refreshed");
            }
        }
        Ok(())
    }

    /// Add a permanent entry, e.g. for the DoH resolvers themselves.
    pub async fn add_static(&self, ip: &str, comment: &str) -> Result<(), SyncError> {
        self.put(&NewEntry {
            list: &self.list,
            address: ip,
            timeout: None,
            comment,
        })
        .await
    }

    async fn put(&self, entry: &NewEntry<'_>) -> Result<(), SyncError> {
        self.http
            .put(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(entry)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Queues reports for a background worker that talks to the router.
///
/// The queue is bounded; while the router lags behind, new reports are
/// dropped rather than buffered.
pub struct AddressReporter {
    tx: mpsc::Sender<AddressReport>,
}

impl AddressReporter {
    /// Spawn the worker on the current runtime.
    pub fn spawn(client: Arc<RouterOsClient>) -> Self {
        let (tx, rx) = mpsc::channel(REPORT_QUEUE_CAPACITY);
        tokio::spawn(run_worker(client, rx));
        Self { tx }
    }
}

impl AddressSink for AddressReporter {
    fn report(&self, report: AddressReport) {
        match self.tx.try_send(report) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(report)) => {
                warn!(domain = %report.domain, "address report queue full, dropping report");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("address reporter stopped, dropping report");
            }
        }
    }
}

async fn run_worker(client: Arc<RouterOsClient>, mut rx: mpsc::Receiver<AddressReport>) {
    while let Some(report) = rx.recv().await {
        let updates = report
            .address
            .iter()
            .map(|ip| client.upsert(ip, &report.domain));
        let results = futures::future::join_all(updates).await;

        for (ip, result) in report.address.iter().zip(results) {
            if let Err(err) = result {
                warn!(domain = %report.domain, ip = %ip, "address list update failed: {err}");
            }
        }
    }
}
