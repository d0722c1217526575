//! Router orchestration.
//!
//! Loads the domain lists, connects the upstreams, binds the listener and
//! runs the background tasks (stats, cache sweep, list reload).

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{Config, ListsConfig};
use crate::doh::DohClient;
use crate::error::Result;
use crate::filter::{Classifier, DomainLists};
use crate::resolver::{Circumvention, Collaborators, Resolver};
use crate::sync::{AddressReporter, AddressSink, LogSink, RouterOsClient};
use crate::transport::udp::UdpListener;
use crate::upstream::Upstream;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Run the router with the given configuration. Runs indefinitely.
pub async fn run(config: Config) -> Result<()> {
    let classifier = Arc::new(Classifier::new(DomainLists::load(&config.lists)?));
    let resolver = Arc::new(build_resolver(&config, Arc::clone(&classifier)).await?);

    let listener = UdpListener::bind(config.dns.listen).await?;
    info!(
        listen = %listener.local_addr()?,
        backup = %config.dns.backup,
        remote = ?config.dns.remote,
        "DNS router listening"
    );
    let server = listener.start(Arc::clone(&resolver));

    tokio::spawn(report_stats(Arc::clone(&resolver)));
    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(classifier, config.lists.clone()));

    server.await.map_err(io::Error::other)?;
    Ok(())
}

async fn build_resolver(config: &Config, classifier: Arc<Classifier>) -> Result<Resolver> {
    let timeout = config.dns.timeout();
    let backup = Arc::new(Upstream::connect(config.dns.backup, timeout).await?);

    let circumvention = match config.dns.remote {
        Some(remote) => Circumvention::Remote(Arc::new(Upstream::connect(remote, timeout).await?)),
        None => Circumvention::Doh(Arc::new(DohClient::new(
            config.doh.circumvention.clone(),
            config.doh.timeout(),
        )?)),
    };
    let redirect = Arc::new(DohClient::new(config.doh.redirect.clone(), config.doh.timeout())?);

    let sink: Arc<dyn AddressSink> = match &config.router {
        Some(router) => {
            let client = Arc::new(RouterOsClient::new(router)?);
            info!(url = %router.url, list = %router.list_name, timeout = client.entry_timeout(), "syncing address list");
            let addresses: Vec<String> = router.static_addresses.iter().map(ToString::to_string).collect();
            tokio::spawn(add_static_addresses(Arc::clone(&client), addresses));
            Arc::new(AddressReporter::spawn(client))
        }
        None => {
            info!("no router configured, resolved addresses are only logged");
            Arc::new(LogSink)
        }
    };

    Ok(Resolver::new(
        classifier,
        Collaborators {
            backup,
            circumvention,
            redirect,
            sink,
        },
        config,
    ))
}

/// The DoH resolvers themselves must be reached through the proxy path.
async fn add_static_addresses(client: Arc<RouterOsClient>, addresses: Vec<String>) {
    for ip in &addresses {
        match client.add_static(ip, "DNS").await {
            Ok(()) => info!(ip = %ip, "static address added"),
            Err(err) => warn!(ip = %ip, "failed to add static address: {err}"),
        }
    }
}

async fn report_stats(resolver: Arc<Resolver>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let expired = resolver.sweep_cache();
        let stats = resolver.stats_snapshot_and_reset();
        info!(
            cache = resolver.cache_len(),
            expired,
            requests = stats.requests,
            cached = stats.cached,
            blocked = stats.blocked,
            redirected = stats.redirected,
            circumvented = stats.circumvented,
            forwarded = stats.forwarded,
            fallback = stats.fallback,
            dropped = stats.dropped,
            avg_response_ms = %format!("{:.2}", stats.avg_response_ms),
            "stats"
        );
    }
}

#[cfg(unix)]
async fn reload_on_hangup(classifier: Arc<Classifier>, lists: ListsConfig) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            warn!("cannot listen for SIGHUP, list reload disabled: {err}");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        match DomainLists::load(&lists) {
            Ok(loaded) => {
                info!(
                    circumvention = loaded.circumvention.len(),
                    escape = loaded.escape.len(),
                    block = loaded.block.len(),
                    redirect = loaded.redirect.len(),
                    "domain lists reloaded"
                );
                classifier.reload(loaded);
            }
            Err(err) => warn!("reload failed, keeping current lists: {err}"),
        }
    }
}
