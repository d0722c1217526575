//! Query dispatch.
//!
//! Every query is checked against the answer cache, then routed by the
//! domain lists in fixed precedence:
//! 1. Redirect: answered by the redirect DoH resolver
//! 2. Block: answered locally with the block address
//! 3. Circumvention (A queries only): DoH or the remote resolver, falling
//!    back to the backup resolver
//! 4. Everything else: forwarded to the backup resolver
//!
//! Transports handle the actual I/O, the resolver handles decisions.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::cache::AnswerCache;
use crate::config::{Config, TtlConfig};
use crate::dns::{self, DnsQuery, DnsRecord, DnsResponse, QueryType, ResponseCode, rtype};
use crate::doh::{DohAnswer, DohLookup};
use crate::error::UpstreamError;
use crate::filter::Classifier;
use crate::stats::{Outcome, Stats, StatsSnapshot};
use crate::sync::{AddressReport, AddressSink};
use crate::upstream::Forwarder;

/// Record types kept from circumvention DoH answers.
const CIRCUMVENTION_TYPES: &[u16] = &[rtype::A, rtype::CNAME];

/// Record types kept from redirect DoH answers.
const REDIRECT_TYPES: &[u16] = &[rtype::A, rtype::CNAME, rtype::AAAA];

/// Where circumvention-listed names are resolved.
pub enum Circumvention {
    Doh(Arc<dyn DohLookup>),
    /// A plain resolver reachable through the proxy path.
    Remote(Arc<dyn Forwarder>),
}

/// Upstreams and side channels the resolver talks to.
pub struct Collaborators {
    pub backup: Arc<dyn Forwarder>,
    pub circumvention: Circumvention,
    pub redirect: Arc<dyn DohLookup>,
    pub sink: Arc<dyn AddressSink>,
}

/// Resolution path chosen for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Redirect,
    Block,
    Circumvent,
    Direct,
}

/// What to send back for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Answer {
        code: ResponseCode,
        records: Vec<DnsRecord>,
    },
    /// Send nothing; the client sees packet loss.
    Drop,
}

impl Resolution {
    fn answer(records: Vec<DnsRecord>) -> Self {
        Resolution::Answer {
            code: ResponseCode::NoError,
            records,
        }
    }

    fn empty(code: ResponseCode) -> Self {
        Resolution::Answer {
            code,
            records: Vec::new(),
        }
    }

    /// Wire-format reply carrying the query's transaction ID, if any.
    pub fn into_reply(self, query: &DnsQuery) -> Option<Vec<u8>> {
        match self {
            Resolution::Answer { code, records } => {
                Some(DnsResponse::reply(query, code, records).to_bytes())
            }
            Resolution::Drop => None,
        }
    }
}

/// Resolver handles DNS query processing decisions.
pub struct Resolver {
    classifier: Arc<Classifier>,
    cache: AnswerCache,
    backup: Arc<dyn Forwarder>,
    circumvention: Circumvention,
    redirect: Arc<dyn DohLookup>,
    sink: Arc<dyn AddressSink>,
    block_address: Ipv4Addr,
    ttl: TtlConfig,
    stats: Stats,
}

impl Resolver {
    pub fn new(classifier: Arc<Classifier>, collaborators: Collaborators, config: &Config) -> Self {
        Self {
            classifier,
            cache: AnswerCache::new(config.cache.capacity, config.cache.partition_by_type),
            backup: collaborators.backup,
            circumvention: collaborators.circumvention,
            redirect: collaborators.redirect,
            sink: collaborators.sink,
            block_address: config.dns.block_address,
            ttl: config.ttl,
            stats: Stats::new(),
        }
    }

    /// Pick the resolution path for `query`.
    ///
    /// All checks read the same snapshot of the lists.
    pub fn route(&self, query: &DnsQuery) -> Route {
        let class = self.classifier.classify(&query.domain);
        if class.is_redirect {
            Route::Redirect
        } else if class.is_blocked {
            Route::Block
        } else if query.qtype == QueryType::A && class.is_circumvention {
            Route::Circumvent
        } else {
            Route::Direct
        }
    }

    /// Resolve one query and record the outcome.
    pub async fn resolve(&self, query: &DnsQuery) -> Resolution {
        let started = Instant::now();
        let (resolution, outcome) = self.dispatch(query).await;
        self.stats.record(outcome, started.elapsed());
        resolution
    }

    async fn dispatch(&self, query: &DnsQuery) -> (Resolution, Outcome) {
        if let Some(records) = self.cache.get(&query.domain, query.qtype) {
            debug!(domain = %query.domain, qtype = %query.qtype, "cache hit");
            return (Resolution::answer(records), Outcome::Cached);
        }

        match self.route(query) {
            Route::Redirect => (self.redirect(query).await, Outcome::Redirected),
            Route::Block => (self.block(query), Outcome::Blocked),
            Route::Circumvent => self.circumvent(query).await,
            Route::Direct => self.forward(query).await,
        }
    }

    fn block(&self, query: &DnsQuery) -> Resolution {
        debug!(domain = %query.domain, qtype = %query.qtype, "blocked");
        if query.qtype != QueryType::A {
            return Resolution::empty(ResponseCode::NoError);
        }
        Resolution::answer(vec![DnsRecord::a(
            query.domain.clone(),
            self.block_address,
            self.ttl.block,
        )])
    }

    async fn redirect(&self, query: &DnsQuery) -> Resolution {
        let record_type = query.qtype.name();
        let reply = match self.redirect.lookup(&query.domain, &record_type).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(domain = %query.domain, qtype = %query.qtype, "redirect lookup failed: {err}");
                self.cache.invalidate(&query.domain, query.qtype);
                return Resolution::empty(ResponseCode::NoError);
            }
        };

        let code = ResponseCode::from_status(reply.status);
        let records = self.translate(&reply.answer, REDIRECT_TYPES);
        if records.is_empty() {
            debug!(domain = %query.domain, qtype = %query.qtype, %code, "redirect lookup returned no records");
        }
        self.report(&query.domain, &records);
        if code == ResponseCode::NoError {
            self.remember(query, &records);
        }
        Resolution::Answer { code, records }
    }

    async fn circumvent(&self, query: &DnsQuery) -> (Resolution, Outcome) {
        match &self.circumvention {
            Circumvention::Doh(doh) => match doh.lookup(&query.domain, "A").await {
                Ok(reply) if reply.status == 0 => {
                    let records = self.translate(&reply.answer, CIRCUMVENTION_TYPES);
                    self.report(&query.domain, &records);
                    self.remember(query, &records);
                    return (Resolution::answer(records), Outcome::Circumvented);
                }
                Ok(reply) => {
                    debug!(domain = %query.domain, status = reply.status, "circumvention lookup failed, using backup");
                }
                Err(err) => {
                    warn!(domain = %query.domain, "circumvention lookup failed, using backup: {err}");
                }
            },
            Circumvention::Remote(remote) => match remote.forward(&query.question()).await {
                Ok(records) => {
                    self.report(&query.domain, &records);
                    self.remember(query, &records);
                    return (Resolution::answer(records), Outcome::Circumvented);
                }
                Err(err) => {
                    debug!(domain = %query.domain, "remote resolver failed, using backup: {err}");
                }
            },
        }

        match self.backup.forward(&query.question()).await {
            Ok(records) => {
                self.remember(query, &records);
                (Resolution::answer(records), Outcome::Fallback)
            }
            Err(err) => {
                self.cache.invalidate(&query.domain, query.qtype);
                match self.failure(query, err) {
                    Resolution::Drop => (Resolution::Drop, Outcome::Dropped),
                    answer => (answer, Outcome::Fallback),
                }
            }
        }
    }

    async fn forward(&self, query: &DnsQuery) -> (Resolution, Outcome) {
        match self.backup.forward(&query.question()).await {
            Ok(records) => {
                self.remember(query, &records);
                (Resolution::answer(records), Outcome::Forwarded)
            }
            Err(err) => {
                self.cache.invalidate(&query.domain, query.qtype);
                match self.failure(query, err) {
                    Resolution::Drop => (Resolution::Drop, Outcome::Dropped),
                    answer => (answer, Outcome::Forwarded),
                }
            }
        }
    }

    /// Propagate an upstream response code, or drop when there is none.
    fn failure(&self, query: &DnsQuery, err: UpstreamError) -> Resolution {
        match err.code() {
            Some(code) => {
                debug!(domain = %query.domain, qtype = %query.qtype, %code, "upstream returned error code");
                Resolution::empty(code)
            }
            None => {
                warn!(domain = %query.domain, qtype = %query.qtype, "dropping query: {err}");
                Resolution::Drop
            }
        }
    }

    /// Convert DoH answers into records, skipping types not in `allowed`.
    fn translate(&self, answers: &[DohAnswer], allowed: &[u16]) -> Vec<DnsRecord> {
        answers
            .iter()
            .filter_map(|answer| {
                let name = answer.name.trim_end_matches('.');
                if !allowed.contains(&answer.rtype) {
                    error!(domain = %name, rtype = answer.rtype, "unexpected record type in DoH answer");
                    return None;
                }
                let ttl = self.ttl.cap(answer.ttl);
                let data = answer.data.trim();
                let record = match answer.rtype {
                    rtype::A => data.parse::<Ipv4Addr>().ok().map(|ip| DnsRecord::a(name, ip, ttl)),
                    rtype::AAAA => data.parse::<Ipv6Addr>().ok().map(|ip| DnsRecord::aaaa(name, ip, ttl)),
                    _ => Some(DnsRecord::cname(name, data.trim_end_matches('.'), ttl)),
                };
                if record.is_none() {
                    error!(domain = %name, rtype = answer.rtype, data, "invalid address in DoH answer");
                }
                record
            })
            .collect()
    }

    /// Hand A-record addresses to the address-list synchronizer.
    fn report(&self, domain: &str, records: &[DnsRecord]) {
        let address: Vec<String> = records
            .iter()
            .filter_map(DnsRecord::ipv4)
            .map(|ip| ip.to_string())
            .collect();
        if address.is_empty() {
            return;
        }
        self.sink.report(AddressReport {
            domain: domain.to_string(),
            address,
        });
    }

    fn remember(&self, query: &DnsQuery, records: &[DnsRecord]) {
        let Some(ttl) = dns::min_ttl(records) else {
            return;
        };
        self.cache.put(
            &query.domain,
            query.qtype,
            records.to_vec(),
            self.ttl.cache_lifetime(ttl),
        );
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop expired cache entries.
    pub fn sweep_cache(&self) -> usize {
        self.cache.sweep()
    }

    pub fn stats_snapshot_and_reset(&self) -> StatsSnapshot {
        self.stats.snapshot_and_reset()
    }
}
