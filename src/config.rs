//! Configuration loading and validation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};

/// Port assumed for resolver addresses written without one.
const DNS_PORT: u16 = 53;

/// Main configuration for the router.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub ttl: TtlConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub lists: ListsConfig,

    #[serde(default)]
    pub doh: DohConfig,

    /// RouterOS address-list synchronization. Resolved addresses are only
    /// logged when absent.
    pub router: Option<RouterConfig>,
}

/// Listener and plain DNS upstreams.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    /// Address the UDP listener binds to.
    #[serde(default = "default_listen", deserialize_with = "deserialize_socket_addr")]
    pub listen: SocketAddr,

    /// Resolver reachable through the proxy path. When set, circumvention
    /// lookups go here instead of the DoH circumvention resolver.
    #[serde(default, deserialize_with = "deserialize_optional_resolver")]
    pub remote: Option<SocketAddr>,

    /// Fallback resolver for unclassified names and failed lookups.
    #[serde(default = "default_backup", deserialize_with = "deserialize_resolver")]
    pub backup: SocketAddr,

    /// Address returned in synthesized block answers.
    #[serde(default = "default_block_address")]
    pub block_address: Ipv4Addr,

    /// Per-transaction upstream timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            remote: None,
            backup: default_backup(),
            block_address: default_block_address(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl DnsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// TTL policy, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TtlConfig {
    /// TTL of synthesized block answers.
    #[serde(default = "default_block_ttl")]
    pub block: u32,

    /// Upper bound for upstream TTLs and cache lifetimes.
    #[serde(default = "default_max_ttl")]
    pub max: u32,

    /// Lower bound for cache lifetimes.
    #[serde(default = "default_min_ttl")]
    pub min: u32,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            block: default_block_ttl(),
            max: default_max_ttl(),
            min: default_min_ttl(),
        }
    }
}

impl TtlConfig {
    /// Cap a TTL advertised by an upstream.
    pub fn cap(&self, ttl: u32) -> u32 {
        ttl.min(self.max)
    }

    /// Cache lifetime for answers whose smallest TTL is `ttl`.
    pub fn cache_lifetime(&self, ttl: u32) -> Duration {
        Duration::from_secs(u64::from(ttl.clamp(self.min, self.max)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Key entries by (name, type) rather than by name alone.
    #[serde(default = "default_partition_by_type")]
    pub partition_by_type: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            partition_by_type: default_partition_by_type(),
        }
    }
}

/// Domain list files. Every list may be spread over several files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListsConfig {
    /// Circumvention lists, one domain per line.
    #[serde(default)]
    pub proxy: Vec<PathBuf>,

    /// Escape lists; each line carries a 5-character prefix.
    #[serde(default)]
    pub direct: Vec<PathBuf>,

    #[serde(default)]
    pub block: Vec<PathBuf>,

    #[serde(default)]
    pub redirect: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DohConfig {
    /// DoH resolver for circumvention-listed names. An empty string disables it.
    #[serde(default = "default_circumvention_url")]
    pub circumvention: String,

    /// DoH resolver for redirect-listed names.
    #[serde(default = "default_redirect_url")]
    pub redirect: String,

    #[serde(default = "default_doh_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            circumvention: default_circumvention_url(),
            redirect: default_redirect_url(),
            timeout_ms: default_doh_timeout_ms(),
        }
    }
}

impl DohConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// RouterOS REST endpoint holding the firewall address list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Base URL, e.g. `https://192.168.88.1`.
    pub url: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_list_name")]
    pub list_name: String,

    /// RouterOS duration applied to dynamic entries, e.g. `2h`.
    #[serde(default = "default_entry_timeout")]
    pub entry_timeout: String,

    /// RouterOS ships with a self-signed certificate.
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,

    /// Addresses added permanently at startup.
    #[serde(default = "default_static_addresses")]
    pub static_addresses: Vec<IpAddr>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DNS_PORT))
}

fn default_backup() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), DNS_PORT))
}

const fn default_block_address() -> Ipv4Addr {
    Ipv4Addr::new(224, 0, 0, 1)
}

const fn default_timeout_ms() -> u64 {
    3000
}

const fn default_block_ttl() -> u32 {
    600
}

const fn default_max_ttl() -> u32 {
    600
}

const fn default_min_ttl() -> u32 {
    10
}

const fn default_cache_capacity() -> usize {
    1000
}

const fn default_partition_by_type() -> bool {
    true
}

fn default_circumvention_url() -> String {
    "https://1.1.1.1/dns-query".to_string()
}

fn default_redirect_url() -> String {
    "https://9.9.9.9:5053/dns-query".to_string()
}

const fn default_doh_timeout_ms() -> u64 {
    5000
}

fn default_list_name() -> String {
    "PROXY".to_string()
}

fn default_entry_timeout() -> String {
    "2h".to_string()
}

const fn default_accept_invalid_certs() -> bool {
    true
}

fn default_static_addresses() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
        IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
    ]
}

fn deserialize_socket_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

/// Parse `host:port`, or a bare IP meaning port 53.
fn parse_resolver(s: &str) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
    s.parse::<SocketAddr>()
        .or_else(|_| s.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DNS_PORT)))
}

fn deserialize_resolver<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_resolver(s.trim()).map_err(serde::de::Error::custom)
}

fn deserialize_optional_resolver<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    parse_resolver(s).map(Some).map_err(serde::de::Error::custom)
}

fn check_url(field: &'static str, url: &str) -> std::result::Result<(), ValidationError> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(ValidationError::InvalidUrl {
            field,
            url: url.to_string(),
        })
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate().map_err(ConfigError::from)?;
        Ok(config)
    }

    /// Check values serde cannot express constraints for.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.dns.timeout_ms == 0 {
            return Err(ValidationError::ZeroUpstreamTimeout);
        }
        if self.doh.timeout_ms == 0 {
            return Err(ValidationError::ZeroDohTimeout);
        }
        if self.cache.capacity == 0 {
            return Err(ValidationError::ZeroCacheCapacity);
        }
        if self.ttl.max == 0 {
            return Err(ValidationError::ZeroMaxTtl);
        }
        if self.ttl.min > self.ttl.max {
            return Err(ValidationError::TtlRange {
                min: self.ttl.min,
                max: self.ttl.max,
            });
        }

        if self.doh.circumvention.is_empty() {
            if self.dns.remote.is_none() {
                return Err(ValidationError::NoCircumventionUpstream);
            }
        } else {
            check_url("doh.circumvention", &self.doh.circumvention)?;
        }
        check_url("doh.redirect", &self.doh.redirect)?;

        if let Some(router) = &self.router {
            check_url("router.url", &router.url)?;
            if router.user.trim().is_empty() {
                return Err(ValidationError::EmptyRouterUser);
            }
            if router.list_name.trim().is_empty() {
                return Err(ValidationError::EmptyRouterList);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn validation_error(toml: &str) -> ValidationError {
        match Config::parse(toml) {
            Err(Error::Config(ConfigError::Validation(err))) => err,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.dns.listen.to_string(), "0.0.0.0:53");
        assert_eq!(config.dns.backup.to_string(), "8.8.8.8:53");
        assert!(config.dns.remote.is_none());
        assert_eq!(config.dns.block_address, Ipv4Addr::new(224, 0, 0, 1));
        assert_eq!(config.dns.timeout(), Duration::from_secs(3));
        assert_eq!(config.ttl, TtlConfig { block: 600, max: 600, min: 10 });
        assert_eq!(config.cache.capacity, 1000);
        assert!(config.cache.partition_by_type);
        assert_eq!(config.doh.circumvention, "https://1.1.1.1/dns-query");
        assert!(config.router.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [dns]
            listen = "127.0.0.1:5353"
            remote = "10.0.0.1"
            backup = "192.168.88.1:5300"
            block_address = "0.0.0.0"
            timeout_ms = 1500

            [ttl]
            block = 86400
            max = 300
            min = 30

            [cache]
            capacity = 50
            partition_by_type = false

            [lists]
            proxy = ["gfwlist.txt"]
            direct = ["whitelist.txt"]
            block = ["ads.txt", "trackers.txt"]
            redirect = ["netflix.txt"]

            [doh]
            circumvention = "https://dns.google/resolve"
            timeout_ms = 2000

            [router]
            url = "https://192.168.88.1"
            user = "api"
            password = "secret"
            entry_timeout = "1h"
        "#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.dns.listen.port(), 5353);
        assert_eq!(config.dns.remote.unwrap().to_string(), "10.0.0.1:53");
        assert_eq!(config.dns.backup.to_string(), "192.168.88.1:5300");
        assert_eq!(config.ttl.block, 86400);
        assert!(!config.cache.partition_by_type);
        assert_eq!(config.lists.block.len(), 2);
        assert_eq!(config.lists.direct, vec![PathBuf::from("whitelist.txt")]);

        let router = config.router.unwrap();
        assert_eq!(router.list_name, "PROXY");
        assert_eq!(router.entry_timeout, "1h");
        assert!(router.accept_invalid_certs);
        assert_eq!(router.static_addresses.len(), 2);
    }

    #[test]
    fn test_bare_backup_ip_gets_default_port() {
        let config = Config::parse("[dns]\nbackup = \"1.0.0.1\"").unwrap();

        assert_eq!(config.dns.backup.to_string(), "1.0.0.1:53");
    }

    #[test]
    fn test_invalid_resolver_address() {
        let result = Config::parse("[dns]\nbackup = \"not-an-address\"");

        assert!(matches!(result, Err(Error::Config(ConfigError::Parse(_)))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = Config::parse("[dns]\nupstream = \"1.1.1.1:53\"");

        assert!(matches!(result, Err(Error::Config(ConfigError::Parse(_)))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert_eq!(
            validation_error("[dns]\ntimeout_ms = 0"),
            ValidationError::ZeroUpstreamTimeout
        );
        assert_eq!(
            validation_error("[doh]\ntimeout_ms = 0"),
            ValidationError::ZeroDohTimeout
        );
    }

    #[test]
    fn test_zero_cache_capacity_rejected() {
        assert_eq!(
            validation_error("[cache]\ncapacity = 0"),
            ValidationError::ZeroCacheCapacity
        );
    }

    #[test]
    fn test_ttl_bounds_checked() {
        assert_eq!(validation_error("[ttl]\nmax = 0\nmin = 0"), ValidationError::ZeroMaxTtl);
        assert_eq!(
            validation_error("[ttl]\nmin = 700"),
            ValidationError::TtlRange { min: 700, max: 600 }
        );
    }

    #[test]
    fn test_circumvention_needs_an_upstream() {
        assert_eq!(
            validation_error("[doh]\ncircumvention = \"\""),
            ValidationError::NoCircumventionUpstream
        );

        let config = Config::parse("[dns]\nremote = \"10.0.0.1\"\n[doh]\ncircumvention = \"\"").unwrap();
        assert!(config.dns.remote.is_some());
    }

    #[test]
    fn test_invalid_urls_rejected() {
        assert_eq!(
            validation_error("[doh]\nredirect = \"9.9.9.9\""),
            ValidationError::InvalidUrl {
                field: "doh.redirect",
                url: "9.9.9.9".to_string(),
            }
        );
        assert!(matches!(
            validation_error("[router]\nurl = \"192.168.88.1\"\nuser = \"api\""),
            ValidationError::InvalidUrl { field: "router.url", .. }
        ));
    }

    #[test]
    fn test_router_requires_user() {
        assert_eq!(
            validation_error("[router]\nurl = \"https://192.168.88.1\"\nuser = \" \""),
            ValidationError::EmptyRouterUser
        );
    }

    #[test]
    fn test_ttl_policy_clamps() {
        let ttl = TtlConfig::default();

        assert_eq!(ttl.cap(3600), 600);
        assert_eq!(ttl.cap(30), 30);
        assert_eq!(ttl.cache_lifetime(1), Duration::from_secs(10));
        assert_eq!(ttl.cache_lifetime(86400), Duration::from_secs(600));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[dns]\nlisten = \"127.0.0.1:5300\"\n").unwrap();

        let config = Config::load(&path).unwrap();

        assert_eq!(config.dns.listen.port(), 5300);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load("/nonexistent/rosdns.toml");

        assert!(matches!(result, Err(Error::Config(ConfigError::ReadFile(_)))));
    }
}
