//! DNS-over-HTTPS lookups using the JSON API.
//!
//! Both the circumvention and the redirect resolvers speak the
//! `application/dns-json` format served by Cloudflare, Google and Quad9.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::trace;

use crate::error::DohError;

/// Decoded DoH JSON reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DohResponse {
    /// DNS response code; 0 is success.
    #[serde(rename = "Status", alias = "status")]
    pub status: i64,
    #[serde(rename = "Answer", alias = "answer", default)]
    pub answer: Vec<DohAnswer>,
}

/// One entry of the `Answer` array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DohAnswer {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: u16,
    pub data: String,
    #[serde(rename = "TTL", alias = "ttl", default)]
    pub ttl: u32,
}

/// A DoH resolver.
pub trait DohLookup: Send + Sync {
    fn lookup<'a>(
        &'a self,
        domain: &'a str,
        record_type: &'a str,
    ) -> BoxFuture<'a, Result<DohResponse, DohError>>;
}

/// [`DohLookup`] over HTTPS with reqwest.
pub struct DohClient {
    http: reqwest::Client,
    url: String,
}

impl DohClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            url: url.into(),
        })
    }

    async fn query(&self, domain: &str, record_type: &str) -> Result<DohResponse, DohError> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("name", domain), ("type", record_type)])
            .header(ACCEPT, "application/dns-json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DohError::Status(status.as_u16()));
        }

        let body: DohResponse = response.json().await?;
        trace!(url = %self.url, domain, record_type, status = body.status, answers = body.answer.len(), "DoH reply");
        Ok(body)
    }
}

impl DohLookup for DohClient {
    fn lookup<'a>(
        &'a self,
        domain: &'a str,
        record_type: &'a str,
    ) -> BoxFuture<'a, Result<DohResponse, DohError>> {
        self.query(domain, record_type).boxed()
    }
}
