//! rosdns - A policy-driven DNS router.
//!
//! Queries are classified against curated domain lists and answered by a
//! block address, a DNS-over-HTTPS resolver, or a plain upstream resolver.
//! Addresses resolved for circumvention and redirect names are pushed to a
//! RouterOS firewall address list.

pub mod cache;
pub mod config;
pub mod dns;
pub mod doh;
pub mod error;
pub mod filter;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod sync;
pub mod transport;
pub mod upstream;

pub use config::Config;
pub use error::{Error, Result};
