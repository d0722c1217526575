//! Loading domain lists from line-oriented text files.

use std::path::Path;

use tracing::info;

use super::classifier::DomainLists;
use super::domains::DomainSet;
use crate::config::ListsConfig;
use crate::error::ConfigError;

/// Length of the marker every escape-list line starts with.
const ESCAPE_PREFIX_LEN: usize = 5;

/// Domains in a plain list: one per line, blanks and `#` comments skipped.
pub fn parse_list(content: &str) -> impl Iterator<Item = &str> {
    content.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        Some(line)
    })
}

/// Domains in an escape list, with the fixed line prefix removed.
pub fn parse_escape_list(content: &str) -> impl Iterator<Item = &str> {
    parse_list(content).filter_map(|line| {
        line.get(ESCAPE_PREFIX_LEN..)
            .map(str::trim)
            .filter(|domain| !domain.is_empty())
    })
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::ReadList {
        path: path.to_path_buf(),
        source,
    })
}

fn load_into<P: AsRef<Path>>(
    set: &mut DomainSet,
    paths: &[P],
    escape: bool,
    kind: &str,
) -> Result<(), ConfigError> {
    for path in paths {
        let path = path.as_ref();
        let content = read(path)?;
        let before = set.len();
        if escape {
            set.extend(parse_escape_list(&content));
        } else {
            set.extend(parse_list(&content));
        }
        info!(
            list = kind,
            path = %path.display(),
            records = set.len() - before,
            "domain list loaded"
        );
    }
    Ok(())
}

impl DomainLists {
    /// Read every configured list file.
    pub fn load(config: &ListsConfig) -> Result<Self, ConfigError> {
        let mut lists = DomainLists::default();
        load_into(&mut lists.circumvention, &config.proxy, false, "proxy")?;
        load_into(&mut lists.escape, &config.direct, true, "direct")?;
        load_into(&mut lists.block, &config.block, false, "block")?;
        load_into(&mut lists.redirect, &config.redirect, false, "redirect")?;
        Ok(lists)
    }
}
