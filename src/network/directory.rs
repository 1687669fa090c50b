//! Server-name resolution.

use crate::error::{PqnError, PqnResult};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

/// Maps logical server names to `host:port` addresses.
pub trait Directory: Send + Sync + Debug {
    /// Address of `server`, or `UnknownServer`.
    fn resolve(&self, server: &str) -> PqnResult<String>;
}

/// Fixed table loaded from the `[directory]` configuration section.
///
/// A name missing from the table is still accepted when it is itself a
/// `host:port` literal.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: HashMap<String, String>,
}

impl StaticDirectory {
    /// Empty table; only `host:port` literals resolve.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table from configuration entries.
    pub fn from_map(entries: &BTreeMap<String, String>) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Builder form of [`StaticDirectory::insert`].
    pub fn with_entry(mut self, server: impl Into<String>, address: impl Into<String>) -> Self {
        self.insert(server, address);
        self
    }

    /// Add or replace the address of `server`.
    pub fn insert(&mut self, server: impl Into<String>, address: impl Into<String>) {
        self.entries.insert(server.into(), address.into());
    }
}

fn is_host_port(candidate: &str) -> bool {
    match candidate.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

impl Directory for StaticDirectory {
    fn resolve(&self, server: &str) -> PqnResult<String> {
        if let Some(address) = self.entries.get(server) {
            return Ok(address.clone());
        }
        if is_host_port(server) {
            return Ok(server.to_string());
        }
        Err(PqnError::UnknownServer(server.to_string()))
    }
}
