use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::flags::{AddressStatus, ServiceStatus};
use crate::protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    /// Created from an A record
    V4,
    /// Created from an AAAA record
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// A hostname-to-IP binding observed on the network.
/// Identity is (name, ip); a name may carry several entries of either family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressEntry {
    /// Hostname, lowercase, without trailing dot, e.g. "printer.local"
    pub name: String,

    pub family: AddressFamily,

    pub ip: IpAddr,

    pub status: AddressStatus,

    /// TTL of the last refreshing record, in seconds
    pub ttl: u32,

    /// Last time a record refreshed this entry
    pub last_seen: DateTime<Utc>,

    /// `last_seen + ttl`
    pub expire_at: DateTime<Utc>,
}

/// A single TXT value. Keys announced without `=` are flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TxtValue {
    Flag(bool),
    Text(String),
}

/// Ordered TXT key/value map, in announcement order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxtRecord {
    entries: Vec<(String, TxtValue)>,
}

impl TxtRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`, keeping the position of the first occurrence
    pub fn insert(&mut self, key: impl Into<String>, value: TxtValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&TxtValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TxtValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A DNS-SD service instance observed on the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Full instance name as announced, e.g. "myprinter._http._tcp.local"
    pub name: String,

    pub priority: u16,

    pub weight: u16,

    pub port: u16,

    /// SRV target currently bound, lowercase, e.g. "printer.local"
    pub target_host: String,

    pub txt: TxtRecord,

    /// Addresses of `target_host` currently associated with this instance
    pub addresses: Vec<AddressEntry>,

    pub status: ServiceStatus,

    /// TTL of the last refreshing SRV record, in seconds
    pub ttl: u32,

    /// First time this instance was seen
    pub first_seen: DateTime<Utc>,

    /// Last time an SRV record refreshed this instance
    pub last_seen: DateTime<Utc>,

    /// `last_seen + ttl`
    pub expire_at: DateTime<Utc>,
}

impl ServiceEntry {
    /// Service type part of the instance name, e.g. "_http._tcp.local"
    pub fn service_type(&self) -> Option<&str> {
        protocol::split_service_name(&self.name).map(|(_, service_type)| service_type)
    }

    pub fn is_online(&self) -> bool {
        self.status.contains(ServiceStatus::ONLINE)
    }
}
