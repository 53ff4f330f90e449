use std::net::IpAddr;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared::{AddressEntry, AddressFamily, AddressStatus, ServiceEntry, ServiceStatus, TxtRecord};

/// (host, ip) of an address associated with a service
pub(crate) type AddressKey = (String, IpAddr);

fn expire_at(last_seen: DateTime<Utc>, ttl: u32) -> DateTime<Utc> {
    last_seen + ChronoDuration::seconds(i64::from(ttl))
}

pub(crate) struct AddressState {
    pub(crate) name: String,
    pub(crate) ip: IpAddr,
    pub(crate) status: AddressStatus,
    pub(crate) ttl: u32,
    pub(crate) last_seen: DateTime<Utc>,
}

impl AddressState {
    pub(crate) fn new(name: &str, ip: IpAddr) -> Self {
        Self {
            name: name.to_string(),
            ip,
            status: AddressStatus::NONE,
            ttl: 0,
            last_seen: Utc::now(),
        }
    }

    /// Apply a record with nonzero TTL
    pub(crate) fn refresh(&mut self, ttl: u32) {
        self.ttl = ttl;
        self.last_seen = Utc::now();
        self.status.remove(AddressStatus::EXPIRED);
        self.status.insert(AddressStatus::ONLINE | AddressStatus::PENDING_NOTIFY);
    }

    pub(crate) fn is_online(&self) -> bool {
        self.status.contains(AddressStatus::ONLINE)
    }

    pub(crate) fn snapshot(&self) -> AddressEntry {
        AddressEntry {
            name: self.name.clone(),
            family: AddressFamily::of(&self.ip),
            ip: self.ip,
            status: self.status,
            ttl: self.ttl,
            last_seen: self.last_seen,
            expire_at: expire_at(self.last_seen, self.ttl),
        }
    }
}

pub(crate) struct ServiceState {
    pub(crate) name: String,
    pub(crate) priority: u16,
    pub(crate) weight: u16,
    pub(crate) port: u16,
    pub(crate) target_host: String,
    pub(crate) txt: TxtRecord,
    pub(crate) addresses: Vec<AddressKey>,
    pub(crate) status: ServiceStatus,
    pub(crate) ttl: u32,
    pub(crate) first_seen: DateTime<Utc>,
    pub(crate) last_seen: DateTime<Utc>,
}

impl ServiceState {
    pub(crate) fn new(display_name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: display_name.to_string(),
            priority: 0,
            weight: 0,
            port: 0,
            target_host: String::new(),
            txt: TxtRecord::new(),
            addresses: Vec::new(),
            status: ServiceStatus::NONE,
            ttl: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    pub(crate) fn associate(&mut self, key: AddressKey) {
        if !self.addresses.contains(&key) {
            self.addresses.push(key);
        }
    }

    pub(crate) fn dissociate(&mut self, key: &AddressKey) {
        self.addresses.retain(|k| k != key);
    }

    /// `resolve` maps an associated key to the current address entry;
    /// keys it cannot resolve are left out.
    pub(crate) fn snapshot<F>(&self, resolve: F) -> ServiceEntry
    where
        F: Fn(&AddressKey) -> Option<AddressEntry>,
    {
        ServiceEntry {
            name: self.name.clone(),
            priority: self.priority,
            weight: self.weight,
            port: self.port,
            target_host: self.target_host.clone(),
            txt: self.txt.clone(),
            addresses: self.addresses.iter().filter_map(resolve).collect(),
            status: self.status,
            ttl: self.ttl,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            expire_at: expire_at(self.last_seen, self.ttl),
        }
    }
}
