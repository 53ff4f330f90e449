//! Cache state machine. Everything here is synchronous: the driver feeds it
//! packets and clock ticks and runs the returned deliveries.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use chrono::Utc;
use shared::{AddressEntry, AddressFamily, AddressStatus, EventKind, ServiceEntry, ServiceStatus, TxtRecord};
use shared::protocol::DUPLICATE_WINDOW;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::ObserverConfig;
use crate::dns::{self, RecordData};
use crate::error::Result;
use super::cache::{AddressKey, AddressState, ServiceState};
use super::dedup::{self, DuplicateFilter};
use super::event::{Callback, Dispatch, ListenerId, Subject};
use super::registry::Registry;
use super::timers::{TimerAction, TimerKey, TimerQueue};

/// A notification queued during one pass; dispatched in queue order.
enum Note {
    Address {
        kind: EventKind,
        entry: AddressEntry,
    },
    Service {
        kind: EventKind,
        name: String,
        /// Used when the service is gone by dispatch time
        entry: ServiceEntry,
        /// Status before the pass, for services the pass itself touched
        before: Option<ServiceStatus>,
        relayed: Option<AddressEntry>,
    },
}

#[derive(Default)]
struct Pass {
    notes: Vec<Note>,
}

struct Announcement {
    display_name: String,
    ttl: u32,
    priority: u16,
    weight: u16,
    port: u16,
    target: String,
}

/// Replace the value for `key` or append it, keeping first-seen order
fn upsert<K: PartialEq, V>(list: &mut Vec<(K, V)>, key: K, value: V) {
    match list.iter_mut().find(|(k, _)| *k == key) {
        Some((_, existing)) => *existing = value,
        None => list.push((key, value)),
    }
}

fn family_flag(family: AddressFamily) -> ServiceStatus {
    match family {
        AddressFamily::V4 => ServiceStatus::HAS_IPV4,
        AddressFamily::V6 => ServiceStatus::HAS_IPV6,
    }
}

fn ttl(seconds: u32) -> Duration {
    Duration::from_secs(u64::from(seconds))
}

pub(crate) struct Engine {
    registry: Registry,
    timers: TimerQueue,
    duplicates: DuplicateFilter,
    remove_timeout: Duration,
}

impl Engine {
    pub(crate) fn new(config: &ObserverConfig) -> Self {
        Self {
            registry: Registry::default(),
            timers: TimerQueue::default(),
            duplicates: DuplicateFilter::default(),
            remove_timeout: config.remove_timeout(),
        }
    }

    pub(crate) fn set_remove_timeout(&mut self, timeout: Duration) {
        self.remove_timeout = timeout;
    }

    pub(crate) fn add_listener(&mut self, name: &str, callback: Callback, mask: EventKind) -> Result<ListenerId> {
        self.registry.add(name, mask, callback)
    }

    pub(crate) fn remove_listener(&mut self, id: ListenerId) {
        self.registry.remove(id, &mut self.timers);
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.registry.listener_count()
    }

    pub(crate) fn is_registered(&self, id: ListenerId) -> bool {
        self.registry.is_registered(id)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    #[cfg(test)]
    pub(crate) fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub(crate) fn addresses(&self) -> Vec<AddressEntry> {
        self.registry
            .hosts
            .values()
            .flat_map(|bucket| bucket.entries.iter().map(AddressState::snapshot))
            .collect()
    }

    pub(crate) fn services(&self) -> Vec<ServiceEntry> {
        self.registry
            .instances
            .values()
            .filter_map(|bucket| bucket.service.as_ref())
            .map(|service| self.snapshot_service(service))
            .collect()
    }

    pub(crate) fn service(&self, name: &str) -> Option<ServiceEntry> {
        let name = shared::protocol::normalize_name(name);
        self.registry.service(&name).map(|service| self.snapshot_service(service))
    }

    fn snapshot_service(&self, service: &ServiceState) -> ServiceEntry {
        service.snapshot(|(host, ip)| self.registry.address(host, *ip).map(AddressState::snapshot))
    }

    fn live_service(&self, name: &str) -> Option<ServiceEntry> {
        self.registry.service(name).map(|service| self.snapshot_service(service))
    }

    /// Drop tracked names that hold neither listeners nor entities
    pub(crate) fn clean(&mut self) {
        self.registry.prune();
    }

    /// One inbound datagram
    pub(crate) fn handle_packet(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) -> Dispatch {
        if self.registry.is_idle() {
            return Dispatch::default();
        }
        if !dns::is_valid_reply(bytes, None, Some(dns::RCODE_OK)) {
            trace!("Ignoring non-reply datagram from {}", from);
            return Dispatch::default();
        }

        let digest = dedup::digest(bytes);
        if !self.duplicates.insert(digest) {
            trace!("Ignoring duplicate datagram from {}", from);
            return Dispatch::default();
        }
        self.timers.arm(TimerKey::Digest(digest), now + DUPLICATE_WINDOW, TimerAction::Forget);

        let Some(message) = dns::decode(bytes) else {
            debug!("Malformed response from {}", from);
            return Dispatch::default();
        };

        let mut pass = Pass::default();
        let mut srv: Vec<(String, Announcement)> = Vec::new();
        let mut txt: Vec<(String, TxtRecord)> = Vec::new();
        let mut addresses: Vec<(String, Vec<(IpAddr, u32)>)> = Vec::new();

        for record in dns::cache_records(&message) {
            if record.ttl == 0 {
                if !record.cache_flush {
                    continue;
                }
                match record.data {
                    RecordData::Srv { .. } => self.service_goodbye(&mut pass, &record.name, now),
                    RecordData::Addr(ip) => self.address_goodbye(&mut pass, &record.name, ip, now),
                    RecordData::Txt(_) => {}
                }
                continue;
            }

            match record.data {
                RecordData::Srv { priority, weight, port, target } => {
                    if self.registry.watches_all_instances() {
                        self.registry.track_instance(&record.name);
                    }
                    let announcement = Announcement {
                        display_name: record.display_name,
                        ttl: record.ttl,
                        priority,
                        weight,
                        port,
                        target,
                    };
                    upsert(&mut srv, record.name, announcement);
                }
                RecordData::Txt(record_txt) => upsert(&mut txt, record.name, record_txt),
                RecordData::Addr(ip) => {
                    if self.registry.watches_all_hosts() {
                        self.registry.track_host(&record.name);
                    }
                    let index = match addresses.iter().position(|(host, _)| *host == record.name) {
                        Some(index) => index,
                        None => {
                            addresses.push((record.name, Vec::new()));
                            addresses.len() - 1
                        }
                    };
                    upsert(&mut addresses[index].1, ip, record.ttl);
                }
            }
        }

        for (name, announcement) in &srv {
            self.apply_srv(&mut pass, name, announcement, &addresses, now);
        }

        for (name, record) in txt {
            if let Some(service) = self.registry.service_mut(&name) {
                service.txt = record;
                service.status.insert(ServiceStatus::HAS_TXT);
            }
        }

        for (host, records) in &addresses {
            self.apply_addresses(&mut pass, host, records, now);
        }

        self.flush(pass)
    }

    fn apply_srv(
        &mut self,
        pass: &mut Pass,
        name: &str,
        announcement: &Announcement,
        refreshed: &[(String, Vec<(IpAddr, u32)>)],
        now: Instant,
    ) {
        let Some(bucket) = self.registry.instances.get(name) else {
            return;
        };
        let target = announcement.target.as_str();
        let bound = bucket.target.clone();
        let rebound = bound.as_deref() != Some(target);

        if let Some(old) = bound.filter(|old| old != target) {
            debug!("Service {} moved from {} to {}", name, old, target);
            // snapshot before unbinding, the old host may be released
            let associated: Vec<AddressEntry> = self
                .registry
                .service(name)
                .map(|service| {
                    service
                        .addresses
                        .iter()
                        .filter_map(|(host, ip)| self.registry.address(host, *ip).map(AddressState::snapshot))
                        .collect()
                })
                .unwrap_or_default();
            self.registry.unbind_target(name, &mut self.timers);
            for address in associated {
                self.relay(pass, name, EventKind::ADDR_REMOVE, address);
            }
        }
        if rebound {
            self.registry.bind_target(name, target);
        }

        let Some(bucket) = self.registry.instances.get_mut(name) else {
            return;
        };
        let (kind, before) = match bucket.service.as_mut() {
            Some(service) => {
                service.status.remove(ServiceStatus::EXPIRED);
                (EventKind::SVC_RENEW, service.status)
            }
            None => (EventKind::SVC_NEW, ServiceStatus::NONE),
        };
        let service = bucket
            .service
            .get_or_insert_with(|| ServiceState::new(&announcement.display_name));
        service.priority = announcement.priority;
        service.weight = announcement.weight;
        service.port = announcement.port;
        service.target_host = target.to_string();
        service.ttl = announcement.ttl;
        service.last_seen = Utc::now();
        service.status.insert(ServiceStatus::ONLINE | ServiceStatus::PENDING_NOTIFY);

        self.timers.arm(TimerKey::service(name), now + ttl(announcement.ttl), TimerAction::Expire);
        trace!("{} for service {}", kind, name);
        self.queue_service(pass, kind, name, Some(before), None);

        if rebound {
            self.seed(pass, name, target, refreshed);
        }
    }

    /// Tell a newly bound service about addresses already cached for its
    /// target. Addresses refreshed by the current packet relay on their own.
    fn seed(&mut self, pass: &mut Pass, name: &str, target: &str, refreshed: &[(String, Vec<(IpAddr, u32)>)]) {
        let refreshing: Vec<IpAddr> = refreshed
            .iter()
            .find(|(host, _)| host == target)
            .map(|(_, records)| records.iter().map(|(ip, _)| *ip).collect())
            .unwrap_or_default();
        let cached: Vec<AddressEntry> = match self.registry.hosts.get(target) {
            Some(bucket) => bucket
                .entries
                .iter()
                .filter(|entry| !refreshing.contains(&entry.ip))
                .map(AddressState::snapshot)
                .collect(),
            None => return,
        };

        for address in cached {
            if address.status.contains(AddressStatus::ONLINE) {
                self.relay(pass, name, EventKind::ADDR_NEW, address);
            } else {
                if let Some(service) = self.registry.service_mut(name) {
                    service.associate((address.name.clone(), address.ip));
                }
                self.relay(pass, name, EventKind::ADDR_OFFLINE, address);
            }
        }
    }

    fn apply_addresses(&mut self, pass: &mut Pass, host: &str, records: &[(IpAddr, u32)], now: Instant) {
        for &(ip, seconds) in records {
            let Some(bucket) = self.registry.hosts.get_mut(host) else {
                return;
            };
            let kind = match bucket.entry_mut(ip) {
                Some(entry) => {
                    entry.refresh(seconds);
                    EventKind::ADDR_RENEW
                }
                None => {
                    let mut entry = AddressState::new(host, ip);
                    entry.refresh(seconds);
                    bucket.entries.push(entry);
                    EventKind::ADDR_NEW
                }
            };
            let Some(snapshot) = bucket.entry(ip).map(AddressState::snapshot) else {
                continue;
            };

            self.timers.arm(TimerKey::address(host, ip), now + ttl(seconds), TimerAction::Expire);
            trace!("{} for {} {}", kind, host, ip);
            self.queue_address(pass, kind, snapshot);
        }
    }

    fn address_goodbye(&mut self, pass: &mut Pass, host: &str, ip: IpAddr, now: Instant) {
        let Some(entry) = self.registry.hosts.get_mut(host).and_then(|b| b.entry_mut(ip)) else {
            return;
        };
        entry.status.remove(AddressStatus::ONLINE);
        entry.status.insert(AddressStatus::EXPIRED | AddressStatus::PENDING_NOTIFY);
        let snapshot = entry.snapshot();

        self.timers.arm(TimerKey::address(host, ip), now + self.remove_timeout, TimerAction::Remove);
        debug!("Goodbye from {} {}", host, ip);
        self.queue_address(pass, EventKind::ADDR_OFFLINE, snapshot);
    }

    fn service_goodbye(&mut self, pass: &mut Pass, name: &str, now: Instant) {
        let Some(service) = self.registry.service_mut(name) else {
            return;
        };
        service.status.remove(ServiceStatus::ONLINE);
        service.status.insert(ServiceStatus::EXPIRED);
        let before = service.status;
        service.status.insert(ServiceStatus::PENDING_NOTIFY);

        self.timers.arm(TimerKey::service(name), now + self.remove_timeout, TimerAction::Remove);
        debug!("Goodbye from service {}", name);
        self.queue_service(pass, EventKind::SVC_OFFLINE, name, Some(before), None);
    }

    /// Queue an address event and relay it to every service targeting the host
    fn queue_address(&mut self, pass: &mut Pass, kind: EventKind, entry: AddressEntry) {
        let services = self
            .registry
            .hosts
            .get(&entry.name)
            .map(|bucket| bucket.targeting_services())
            .unwrap_or_default();

        pass.notes.push(Note::Address { kind, entry: entry.clone() });
        for service in services {
            self.relay(pass, &service, kind, entry.clone());
        }
    }

    fn queue_service(
        &mut self,
        pass: &mut Pass,
        kind: EventKind,
        name: &str,
        before: Option<ServiceStatus>,
        relayed: Option<AddressEntry>,
    ) {
        let Some(entry) = self.live_service(name) else {
            return;
        };
        pass.notes.push(Note::Service {
            kind,
            name: name.to_string(),
            entry,
            before,
            relayed,
        });
    }

    /// Apply an address event to the service's address set and family
    /// flags, then queue it on the service scope.
    fn relay(&mut self, pass: &mut Pass, name: &str, kind: EventKind, address: AddressEntry) {
        let key: AddressKey = (address.name.clone(), address.ip);
        let mut kind = kind;

        if kind.intersects(EventKind::ADDR_NEW | EventKind::ADDR_RENEW) {
            let Some(service) = self.registry.service_mut(name) else {
                return;
            };
            service.associate(key);
            let flag = family_flag(address.family);
            if !service.status.contains(flag) {
                service.status.insert(flag);
                kind.insert(EventKind::SVC_ADDR_ONLINE);
            }
        } else if kind.intersects(EventKind::ADDR_REMOVE | EventKind::ADDR_OFFLINE) {
            let Some(service) = self.registry.service_mut(name) else {
                return;
            };
            if kind.contains(EventKind::ADDR_REMOVE) {
                service.dissociate(&key);
            }
            let members = service.addresses.clone();
            let (mut v4, mut v6) = (false, false);
            for (host, ip) in &members {
                match self.registry.address(host, *ip) {
                    Some(entry) if entry.is_online() => match AddressFamily::of(ip) {
                        AddressFamily::V4 => v4 = true,
                        AddressFamily::V6 => v6 = true,
                    },
                    _ => {}
                }
            }

            let Some(service) = self.registry.service_mut(name) else {
                return;
            };
            for (flag, online) in [(ServiceStatus::HAS_IPV4, v4), (ServiceStatus::HAS_IPV6, v6)] {
                if !online && service.status.contains(flag) {
                    service.status.remove(flag);
                    kind.insert(EventKind::SVC_ADDR_OFFLINE);
                }
            }
        } else if self.registry.service(name).is_none() {
            return;
        }

        // the service's own event reports the flag change
        if self
            .registry
            .service(name)
            .is_some_and(|service| service.status.contains(ServiceStatus::PENDING_NOTIFY))
        {
            kind.remove(EventKind::SVC_ADDR_ONLINE | EventKind::SVC_ADDR_OFFLINE);
        }

        self.queue_service(pass, kind, name, None, Some(address));
    }

    /// Clear pending markers, then compute deliveries in queue order
    fn flush(&mut self, pass: Pass) -> Dispatch {
        for note in &pass.notes {
            match note {
                Note::Address { entry, .. } => {
                    if let Some(state) = self.registry.hosts.get_mut(&entry.name).and_then(|b| b.entry_mut(entry.ip)) {
                        state.status.remove(AddressStatus::PENDING_NOTIFY);
                    }
                }
                Note::Service { name, .. } => {
                    if let Some(service) = self.registry.service_mut(name) {
                        service.status.remove(ServiceStatus::PENDING_NOTIFY);
                    }
                }
            }
        }

        let mut out = Dispatch::default();
        for note in pass.notes {
            match note {
                Note::Address { kind, entry } => {
                    let entry = self.current_address(entry);
                    let name = entry.name.clone();
                    self.registry.notify_host(&mut out, kind, &name, Subject::Address(entry));
                }
                Note::Service { mut kind, name, entry, before, relayed } => {
                    let service = self.live_service(&name).unwrap_or(entry);
                    let relayed = relayed.map(|address| self.current_address(address));
                    if let Some(before) = before {
                        for flag in [ServiceStatus::HAS_IPV4, ServiceStatus::HAS_IPV6] {
                            match (before.contains(flag), service.status.contains(flag)) {
                                (false, true) => kind.insert(EventKind::SVC_ADDR_ONLINE),
                                (true, false) => kind.insert(EventKind::SVC_ADDR_OFFLINE),
                                _ => {}
                            }
                        }
                    }
                    self.registry.notify_instance(
                        &mut out,
                        kind,
                        &name,
                        Subject::Service { service, address: relayed },
                    );
                }
            }
        }
        out
    }

    /// Live snapshot of a queued address, or the queued one if it is gone
    fn current_address(&self, queued: AddressEntry) -> AddressEntry {
        match self.registry.address(&queued.name, queued.ip) {
            Some(state) => state.snapshot(),
            None => {
                let mut entry = queued;
                entry.status.remove(AddressStatus::PENDING_NOTIFY);
                entry
            }
        }
    }

    /// Fire every timer due at `now`
    pub(crate) fn fire_due(&mut self, now: Instant) -> Dispatch {
        let mut out = Dispatch::default();
        while let Some((key, action, deadline)) = self.timers.pop_due(now) {
            let mut pass = Pass::default();
            match key {
                TimerKey::Digest(digest) => self.duplicates.forget(&digest),
                TimerKey::Address { host, ip } => match action {
                    TimerAction::Expire => self.expire_address(&mut pass, &host, ip, deadline),
                    _ => self.remove_address(&mut pass, &host, ip),
                },
                TimerKey::Service(name) => match action {
                    TimerAction::Expire => self.expire_service(&mut pass, &name, deadline),
                    _ => self.remove_service(&mut pass, &name),
                },
            }
            out.append(self.flush(pass));
        }
        out
    }

    fn expire_address(&mut self, pass: &mut Pass, host: &str, ip: IpAddr, deadline: Instant) {
        let Some(entry) = self.registry.hosts.get_mut(host).and_then(|b| b.entry_mut(ip)) else {
            return;
        };
        entry.status.insert(AddressStatus::EXPIRED);
        let snapshot = entry.snapshot();
        self.timers.arm(TimerKey::address(host, ip), deadline + self.remove_timeout, TimerAction::Remove);
        debug!("Address {} {} expired", host, ip);
        self.queue_address(pass, EventKind::ADDR_EXPIRE, snapshot);
    }

    fn remove_address(&mut self, pass: &mut Pass, host: &str, ip: IpAddr) {
        let Some(bucket) = self.registry.hosts.get_mut(host) else {
            return;
        };
        let Some(position) = bucket.entries.iter().position(|e| e.ip == ip) else {
            return;
        };
        let mut state = bucket.entries.remove(position);
        state.status.insert(AddressStatus::DETACHED);
        debug!("Address {} {} removed", host, ip);
        self.queue_address(pass, EventKind::ADDR_REMOVE, state.snapshot());
    }

    fn expire_service(&mut self, pass: &mut Pass, name: &str, deadline: Instant) {
        let Some(service) = self.registry.service_mut(name) else {
            return;
        };
        service.status.insert(ServiceStatus::EXPIRED);
        self.timers.arm(TimerKey::service(name), deadline + self.remove_timeout, TimerAction::Remove);
        debug!("Service {} expired", name);
        self.queue_service(pass, EventKind::SVC_EXPIRE, name, None, None);
    }

    fn remove_service(&mut self, pass: &mut Pass, name: &str) {
        let Some(mut service) = self.registry.instances.get_mut(name).and_then(|b| b.service.take()) else {
            return;
        };
        service.status.insert(ServiceStatus::DETACHED);
        let entry = self.snapshot_service(&service);
        self.registry.unbind_target(name, &mut self.timers);
        debug!("Service {} removed", name);
        pass.notes.push(Note::Service {
            kind: EventKind::SVC_REMOVE,
            name: name.to_string(),
            entry,
            before: None,
            relayed: None,
        });
    }

    /// Remove every cached entity with Remove events, addresses first,
    /// and release every timer.
    pub(crate) fn shutdown(&mut self) -> Dispatch {
        let mut pass = Pass::default();

        let addresses: Vec<(String, IpAddr)> = self
            .registry
            .hosts
            .iter()
            .flat_map(|(host, bucket)| bucket.entries.iter().map(move |e| (host.clone(), e.ip)))
            .collect();
        for (host, ip) in addresses {
            self.timers.cancel(&TimerKey::address(&host, ip));
            self.remove_address(&mut pass, &host, ip);
        }

        let services: Vec<String> = self
            .registry
            .instances
            .iter()
            .filter(|(_, bucket)| bucket.service.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        for name in services {
            self.timers.cancel(&TimerKey::service(&name));
            self.remove_service(&mut pass, &name);
        }

        let out = self.flush(pass);
        self.timers.clear();
        self.duplicates.clear();
        self.registry.prune();
        out
    }
}
