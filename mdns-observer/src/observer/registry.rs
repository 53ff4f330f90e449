//! Listener registry and the per-name buckets that own cached entities.
//!
//! A name is tracked while it has a bucket. Buckets are created by listener
//! registration, by SRV targets of tracked services, and by announcements
//! seen while a wildcard listener of the matching kind exists. They are
//! released when nothing keeps them alive any more.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use shared::EventKind;
use shared::protocol::{classify_name, normalize_name, NameKind};
use tracing::debug;
use crate::error::{Error, Result};
use super::cache::{AddressState, ServiceState};
use super::event::{Callback, Dispatch, ListenerId, ObserverEvent, Scope, Subject};
use super::timers::{TimerKey, TimerQueue};

#[derive(Clone)]
pub(crate) enum Listener {
    User {
        id: ListenerId,
        mask: EventKind,
        callback: Callback,
    },
    /// Relays address events of a host to the service whose SRV targets it
    ServiceTarget(String),
    /// Relays instance events to the listeners of a service type
    ServiceType(String),
}

impl Listener {
    fn is_user(&self, listener: ListenerId) -> bool {
        matches!(self, Listener::User { id, .. } if *id == listener)
    }
}

#[derive(Default)]
pub(crate) struct HostBucket {
    pub(crate) listeners: Vec<Listener>,
    pub(crate) entries: Vec<AddressState>,
}

impl HostBucket {
    pub(crate) fn entry(&self, ip: IpAddr) -> Option<&AddressState> {
        self.entries.iter().find(|e| e.ip == ip)
    }

    pub(crate) fn entry_mut(&mut self, ip: IpAddr) -> Option<&mut AddressState> {
        self.entries.iter_mut().find(|e| e.ip == ip)
    }

    /// Services whose SRV target is this host
    pub(crate) fn targeting_services(&self) -> Vec<String> {
        self.listeners
            .iter()
            .filter_map(|l| match l {
                Listener::ServiceTarget(service) => Some(service.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct InstanceBucket {
    pub(crate) listeners: Vec<Listener>,
    pub(crate) service: Option<ServiceState>,
    /// Host bucket this instance relays from
    pub(crate) target: Option<String>,
}

#[derive(Debug, Clone)]
enum Site {
    /// `None` is the wildcard
    Host(Option<String>),
    Instance(Option<String>),
    Type(String),
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) hosts: BTreeMap<String, HostBucket>,
    pub(crate) instances: BTreeMap<String, InstanceBucket>,
    types: BTreeMap<String, Vec<Listener>>,
    all_hosts: Vec<Listener>,
    all_instances: Vec<Listener>,
    sites: HashMap<ListenerId, Vec<Site>>,
    next_id: u64,
}

impl Registry {
    /// Nothing is listening and nothing is tracked
    pub(crate) fn is_idle(&self) -> bool {
        self.hosts.is_empty()
            && self.instances.is_empty()
            && self.types.is_empty()
            && self.all_hosts.is_empty()
            && self.all_instances.is_empty()
    }

    pub(crate) fn watches_all_hosts(&self) -> bool {
        !self.all_hosts.is_empty()
    }

    pub(crate) fn watches_all_instances(&self) -> bool {
        !self.all_instances.is_empty()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.sites.len()
    }

    pub(crate) fn is_registered(&self, id: ListenerId) -> bool {
        self.sites.contains_key(&id)
    }

    pub(crate) fn address(&self, host: &str, ip: IpAddr) -> Option<&AddressState> {
        self.hosts.get(host)?.entry(ip)
    }

    pub(crate) fn service(&self, name: &str) -> Option<&ServiceState> {
        self.instances.get(name)?.service.as_ref()
    }

    pub(crate) fn service_mut(&mut self, name: &str) -> Option<&mut ServiceState> {
        self.instances.get_mut(name)?.service.as_mut()
    }

    pub(crate) fn add(&mut self, name: &str, mask: EventKind, callback: Callback) -> Result<ListenerId> {
        let name = normalize_name(name);
        if name.is_empty() {
            return Err(Error::InvalidArgument("listener name is empty".into()));
        }

        let id = ListenerId(self.next_id);
        self.next_id += 1;

        let sites = match classify_name(&name) {
            NameKind::AllAddresses => vec![Site::Host(None)],
            NameKind::AllServices => vec![Site::Instance(None)],
            NameKind::All => vec![Site::Host(None), Site::Instance(None)],
            NameKind::Address => vec![Site::Host(Some(name.clone()))],
            NameKind::ServiceInstance { .. } => vec![Site::Instance(Some(name.clone()))],
            NameKind::ServiceType => vec![Site::Type(name.clone())],
        };

        let listener = Listener::User { id, mask, callback };
        for site in &sites {
            self.attach(site, listener.clone());
        }
        debug!("Added {} on {} with mask {:#06x}", id, name, mask.bits());
        self.sites.insert(id, sites);
        Ok(id)
    }

    fn attach(&mut self, site: &Site, listener: Listener) {
        match site {
            Site::Host(None) => self.all_hosts.push(listener),
            Site::Instance(None) => self.all_instances.push(listener),
            Site::Host(Some(name)) => self.hosts.entry(name.clone()).or_default().listeners.push(listener),
            Site::Instance(Some(name)) => self.instances.entry(name.clone()).or_default().listeners.push(listener),
            Site::Type(service_type) => {
                let listeners = self.types.entry(service_type.clone()).or_default();
                if listeners.is_empty() {
                    self.all_instances.push(Listener::ServiceType(service_type.clone()));
                }
                listeners.push(listener);
            }
        }
    }

    /// Unknown ids are ignored
    pub(crate) fn remove(&mut self, id: ListenerId, timers: &mut TimerQueue) {
        let Some(sites) = self.sites.remove(&id) else {
            return;
        };

        for site in sites {
            match site {
                Site::Host(None) => {
                    self.all_hosts.retain(|l| !l.is_user(id));
                    self.release_unwatched_hosts(timers);
                }
                Site::Instance(None) => {
                    self.all_instances.retain(|l| !l.is_user(id));
                    self.release_unwatched_instances(timers);
                }
                Site::Host(Some(name)) => {
                    if let Some(bucket) = self.hosts.get_mut(&name) {
                        bucket.listeners.retain(|l| !l.is_user(id));
                    }
                    self.retain_host(&name, timers);
                }
                Site::Instance(Some(name)) => {
                    if let Some(bucket) = self.instances.get_mut(&name) {
                        bucket.listeners.retain(|l| !l.is_user(id));
                    }
                    self.retain_instance(&name, timers);
                }
                Site::Type(service_type) => {
                    let empty = match self.types.get_mut(&service_type) {
                        Some(listeners) => {
                            listeners.retain(|l| !l.is_user(id));
                            listeners.is_empty()
                        }
                        None => false,
                    };
                    if empty {
                        self.types.remove(&service_type);
                        self.all_instances
                            .retain(|l| !matches!(l, Listener::ServiceType(t) if *t == service_type));
                        self.release_unwatched_instances(timers);
                    }
                }
            }
        }
        debug!("Removed {}", id);
    }

    /// Track `name` as a host if it is not tracked yet
    pub(crate) fn track_host(&mut self, name: &str) {
        self.hosts.entry(name.to_string()).or_default();
    }

    pub(crate) fn track_instance(&mut self, name: &str) {
        self.instances.entry(name.to_string()).or_default();
    }

    /// Start relaying address events of `host` to `service`
    pub(crate) fn bind_target(&mut self, service: &str, host: &str) {
        if let Some(bucket) = self.instances.get_mut(service) {
            bucket.target = Some(host.to_string());
        }
        self.hosts
            .entry(host.to_string())
            .or_default()
            .listeners
            .push(Listener::ServiceTarget(service.to_string()));
    }

    /// Stop relaying; the host bucket is released if nothing else keeps it
    pub(crate) fn unbind_target(&mut self, service: &str, timers: &mut TimerQueue) {
        let Some(host) = self.instances.get_mut(service).and_then(|b| b.target.take()) else {
            return;
        };
        if let Some(bucket) = self.hosts.get_mut(&host) {
            bucket
                .listeners
                .retain(|l| !matches!(l, Listener::ServiceTarget(s) if s == service));
        }
        self.retain_host(&host, timers);
    }

    fn retain_host(&mut self, name: &str, timers: &mut TimerQueue) {
        if self.watches_all_hosts() {
            return;
        }
        match self.hosts.get(name) {
            Some(bucket) if bucket.listeners.is_empty() => {}
            _ => return,
        }
        if let Some(bucket) = self.hosts.remove(name) {
            for entry in &bucket.entries {
                timers.cancel(&TimerKey::address(name, entry.ip));
            }
            debug!("Stopped tracking host {} ({} cached addresses)", name, bucket.entries.len());
        }
    }

    fn retain_instance(&mut self, name: &str, timers: &mut TimerQueue) {
        if self.watches_all_instances() {
            return;
        }
        match self.instances.get(name) {
            Some(bucket) if bucket.listeners.is_empty() => {}
            _ => return,
        }
        timers.cancel(&TimerKey::service(name));
        self.unbind_target(name, timers);
        if self.instances.remove(name).is_some() {
            debug!("Stopped tracking service {}", name);
        }
    }

    fn release_unwatched_hosts(&mut self, timers: &mut TimerQueue) {
        let names: Vec<String> = self.hosts.keys().cloned().collect();
        for name in names {
            self.retain_host(&name, timers);
        }
    }

    fn release_unwatched_instances(&mut self, timers: &mut TimerQueue) {
        let names: Vec<String> = self.instances.keys().cloned().collect();
        for name in names {
            self.retain_instance(&name, timers);
        }
    }

    /// Drop buckets that hold neither listeners nor entities
    pub(crate) fn prune(&mut self) {
        self.instances
            .retain(|_, b| !b.listeners.is_empty() || b.service.is_some() || b.target.is_some());
        self.hosts
            .retain(|_, b| !b.listeners.is_empty() || !b.entries.is_empty());
    }

    /// Queue deliveries for an address event: the host's own listeners
    /// first, then address wildcards.
    pub(crate) fn notify_host(&self, out: &mut Dispatch, kind: EventKind, name: &str, subject: Subject) {
        let event = Arc::new(ObserverEvent {
            kind,
            scope: Scope::Address(name.to_string()),
            subject,
        });
        if let Some(bucket) = self.hosts.get(name) {
            push_users(out, &bucket.listeners, &event);
        }
        push_users(out, &self.all_hosts, &event);
    }

    /// Queue deliveries for a service event: the instance's own listeners
    /// first, then service wildcards and matching service types in
    /// registration order.
    pub(crate) fn notify_instance(&self, out: &mut Dispatch, kind: EventKind, name: &str, subject: Subject) {
        let event = Arc::new(ObserverEvent {
            kind,
            scope: Scope::ServiceInstance(name.to_string()),
            subject,
        });
        if let Some(bucket) = self.instances.get(name) {
            push_users(out, &bucket.listeners, &event);
        }

        for listener in &self.all_instances {
            match listener {
                Listener::User { id, mask, callback } => {
                    if mask.accepts(kind) {
                        out.push(*id, callback, &event);
                    }
                }
                Listener::ServiceType(service_type) => {
                    let matches = name
                        .strip_suffix(service_type.as_str())
                        .is_some_and(|instance| instance.ends_with('.'));
                    if !matches {
                        continue;
                    }
                    if let Some(listeners) = self.types.get(service_type) {
                        let typed = Arc::new(ObserverEvent {
                            scope: Scope::ServiceType(service_type.clone()),
                            ..(*event).clone()
                        });
                        push_users(out, listeners, &typed);
                    }
                }
                Listener::ServiceTarget(_) => {}
            }
        }
    }
}

fn push_users(out: &mut Dispatch, listeners: &[Listener], event: &Arc<ObserverEvent>) {
    for listener in listeners {
        if let Listener::User { id, mask, callback } = listener {
            if mask.accepts(event.kind) {
                out.push(*id, callback, event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Arc::new(|_: &ObserverEvent| {})
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut registry = Registry::default();
        assert!(matches!(
            registry.add("  ", EventKind::NONE, noop()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(registry.is_idle());
    }

    #[test]
    fn test_names_route_to_tables() {
        let mut registry = Registry::default();
        registry.add("Printer.local.", EventKind::NONE, noop()).unwrap();
        registry.add("MyPrinter._http._tcp.local", EventKind::NONE, noop()).unwrap();
        registry.add("_ipp._tcp.local", EventKind::NONE, noop()).unwrap();

        assert!(registry.hosts.contains_key("printer.local"));
        assert!(registry.instances.contains_key("myprinter._http._tcp.local"));
        assert!(registry.types.contains_key("_ipp._tcp.local"));
        // a service type is relayed through the instance wildcard
        assert!(registry.watches_all_instances());
        assert!(!registry.watches_all_hosts());
    }

    #[test]
    fn test_all_alias_registers_both_wildcards() {
        let mut registry = Registry::default();
        let mut timers = TimerQueue::default();
        let id = registry.add("_all_", EventKind::NONE, noop()).unwrap();
        assert!(registry.watches_all_hosts());
        assert!(registry.watches_all_instances());

        registry.remove(id, &mut timers);
        assert!(registry.is_idle());
        assert_eq!(registry.listener_count(), 0);
    }

    #[test]
    fn test_remove_releases_bucket_and_timers() {
        let mut registry = Registry::default();
        let mut timers = TimerQueue::default();
        let id = registry.add("printer.local", EventKind::NONE, noop()).unwrap();

        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        registry.hosts.get_mut("printer.local").unwrap().entries.push(AddressState::new("printer.local", ip));
        timers.arm(
            TimerKey::address("printer.local", ip),
            tokio::time::Instant::now(),
            super::super::timers::TimerAction::Expire,
        );

        registry.remove(id, &mut timers);
        registry.remove(id, &mut timers);
        assert!(registry.hosts.is_empty());
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn test_bound_target_keeps_host_alive() {
        let mut registry = Registry::default();
        let mut timers = TimerQueue::default();
        registry.add("myprinter._http._tcp.local", EventKind::NONE, noop()).unwrap();
        let host = registry.add("printer.local", EventKind::NONE, noop()).unwrap();
        registry.bind_target("myprinter._http._tcp.local", "printer.local");

        registry.remove(host, &mut timers);
        assert!(registry.hosts.contains_key("printer.local"));

        registry.unbind_target("myprinter._http._tcp.local", &mut timers);
        assert!(!registry.hosts.contains_key("printer.local"));
    }

    #[test]
    fn test_type_relay_rescopes_event() {
        let mut registry = Registry::default();
        registry.add("_http._tcp.local", EventKind::SVC_NEW, noop()).unwrap();
        registry.add("_ipp._tcp.local", EventKind::NONE, noop()).unwrap();

        let mut out = Dispatch::default();
        let service = super::super::cache::ServiceState::new("a._http._tcp.local").snapshot(|_| None);
        registry.notify_instance(
            &mut out,
            EventKind::SVC_NEW,
            "a._http._tcp.local",
            Subject::Service { service, address: None },
        );

        let events = out.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].scope, Scope::ServiceType("_http._tcp.local".into()));
    }
}
