use std::fmt;
use std::sync::Arc;
use shared::{AddressEntry, EventKind, ServiceEntry};

/// Handle returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// The name an event is reported under. Service-type listeners receive
/// instance events re-scoped to their type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Address(String),
    ServiceInstance(String),
    ServiceType(String),
}

impl Scope {
    pub fn name(&self) -> &str {
        match self {
            Scope::Address(name) | Scope::ServiceInstance(name) | Scope::ServiceType(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Subject {
    Address(AddressEntry),
    /// `address` is set when an address event is relayed to the service
    Service {
        service: ServiceEntry,
        address: Option<AddressEntry>,
    },
}

/// One notification. Entries are snapshots taken when the event was
/// dispatched; they never change afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverEvent {
    pub kind: EventKind,
    pub scope: Scope,
    pub subject: Subject,
}

impl ObserverEvent {
    pub fn service(&self) -> Option<&ServiceEntry> {
        match &self.subject {
            Subject::Service { service, .. } => Some(service),
            Subject::Address(_) => None,
        }
    }

    /// The address itself, or the relayed address of a service event
    pub fn address(&self) -> Option<&AddressEntry> {
        match &self.subject {
            Subject::Address(address) => Some(address),
            Subject::Service { address, .. } => address.as_ref(),
        }
    }
}

pub(crate) type Callback = Arc<dyn Fn(&ObserverEvent) + Send + Sync>;

pub(crate) struct Delivery {
    listener: ListenerId,
    callback: Callback,
    event: Arc<ObserverEvent>,
}

/// Deliveries computed inside the engine and run after its lock is
/// released, so callbacks may call back into the observer. A listener
/// removed by an earlier callback is skipped.
#[derive(Default)]
pub(crate) struct Dispatch {
    deliveries: Vec<Delivery>,
}

impl Dispatch {
    pub(crate) fn push(&mut self, listener: ListenerId, callback: &Callback, event: &Arc<ObserverEvent>) {
        self.deliveries.push(Delivery {
            listener,
            callback: callback.clone(),
            event: event.clone(),
        });
    }

    pub(crate) fn append(&mut self, mut other: Dispatch) {
        self.deliveries.append(&mut other.deliveries);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// `registered` is asked right before each callback
    pub(crate) fn run<F>(self, registered: F)
    where
        F: Fn(ListenerId) -> bool,
    {
        for delivery in self.deliveries {
            if registered(delivery.listener) {
                (delivery.callback)(&delivery.event);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn events(&self) -> Vec<ObserverEvent> {
        self.deliveries.iter().map(|d| (*d.event).clone()).collect()
    }
}
