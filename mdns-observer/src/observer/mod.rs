//! Observation engine: a live cache of addresses and service instances built
//! from mDNS responses, with scoped listeners.
//!
//! Packets and timer deadlines are processed by one driver task, one packet
//! or one batch of due timers at a time. Listener callbacks run on that task
//! after the engine lock is released.

mod cache;
mod dedup;
mod engine;
mod event;
mod registry;
mod timers;

pub use self::event::{ListenerId, ObserverEvent, Scope, Subject};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use shared::{AddressEntry, EventKind, ServiceEntry};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::config::ObserverConfig;
use crate::error::Result;
use crate::transport::{Handle, MessageKind, Subscription, Transport, TransportEvent};
use self::engine::Engine;
use self::event::Dispatch;

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// False for the timer-only driver left behind by `stop(false)`
    receiving: bool,
}

pub struct Observer {
    handle: Handle,
    engine: Arc<Mutex<Engine>>,
    wake: Arc<Notify>,
    driver: Mutex<Option<Driver>>,
}

impl Observer {
    pub fn new(transport: &Transport, config: ObserverConfig) -> Self {
        Self {
            handle: transport.open(),
            engine: Arc::new(Mutex::new(Engine::new(&config))),
            wake: Arc::new(Notify::new()),
            driver: Mutex::new(None),
        }
    }

    /// Register `callback` for events on `name`. `mask` filters by event
    /// bits; an empty mask receives everything.
    pub fn add_listener<F>(&self, name: &str, callback: F, mask: EventKind) -> Result<ListenerId>
    where
        F: Fn(&ObserverEvent) + Send + Sync + 'static,
    {
        self.engine.lock().add_listener(name, Arc::new(callback), mask)
    }

    /// Like `add_listener`, delivering events on a channel instead.
    pub fn listen(&self, name: &str, mask: EventKind) -> Result<(ListenerId, mpsc::UnboundedReceiver<Arc<ObserverEvent>>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_listener(
            name,
            move |event: &ObserverEvent| {
                let _ = tx.send(Arc::new(event.clone()));
            },
            mask,
        )?;
        Ok((id, rx))
    }

    /// Unknown or already removed ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        self.engine.lock().remove_listener(id);
        self.wake.notify_one();
    }

    pub fn listener_count(&self) -> usize {
        self.engine.lock().listener_count()
    }

    pub fn set_remove_timeout(&self, timeout: Duration) {
        self.engine.lock().set_remove_timeout(timeout);
    }

    /// Drop tracked names that hold neither listeners nor cached entities
    pub fn clean(&self) {
        self.engine.lock().clean();
    }

    pub fn addresses(&self) -> Vec<AddressEntry> {
        self.engine.lock().addresses()
    }

    pub fn services(&self) -> Vec<ServiceEntry> {
        self.engine.lock().services()
    }

    pub fn service(&self, name: &str) -> Option<ServiceEntry> {
        self.engine.lock().service(name)
    }

    /// True while packets are being received
    pub fn is_running(&self) -> bool {
        self.driver.lock().as_ref().is_some_and(|driver| driver.receiving)
    }

    fn spawn_driver(&self, subscription: Option<Subscription>) -> Driver {
        let receiving = subscription.is_some();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drive(
            self.engine.clone(),
            self.wake.clone(),
            subscription,
            cancel.clone(),
        ));
        Driver { cancel, task, receiving }
    }

    /// Subscribe to the transport and start processing. No-op when running.
    pub fn start(&self) {
        let mut driver = self.driver.lock();
        if driver.as_ref().is_some_and(|d| d.receiving) {
            return;
        }
        if let Some(timers_only) = driver.take() {
            timers_only.cancel.cancel();
        }

        let subscription = self.handle.subscribe(MessageKind::Raw);
        *driver = Some(self.spawn_driver(Some(subscription)));
        info!("Observer started");
    }

    /// Stop receiving and release the transport subscription. Without
    /// `clean` the cache keeps ageing: expiry and removal timers still fire.
    /// With `clean`, every cached entity is removed (listeners get Remove
    /// events) and all timers are dropped. No-op when not running, except
    /// that `clean` also clears a cache left by an earlier stop.
    pub async fn stop(&self, clean: bool) {
        let driver = {
            let mut slot = self.driver.lock();
            match slot.as_ref() {
                Some(d) if d.receiving || clean => slot.take(),
                _ => None,
            }
        };
        let Some(driver) = driver else {
            return;
        };
        let receiving = driver.receiving;
        driver.cancel.cancel();
        if let Err(e) = driver.task.await {
            warn!("Observer driver ended abnormally: {}", e);
        }

        if clean {
            let dispatch = self.engine.lock().shutdown();
            dispatch.run(|id| self.engine.lock().is_registered(id));
        } else {
            let mut slot = self.driver.lock();
            if slot.is_none() {
                *slot = Some(self.spawn_driver(None));
            }
        }
        if receiving {
            info!("Observer stopped");
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.cancel.cancel();
        }
    }
}

fn on_packet(engine: &Mutex<Engine>, bytes: &[u8], from: SocketAddr) -> Dispatch {
    engine.lock().handle_packet(bytes, from, Instant::now())
}

fn on_deadline(engine: &Mutex<Engine>) -> Dispatch {
    engine.lock().fire_due(Instant::now())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_event(subscription: Option<&Subscription>) -> Option<TransportEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Runs timers, and packets too when `subscription` is set
async fn drive(
    engine: Arc<Mutex<Engine>>,
    wake: Arc<Notify>,
    subscription: Option<Subscription>,
    cancel: CancellationToken,
) {
    loop {
        let deadline = engine.lock().next_deadline();

        let dispatch = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => continue,
            event = next_event(subscription.as_ref()) => match event {
                Some(TransportEvent::Raw { bytes, from }) => on_packet(&engine, &bytes, from),
                Some(TransportEvent::Closed) => {
                    debug!("Transport socket closed, waiting for it to reopen");
                    continue;
                }
                Some(TransportEvent::Decoded { .. }) => continue,
                None => {
                    warn!("Transport subscription ended");
                    break;
                }
            },
            _ = sleep_until(deadline) => on_deadline(&engine),
        };

        if !dispatch.is_empty() {
            dispatch.run(|id| engine.lock().is_registered(id));
        }
    }
}
