use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use mdns_observer::{Observer, ObserverEvent, Subject};
use shared::EventKind;
use crate::hash;

/// Register one listener per watched name, all feeding a single channel
pub fn subscribe(observer: &Observer, watch: &[String]) -> Result<mpsc::UnboundedReceiver<Arc<ObserverEvent>>> {
    let (tx, rx) = mpsc::unbounded_channel();

    for name in watch {
        let tx = tx.clone();
        observer
            .add_listener(
                name,
                move |event: &ObserverEvent| {
                    let _ = tx.send(Arc::new(event.clone()));
                },
                EventKind::NONE,
            )
            .with_context(|| format!("Failed to watch {:?}", name))?;
        tracing::info!("Watching {}", name);
    }

    Ok(rx)
}

/// One log line per event
pub fn describe(event: &ObserverEvent) -> String {
    let scope = event.scope.name();
    match &event.subject {
        Subject::Address(address) => {
            format!("[{}] {} {} {}", scope, event.kind, address.name, address.ip)
        }
        Subject::Service { service, address: Some(address) } => format!(
            "[{}] {} {} via {} {}",
            scope, event.kind, service.name, address.name, address.ip
        ),
        Subject::Service { service, address: None } => format!(
            "[{}] {} {} at {}:{} ({} txt keys)",
            scope,
            event.kind,
            service.name,
            service.target_host,
            service.port,
            service.txt.len()
        ),
    }
}

/// Event loop: logs observer events and republishes the service hash
/// whenever a service event arrives.
pub async fn run(
    observer: Arc<Observer>,
    mut rx: mpsc::UnboundedReceiver<Arc<ObserverEvent>>,
    hash_tx: watch::Sender<String>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if event.kind.intersects(EventKind::SVC_NEW | EventKind::SVC_REMOVE | EventKind::SVC_OFFLINE) {
                    tracing::info!("{}", describe(&event));
                } else {
                    tracing::debug!("{}", describe(&event));
                }

                if event.service().is_some() {
                    let new_hash = hash::compute_hash(&observer.services());
                    hash_tx.send_if_modified(|current| {
                        if *current == new_hash {
                            return false;
                        }
                        tracing::debug!("Service hash now {}", new_hash);
                        *current = new_hash;
                        true
                    });
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Event monitor shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use mdns_observer::{ObserverConfig, TransportConfig, Transport};

    #[test]
    fn test_describe_address() {
        let now = chrono::Utc::now();
        let event = ObserverEvent {
            kind: EventKind::ADDR_NEW,
            scope: mdns_observer::Scope::Address("printer.local".into()),
            subject: Subject::Address(shared::AddressEntry {
                name: "printer.local".into(),
                family: shared::AddressFamily::V4,
                ip: "192.168.1.50".parse().unwrap(),
                status: shared::AddressStatus::ONLINE,
                ttl: 120,
                last_seen: now,
                expire_at: now,
            }),
        };
        let line = describe(&event);
        assert!(line.starts_with("[printer.local]"));
        assert!(line.ends_with("printer.local 192.168.1.50"));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_empty_name() {
        let transport = Transport::new(TransportConfig::default());
        let observer = Observer::new(&transport, ObserverConfig::default());
        assert!(subscribe(&observer, &["printer.local".into(), " ".into()]).is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let transport = Transport::new(TransportConfig::default());
        let observer = Arc::new(Observer::new(&transport, ObserverConfig::default()));
        let rx = subscribe(&observer, &["_all_".into()]).unwrap();
        let (hash_tx, hash_rx) = watch::channel(hash::compute_hash(&[]));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(observer, rx, hash_tx, cancel.clone()));
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
        assert_eq!(*hash_rx.borrow(), hash::compute_hash(&[]));
    }
}
