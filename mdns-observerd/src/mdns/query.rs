use std::time::Duration;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use mdns_observer::{dns, Handle, SendOutcome};
use shared::protocol::{classify_name, normalize_name, NameKind};
use crate::config::QueryConfig;

/// Service types worth asking about: watched types, the types of watched
/// instances, and any configured extras. Wildcards and hostnames add none.
pub fn query_types(watch: &[String], extra: &[String]) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();

    for name in watch.iter().chain(extra) {
        let name = normalize_name(name);
        let service_type = match classify_name(&name) {
            NameKind::ServiceType => Some(name.clone()),
            NameKind::ServiceInstance { service_type } => Some(service_type.to_string()),
            _ => None,
        };
        if let Some(service_type) = service_type {
            if !types.contains(&service_type) {
                types.push(service_type);
            }
        }
    }

    types
}

/// Send one multicast PTR question per service type
pub async fn ask(handle: &Handle, types: &[String]) -> Result<()> {
    for service_type in types {
        let message = dns::ptr_query(service_type)
            .with_context(|| format!("Failed to build query for {}", service_type))?;

        match handle.send(&message, None).await {
            Ok(SendOutcome::Sent) => tracing::debug!("Asked for {}", service_type),
            Ok(SendOutcome::Queued) => tracing::debug!("Query for {} queued until the socket reopens", service_type),
            Ok(SendOutcome::Rejected { size, max }) => {
                tracing::warn!("Query for {} is {} bytes, over the {} byte limit", service_type, size, max)
            }
            Err(e) => tracing::error!("Failed to send query for {}: {}", service_type, e),
        }
    }
    Ok(())
}

/// Ask once at startup, then every `interval_secs` if it is nonzero
pub async fn run(handle: Handle, types: Vec<String>, config: QueryConfig, cancel: CancellationToken) -> Result<()> {
    if types.is_empty() {
        tracing::info!("No service types to query");
        return Ok(());
    }

    tracing::info!("Querying {} service types", types.len());
    ask(&handle, &types).await?;

    if config.interval_secs == 0 {
        return Ok(());
    }

    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => ask(&handle, &types).await?,
            _ = cancel.cancelled() => {
                tracing::info!("Query task shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_types_from_watch() {
        let watch = vec![
            "_all_".to_string(),
            "printer.local".to_string(),
            "_HTTP._tcp.local.".to_string(),
            "Kitchen._airplay._tcp.local".to_string(),
            "other._http._tcp.local".to_string(),
        ];
        let extra = vec!["_ipp._tcp.local".to_string()];

        assert_eq!(
            query_types(&watch, &extra),
            vec!["_http._tcp.local", "_airplay._tcp.local", "_ipp._tcp.local"]
        );
    }

    #[test]
    fn test_query_types_empty_for_wildcards() {
        assert!(query_types(&["_all_svc_".to_string()], &[]).is_empty());
    }
}
