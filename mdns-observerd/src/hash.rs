use std::net::IpAddr;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::{ServiceEntry, TxtRecord};

/// Only stable fields: timestamps and TTLs change on every refresh without
/// the service itself changing.
#[derive(Serialize)]
struct HashView<'a> {
    name: &'a str,
    target_host: &'a str,
    addresses: Vec<IpAddr>,
    port: u16,
    txt: &'a TxtRecord,
    online: bool,
}

/// SHA-256 of the service list, sorted by instance name.
pub fn compute_hash(services: &[ServiceEntry]) -> String {
    let mut indices: Vec<usize> = (0..services.len()).collect();
    indices.sort_by(|&a, &b| services[a].name.cmp(&services[b].name));

    let views: Vec<HashView<'_>> = indices
        .iter()
        .map(|&i| {
            let s = &services[i];
            let mut addresses: Vec<IpAddr> = s.addresses.iter().map(|a| a.ip).collect();
            addresses.sort();
            HashView {
                name: &s.name,
                target_host: &s.target_host,
                addresses,
                port: s.port,
                txt: &s.txt,
                online: s.is_online(),
            }
        })
        .collect();

    // plain data, serialization cannot fail
    let json = serde_json::to_vec(&views).unwrap_or_default();

    let hash = Sha256::digest(&json);
    hex::encode(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::{AddressEntry, AddressFamily, AddressStatus, ServiceStatus, TxtValue};

    fn test_entry(name: &str) -> ServiceEntry {
        let now = Utc::now();
        let mut txt = TxtRecord::new();
        txt.insert("path", TxtValue::Text("/".into()));
        ServiceEntry {
            name: name.to_string(),
            priority: 0,
            weight: 0,
            port: 8080,
            target_host: "test.local".to_string(),
            txt,
            addresses: vec![AddressEntry {
                name: "test.local".to_string(),
                family: AddressFamily::V4,
                ip: "192.168.1.10".parse().unwrap(),
                status: AddressStatus::ONLINE,
                ttl: 120,
                last_seen: now,
                expire_at: now,
            }],
            status: ServiceStatus::ONLINE | ServiceStatus::HAS_IPV4,
            ttl: 4500,
            first_seen: now,
            last_seen: now,
            expire_at: now,
        }
    }

    #[test]
    fn test_hash_deterministic() {
        let entry1 = test_entry("a._http._tcp.local");
        let entry2 = test_entry("b._http._tcp.local");

        let hash1 = compute_hash(&[entry1.clone(), entry2.clone()]);
        let hash2 = compute_hash(&[entry2, entry1]);

        assert_eq!(hash1, hash2, "Hash should be same regardless of input order");
    }

    #[test]
    fn test_hash_changes_on_modification() {
        let entry1 = test_entry("a._http._tcp.local");
        let mut entry2 = test_entry("a._http._tcp.local");

        let hash1 = compute_hash(&[entry1]);

        entry2.port = 9090;
        let hash2 = compute_hash(&[entry2.clone()]);
        assert_ne!(hash1, hash2, "Hash should change when entry changes");

        entry2.status.remove(ServiceStatus::ONLINE);
        assert_ne!(hash2, compute_hash(&[entry2]), "Hash should change when a service goes offline");
    }

    #[test]
    fn test_hash_stable_across_refresh() {
        let entry1 = test_entry("a._http._tcp.local");
        let mut entry2 = test_entry("a._http._tcp.local");
        entry2.last_seen = Utc::now() + chrono::Duration::seconds(60);
        entry2.first_seen = Utc::now() - chrono::Duration::seconds(60);
        entry2.ttl = 9999;
        entry2.addresses[0].ttl = 10;

        assert_eq!(compute_hash(&[entry1]), compute_hash(&[entry2]));
    }
}
