use std::net::Ipv4Addr;
use std::time::Duration;

/// mDNS IPv4 multicast group and port (RFC 6762)
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

/// Listener alias for every address name
pub const ALL_ADDRESSES: &str = "_all_addr_";
/// Listener alias for every service instance
pub const ALL_SERVICES: &str = "_all_svc_";
/// Listener alias for both of the above under one registration
pub const ALL: &str = "_all_";

/// Identical packets seen within this window are processed once
pub const DUPLICATE_WINDOW: Duration = Duration::from_secs(5);

/// Grace period between expiry and removal of a cached entity
pub const DEFAULT_REMOVE_TIMEOUT_SECS: u64 = 10;

/// One link-MTU UDP payload (1500 - 20 IPv4 - 8 UDP)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1472;

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// What a listener name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind<'a> {
    AllAddresses,
    AllServices,
    All,
    /// A hostname, e.g. "printer.local"
    Address,
    /// A full instance name, e.g. "myprinter._http._tcp.local"
    ServiceInstance { service_type: &'a str },
    /// A service type, e.g. "_http._tcp.local"
    ServiceType,
}

/// Lowercase, trim whitespace and drop the root label dot.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

/// Split `[instance.]_service._tcp|_udp.local` into its instance part and
/// its service type. Returns `None` for names that are not DNS-SD names.
pub fn split_service_name(name: &str) -> Option<(Option<&str>, &str)> {
    let lower = name.to_ascii_lowercase();
    let body = lower.strip_suffix(".local")?;
    let (rest, proto) = body.rsplit_once('.')?;
    if proto != "_tcp" && proto != "_udp" {
        return None;
    }

    let (instance_len, service) = match rest.rsplit_once('.') {
        Some((instance, service)) if !instance.is_empty() => (Some(instance.len()), service),
        Some(_) => return None,
        None => (None, rest),
    };
    if service.len() < 2 || !service.starts_with('_') {
        return None;
    }

    // byte offsets are the same in `name` and its ascii-lowercased copy
    let type_start = name.len() - (service.len() + 1 + proto.len() + ".local".len());
    Some((instance_len.map(|len| &name[..len]), &name[type_start..]))
}

/// Classify an already normalized listener name.
pub fn classify_name(name: &str) -> NameKind<'_> {
    match name {
        ALL_ADDRESSES => NameKind::AllAddresses,
        ALL_SERVICES => NameKind::AllServices,
        ALL => NameKind::All,
        _ => match split_service_name(name) {
            Some((Some(_), service_type)) => NameKind::ServiceInstance { service_type },
            Some((None, _)) => NameKind::ServiceType,
            None => NameKind::Address,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Printer.LOCAL. "), "printer.local");
        assert_eq!(normalize_name("   "), "");
    }

    #[test]
    fn test_split_service_name() {
        assert_eq!(
            split_service_name("myprinter._http._tcp.local"),
            Some((Some("myprinter"), "_http._tcp.local"))
        );
        assert_eq!(
            split_service_name("Living Room.v2._airplay._tcp.local"),
            Some((Some("Living Room.v2"), "_airplay._tcp.local"))
        );
        assert_eq!(split_service_name("_http._tcp.local"), Some((None, "_http._tcp.local")));
        assert_eq!(split_service_name("printer.local"), None);
        assert_eq!(split_service_name("x._http._sctp.local"), None);
        assert_eq!(split_service_name("x.http._tcp.local"), None);
        assert_eq!(split_service_name("._http._tcp.local"), None);
    }

    #[test]
    fn test_classify_name() {
        assert_eq!(classify_name("_all_"), NameKind::All);
        assert_eq!(classify_name("_all_addr_"), NameKind::AllAddresses);
        assert_eq!(classify_name("_all_svc_"), NameKind::AllServices);
        assert_eq!(classify_name("printer.local"), NameKind::Address);
        assert_eq!(classify_name("_ipp._tcp.local"), NameKind::ServiceType);
        assert_eq!(
            classify_name("office._ipp._tcp.local"),
            NameKind::ServiceInstance { service_type: "_ipp._tcp.local" }
        );
    }
}
