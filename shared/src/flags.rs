use serde::{Deserialize, Serialize};

/// Declares a fixed-width flag set with named constants and the usual
/// bitwise operators.
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $bits:ty {
            $(
                $(#[$flag_meta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name($bits);

        impl $name {
            $(
                $(#[$flag_meta])*
                pub const $flag: $name = $name($value);
            )*

            /// No flags set
            pub const NONE: $name = $name(0);

            #[must_use]
            pub const fn from_bits(bits: $bits) -> Self {
                $name(bits)
            }

            #[must_use]
            pub const fn bits(&self) -> $bits {
                self.0
            }

            #[must_use]
            pub const fn is_empty(&self) -> bool {
                self.0 == 0
            }

            /// True if every flag of `other` is set
            #[must_use]
            pub const fn contains(&self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            /// True if any flag of `other` is set
            #[must_use]
            pub const fn intersects(&self, other: $name) -> bool {
                (self.0 & other.0) != 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        /// Names of the single-bit flags that are set, joined by `|`
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut first = true;
                $(
                    if $name::$flag.0.count_ones() == 1 && self.contains($name::$flag) {
                        if !first {
                            f.write_str("|")?;
                        }
                        f.write_str(stringify!($flag))?;
                        first = false;
                    }
                )*
                if first {
                    f.write_str("NONE")?;
                }
                Ok(())
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                $name(self.0 & rhs.0)
            }
        }
    };
}

flag_set! {
    /// Lifecycle status of a cached address.
    pub struct AddressStatus: u16 {
        const ONLINE = 1;
        const EXPIRED = 1 << 1;
        const DETACHED = 1 << 2;
        /// Set only while a packet is being processed
        const PENDING_NOTIFY = 1 << 8;
    }
}

flag_set! {
    /// Lifecycle status of a cached service instance.
    pub struct ServiceStatus: u16 {
        const ONLINE = 1;
        const EXPIRED = 1 << 1;
        const DETACHED = 1 << 2;
        const HAS_TXT = 1 << 3;
        const HAS_IPV4 = 1 << 4;
        const HAS_IPV6 = 1 << 5;
        /// Set only while a packet is being processed
        const PENDING_NOTIFY = 1 << 8;
    }
}

flag_set! {
    /// Event bits delivered to listeners; also used as a listener filter mask.
    ///
    /// Service events occupy the low byte and address events the high byte,
    /// so a relayed address event on a service scope can carry both.
    pub struct EventKind: u16 {
        const SVC_NEW = 1;
        const SVC_RENEW = 1 << 1;
        const SVC_EXPIRE = 1 << 2;
        const SVC_REMOVE = 1 << 3;
        const SVC_OFFLINE = 1 << 4;
        const SVC_ADDR_ONLINE = 1 << 5;
        const SVC_ADDR_OFFLINE = 1 << 6;
        const SVC_ALL = 0x00ff;

        const ADDR_NEW = 1 << 8;
        const ADDR_RENEW = 1 << 9;
        const ADDR_EXPIRE = 1 << 10;
        const ADDR_REMOVE = 1 << 11;
        const ADDR_OFFLINE = 1 << 12;
        const ADDR_ALL = 0xff00;
    }
}

impl EventKind {
    /// Whether a listener registered with this mask wants `event`.
    /// An empty mask accepts everything.
    #[must_use]
    pub const fn accepts(&self, event: EventKind) -> bool {
        self.is_empty() || self.intersects(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_single_bits() {
        assert_eq!((EventKind::SVC_NEW | EventKind::SVC_ADDR_ONLINE).to_string(), "SVC_NEW|SVC_ADDR_ONLINE");
        assert_eq!(EventKind::ADDR_ALL.to_string(), "ADDR_NEW|ADDR_RENEW|ADDR_EXPIRE|ADDR_REMOVE|ADDR_OFFLINE");
        assert_eq!(AddressStatus::NONE.to_string(), "NONE");
    }

    #[test]
    fn test_empty_mask_accepts_everything() {
        assert!(EventKind::NONE.accepts(EventKind::ADDR_REMOVE));
        assert!(EventKind::NONE.accepts(EventKind::SVC_NEW));
    }

    #[test]
    fn test_mask_filters_by_intersection() {
        let mask = EventKind::SVC_NEW | EventKind::SVC_REMOVE;
        assert!(mask.accepts(EventKind::SVC_NEW | EventKind::SVC_ADDR_ONLINE));
        assert!(!mask.accepts(EventKind::SVC_RENEW));
        assert!(EventKind::SVC_ALL.accepts(EventKind::ADDR_NEW | EventKind::SVC_ADDR_ONLINE));
        assert!(!EventKind::SVC_ALL.accepts(EventKind::ADDR_NEW));
    }

    #[test]
    fn test_insert_and_remove() {
        let mut status = ServiceStatus::ONLINE | ServiceStatus::HAS_IPV4;
        status.insert(ServiceStatus::PENDING_NOTIFY);
        status.remove(ServiceStatus::ONLINE);
        assert!(status.contains(ServiceStatus::HAS_IPV4 | ServiceStatus::PENDING_NOTIFY));
        assert!(!status.intersects(ServiceStatus::ONLINE));
    }
}
