use std::collections::HashSet;
use sha2::{Sha256, Digest as _};

pub(crate) type Digest = [u8; 32];

/// SHA-256 of the raw datagram
pub(crate) fn digest(bytes: &[u8]) -> Digest {
    Sha256::digest(bytes).into()
}

/// Digests of packets seen within the duplicate window. Entries are
/// forgotten by their own timers in the engine's timer queue.
#[derive(Default)]
pub(crate) struct DuplicateFilter {
    seen: HashSet<Digest>,
}

impl DuplicateFilter {
    /// Returns false if `digest` is already inside the window
    pub(crate) fn insert(&mut self, digest: Digest) -> bool {
        self.seen.insert(digest)
    }

    pub(crate) fn forget(&mut self, digest: &Digest) {
        self.seen.remove(digest);
    }

    pub(crate) fn clear(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_deterministic() {
        assert_eq!(digest(b"announce"), digest(b"announce"));
        assert_ne!(digest(b"announce"), digest(b"announce!"));
    }

    #[test]
    fn test_filter_window() {
        let mut filter = DuplicateFilter::default();
        let d = digest(b"packet");
        assert!(filter.insert(d));
        assert!(!filter.insert(d));
        filter.forget(&d);
        assert!(filter.insert(d));
    }
}
