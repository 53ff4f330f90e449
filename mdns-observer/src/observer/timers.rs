use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tokio::time::Instant;
use super::dedup::Digest;

/// Identity of whatever a timer acts on. Timers never hold entity state;
/// the engine looks the entity up again when the timer fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    Address { host: String, ip: IpAddr },
    Service(String),
    Digest(Digest),
}

impl TimerKey {
    pub(crate) fn address(host: &str, ip: IpAddr) -> Self {
        TimerKey::Address { host: host.to_string(), ip }
    }

    pub(crate) fn service(name: &str) -> Self {
        TimerKey::Service(name.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerAction {
    /// TTL ran out
    Expire,
    /// Grace period after expiry ran out
    Remove,
    /// Duplicate-suppression entry ran out
    Forget,
}

/// At most one pending timer per key; arming a key replaces its timer.
#[derive(Default)]
pub(crate) struct TimerQueue {
    queue: BTreeMap<(Instant, u64), TimerKey>,
    armed: HashMap<TimerKey, (Instant, u64, TimerAction)>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn arm(&mut self, key: TimerKey, at: Instant, action: TimerAction) {
        self.cancel(&key);
        let seq = self.seq;
        self.seq += 1;
        self.queue.insert((at, seq), key.clone());
        self.armed.insert(key, (at, seq, action));
    }

    /// Returns false if nothing was armed for `key`
    pub(crate) fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.armed.remove(key) {
            Some((at, seq, _)) => {
                self.queue.remove(&(at, seq));
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn action(&self, key: &TimerKey) -> Option<(Instant, TimerAction)> {
        self.armed.get(key).map(|(at, _, action)| (*at, *action))
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Pop the earliest timer due at `now`, with its deadline
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(TimerKey, TimerAction, Instant)> {
        let (&(at, seq), _) = self.queue.iter().next()?;
        if at > now {
            return None;
        }
        let key = self.queue.remove(&(at, seq))?;
        let (_, _, action) = self.armed.remove(&key)?;
        Some((key, action, at))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.armed.len()
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.armed.clear();
    }
}
