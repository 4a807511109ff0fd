//! Conversation context store
//!
//! Bounded rolling history of formatted turns, kept per identity and
//! globally, with TTL-based eviction of idle identities. Eviction is
//! asymmetric on purpose: a TTL purge drops the identity's private
//! history and timestamp, but turns already copied into the global
//! history stay there.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long an idle identity's private history survives.
const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(3600);

/// Snapshot of store usage for the `stats` command.
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub total_users: usize,
    pub global_len: usize,
    pub max_len: usize,
    pub enabled: bool,
}

struct Inner {
    max_len: usize,
    user: HashMap<String, VecDeque<String>>,
    global: VecDeque<String>,
    last_activity: HashMap<String, Instant>,
}

/// Shared conversation history with FIFO eviction on overflow.
pub struct ContextStore {
    enabled: bool,
    ttl: Duration,
    inner: RwLock<Inner>,
}

fn push_bounded(deque: &mut VecDeque<String>, turn: String, max_len: usize) {
    if max_len == 0 {
        return;
    }
    while deque.len() >= max_len {
        deque.pop_front();
    }
    deque.push_back(turn);
}

impl ContextStore {
    pub fn new(max_len: usize, enabled: bool) -> Self {
        Self::with_ttl(max_len, enabled, DEFAULT_CONTEXT_TTL)
    }

    pub fn with_ttl(max_len: usize, enabled: bool, ttl: Duration) -> Self {
        Self {
            enabled,
            ttl,
            inner: RwLock::new(Inner {
                max_len,
                user: HashMap::new(),
                global: VecDeque::new(),
                last_activity: HashMap::new(),
            }),
        }
    }

    /// Append one turn to the identity's history and the global history,
    /// refresh the identity's activity stamp, then evict idle identities.
    pub fn append(&self, identity: &str, text: &str, is_bot: bool) {
        self.append_at(identity, text, is_bot, Instant::now());
    }

    fn append_at(&self, identity: &str, text: &str, is_bot: bool, now: Instant) {
        if !self.enabled {
            return;
        }

        let turn = if is_bot {
            format!("Assistant: {text}")
        } else {
            format!("{identity}: {text}")
        };

        let mut inner = self.inner.write();
        let max_len = inner.max_len;
        push_bounded(inner.user.entry(identity.to_string()).or_default(), turn.clone(), max_len);
        push_bounded(&mut inner.global, turn, max_len);
        inner.last_activity.insert(identity.to_string(), now);

        self.evict_idle(&mut inner, now);
    }

    /// Drop private histories whose identity has been idle past the TTL.
    /// Global copies of their turns are left in place.
    fn evict_idle(&self, inner: &mut Inner, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.ttl) else {
            return;
        };

        let stale: Vec<String> = inner
            .last_activity
            .iter()
            .filter(|(_, &stamp)| stamp < cutoff)
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in stale {
            debug!(%identity, "context TTL eviction");
            inner.user.remove(&identity);
            inner.last_activity.remove(&identity);
        }
    }

    /// Read the identity's history, optionally extended with global turns
    /// not already present verbatim, each part in chronological order.
    pub fn read(&self, identity: &str, include_global: bool) -> String {
        if !self.enabled {
            return String::new();
        }

        let inner = self.inner.read();
        let mut parts: Vec<&str> = inner
            .user
            .get(identity)
            .map(|turns| turns.iter().map(String::as_str).collect())
            .unwrap_or_default();

        if include_global {
            for turn in &inner.global {
                if !parts.contains(&turn.as_str()) {
                    parts.push(turn);
                }
            }
        }

        parts.join("\n")
    }

    /// Remove one identity's private history and activity stamp.
    pub fn clear(&self, identity: &str) {
        let mut inner = self.inner.write();
        inner.user.remove(identity);
        inner.last_activity.remove(identity);
    }

    /// Empty everything, global history included.
    pub fn clear_all(&self) {
        let mut inner = self.inner.write();
        inner.user.clear();
        inner.global.clear();
        inner.last_activity.clear();
    }

    /// Rebuild every bounded sequence to a new capacity, keeping only the
    /// most recent entries. Applying the same capacity twice is a no-op.
    pub fn resize(&self, new_max: usize) {
        let mut inner = self.inner.write();
        inner.max_len = new_max;

        for turns in inner.user.values_mut() {
            while turns.len() > new_max {
                turns.pop_front();
            }
        }
        while inner.global.len() > new_max {
            inner.global.pop_front();
        }
    }

    pub fn stats(&self) -> ContextStats {
        let inner = self.inner.read();
        ContextStats {
            total_users: inner.user.len(),
            global_len: inner.global.len(),
            max_len: inner.max_len,
            enabled: self.enabled,
        }
    }
}
