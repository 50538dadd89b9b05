use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{LockClient, LockError, LockKind, LockToken};

struct Holder {
    owner: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Slot {
    holder: Option<Holder>,
    queue: VecDeque<String>,
}

impl Slot {
    fn expire_holder(&mut self, now: Instant) {
        let lapsed = self
            .holder
            .as_ref()
            .and_then(|holder| holder.expires_at)
            .map_or(false, |at| at <= now);
        if lapsed {
            self.holder = None;
        }
    }

    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.queue.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
    changed: Notify,
}

/// In-process lock client with the same semantics as the Redis backend:
/// owner tokens, leases on tokio's clock and a FIFO queue for fair waiters.
#[derive(Clone, Default)]
pub struct MemoryLockClient {
    inner: Arc<Inner>,
}

impl MemoryLockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` currently has a live holder.
    pub fn is_held(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut slots = self.slots();
        match slots.get_mut(key) {
            Some(slot) => {
                slot.expire_holder(now);
                slot.holder.is_some()
            }
            None => false,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take(slot: &mut Slot, token: &LockToken, lease: Option<Duration>, now: Instant) {
        slot.holder = Some(Holder {
            owner: token.owner().to_string(),
            expires_at: lease.map(|lease| now + lease),
        });
    }
}

/// Keeps a fair waiter's queue position and gives it up when the wait ends
/// without the lock, including when the waiting future is dropped.
struct QueuedWaiter<'a> {
    client: &'a MemoryLockClient,
    key: &'a str,
    owner: String,
    armed: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut slots = self.client.slots();
            if let Some(slot) = slots.get_mut(self.key) {
                slot.queue.retain(|owner| owner != &self.owner);
                if slot.is_idle() {
                    slots.remove(self.key);
                }
            }
        }
        self.client.inner.changed.notify_waiters();
    }
}

#[async_trait]
impl LockClient for MemoryLockClient {
    async fn try_acquire(
        &self,
        key: &str,
        lease: Option<Duration>,
    ) -> Result<Option<LockToken>, LockError> {
        let now = Instant::now();
        let mut slots = self.slots();
        let slot = slots.entry(key.to_string()).or_default();
        slot.expire_holder(now);
        if slot.holder.is_some() || !slot.queue.is_empty() {
            return Ok(None);
        }
        let token = LockToken::new(key);
        Self::take(slot, &token, lease, now);
        Ok(Some(token))
    }

    async fn acquire(
        &self,
        key: &str,
        kind: LockKind,
        wait: Duration,
        lease: Option<Duration>,
    ) -> Result<Option<LockToken>, LockError> {
        let token = LockToken::new(key);
        let deadline = Instant::now() + wait;

        let mut waiter = QueuedWaiter {
            client: self,
            key,
            owner: token.owner().to_string(),
            armed: false,
        };
        if kind == LockKind::Fair {
            self.slots()
                .entry(key.to_string())
                .or_default()
                .queue
                .push_back(waiter.owner.clone());
            waiter.armed = true;
        }

        loop {
            let notified = self.inner.changed.notified();
            let wake_at = {
                let now = Instant::now();
                let mut slots = self.slots();
                let slot = slots.entry(key.to_string()).or_default();
                slot.expire_holder(now);

                let admitted = slot.holder.is_none()
                    && match kind {
                        LockKind::Exclusive => true,
                        LockKind::Fair => slot.queue.front() == Some(&waiter.owner),
                    };
                if admitted {
                    if kind == LockKind::Fair {
                        slot.queue.pop_front();
                        waiter.armed = false;
                    }
                    Self::take(slot, &token, lease, now);
                    return Ok(Some(token));
                }
                if now >= deadline {
                    break;
                }
                slot.holder
                    .as_ref()
                    .and_then(|holder| holder.expires_at)
                    .map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }

        Ok(None)
    }

    async fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        let now = Instant::now();
        let released = {
            let mut slots = self.slots();
            match slots.get_mut(token.key()) {
                Some(slot) => {
                    slot.expire_holder(now);
                    let owned = slot
                        .holder
                        .as_ref()
                        .map_or(false, |holder| holder.owner == token.owner());
                    if owned {
                        slot.holder = None;
                        if slot.is_idle() {
                            slots.remove(token.key());
                        }
                    }
                    owned
                }
                None => false,
            }
        };
        if released {
            self.inner.changed.notify_waiters();
        }
        Ok(released)
    }

    async fn force_release(&self, key: &str) -> Result<bool, LockError> {
        let released = {
            let mut slots = self.slots();
            match slots.get_mut(key) {
                Some(slot) => {
                    let had_holder = slot.holder.take().is_some();
                    if slot.is_idle() {
                        slots.remove(key);
                    }
                    had_holder
                }
                None => false,
            }
        };
        self.inner.changed.notify_waiters();
        Ok(released)
    }
}
