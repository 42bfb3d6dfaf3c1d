//! Bridges inbound SMS-verification webhooks to the worker awaiting them.
//!
//! A worker that requests a phone number registers a pending wait keyed by
//! the provider's activation id and suspends on a oneshot channel. The
//! webhook handler resolves that wait; each event is delivered to exactly
//! one waiter. Events that arrive before the wait is registered (or after it
//! timed out) are buffered for a configurable grace window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::EngineError;

/// A verification event pushed by the SMS provider.
///
/// Field aliases match the provider's webhook payload (`id`, `phone`, `sms`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsEvent {
    #[serde(alias = "id")]
    pub activation_id: String,
    #[serde(default, alias = "phone")]
    pub phone_number: Option<String>,
    #[serde(alias = "sms")]
    pub code: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl SmsEvent {
    pub fn new(activation_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            activation_id: activation_id.into(),
            phone_number: None,
            code: code.into(),
            status: None,
        }
    }
}

/// No code arrived within the wait deadline.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("timed out waiting for a verification code")]
pub struct SmsWaitTimeout;

enum Slot {
    /// A worker is suspended on this activation id. The generation tag
    /// distinguishes this wait from any later one on the same id.
    Waiting {
        tx: oneshot::Sender<SmsEvent>,
        deadline: Instant,
        generation: u64,
    },
    /// The webhook arrived first; held until a waiter shows up or the
    /// grace window closes.
    Buffered { event: SmsEvent, expires_at: Instant },
    /// Consumed or expired. Kept briefly so a duplicate resolve is
    /// answered with `ActivationNotFound` instead of re-buffering.
    Spent { expires_at: Instant },
}

/// The SMS correlation store. One slot per activation id; every
/// read-modify-write for an id happens under the store lock.
pub struct SmsCorrelator {
    slots: Mutex<HashMap<String, Slot>>,
    grace: Duration,
    // Generation 0 is never issued.
    generations: AtomicU64,
}

impl SmsCorrelator {
    pub fn new(grace: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            grace,
            generations: AtomicU64::new(1),
        }
    }

    /// Registers a pending wait and suspends until the webhook resolves it
    /// or `timeout` elapses. A code buffered within the grace window is
    /// returned immediately.
    pub async fn await_code(
        &self,
        activation_id: &str,
        timeout: Duration,
    ) -> Result<SmsEvent, SmsWaitTimeout> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mut rx = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Self::sweep(&mut slots, self.grace);
            let now = Instant::now();

            match slots.remove(activation_id) {
                Some(Slot::Buffered { event, .. }) => {
                    debug!(activation_id, "delivering buffered verification code");
                    slots.insert(
                        activation_id.to_string(),
                        Slot::Spent {
                            expires_at: now + self.grace,
                        },
                    );
                    return Ok(event);
                }
                Some(Slot::Waiting { .. }) => {
                    // Single waiter per activation id; the newer wait wins and
                    // the displaced sender is dropped.
                    warn!(activation_id, "replacing an existing pending wait");
                }
                _ => {}
            }

            let (tx, rx) = oneshot::channel();
            slots.insert(
                activation_id.to_string(),
                Slot::Waiting {
                    tx,
                    deadline: now + timeout,
                    generation,
                },
            );
            rx
        };

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        tokio::select! {
            res = &mut rx => res.map_err(|_| SmsWaitTimeout),
            _ = &mut sleep => {
                self.remove_wait_if_current(activation_id, generation);
                // The resolver may have won the race right at the deadline.
                rx.try_recv().map_err(|_| SmsWaitTimeout)
            }
        }
    }

    /// Delivers a webhook event. Wakes the registered waiter if there is
    /// one; otherwise buffers the event for the grace window. An id that was
    /// already consumed (or whose buffer expired) is reported as not found.
    pub fn resolve(&self, event: SmsEvent) -> Result<(), EngineError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Self::sweep(&mut slots, self.grace);
        let now = Instant::now();
        let activation_id = event.activation_id.clone();

        match slots.remove(&activation_id) {
            Some(Slot::Waiting { tx, .. }) => match tx.send(event) {
                Ok(()) => {
                    slots.insert(
                        activation_id,
                        Slot::Spent {
                            expires_at: now + self.grace,
                        },
                    );
                    Ok(())
                }
                // The waiter gave up between registering and now; keep the
                // event around for a late retry.
                Err(event) => {
                    slots.insert(
                        activation_id,
                        Slot::Buffered {
                            event,
                            expires_at: now + self.grace,
                        },
                    );
                    Ok(())
                }
            },
            Some(Slot::Buffered { .. }) | None => {
                slots.insert(
                    activation_id,
                    Slot::Buffered {
                        event,
                        expires_at: now + self.grace,
                    },
                );
                Ok(())
            }
            Some(spent @ Slot::Spent { .. }) => {
                slots.insert(activation_id.clone(), spent);
                Err(EngineError::ActivationNotFound(activation_id))
            }
        }
    }

    /// Removes the wait for `activation_id` only if it still belongs to the
    /// caller's generation. A newer wait registered under the same id after
    /// this caller's deadline fired is left alone.
    fn remove_wait_if_current(&self, activation_id: &str, generation: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(
            slots.get(activation_id),
            Some(Slot::Waiting { generation: current, .. }) if *current == generation
        ) {
            slots.remove(activation_id);
        }
    }

    /// Number of workers currently suspended on a verification wait.
    pub fn pending_waits(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Waiting { .. }))
            .count()
    }

    /// Drops expired entries: stale waits wake their waiter with a timeout,
    /// expired buffers become tombstones, expired tombstones disappear.
    fn sweep(slots: &mut HashMap<String, Slot>, grace: Duration) {
        let now = Instant::now();
        let mut expired_buffers = Vec::new();
        slots.retain(|id, slot| match slot {
            Slot::Waiting { deadline, .. } => *deadline > now,
            Slot::Buffered { expires_at, .. } => {
                if *expires_at <= now {
                    expired_buffers.push(id.clone());
                    false
                } else {
                    true
                }
            }
            Slot::Spent { expires_at } => *expires_at > now,
        });
        for id in expired_buffers {
            slots.insert(
                id,
                Slot::Spent {
                    expires_at: now + grace,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const GRACE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn wait_then_resolve() {
        let store = Arc::new(SmsCorrelator::new(GRACE));
        let resolver = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            resolver
                .resolve(SmsEvent::new("act-1", "123456"))
                .unwrap();
        });

        let event = store
            .await_code("act-1", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(event.code, "123456");
        assert_eq!(store.pending_waits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_before_wait_is_buffered() {
        let store = SmsCorrelator::new(GRACE);
        store.resolve(SmsEvent::new("act-2", "654321")).unwrap();

        let event = store
            .await_code("act-2", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(event.code, "654321");
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_event_expires_after_grace() {
        let store = SmsCorrelator::new(Duration::from_secs(5));
        store.resolve(SmsEvent::new("act-3", "111111")).unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let outcome = store.await_code("act-3", Duration::from_millis(100)).await;
        assert_eq!(outcome, Err(SmsWaitTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn event_is_delivered_exactly_once() {
        let store = Arc::new(SmsCorrelator::new(GRACE));
        let resolver = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver.resolve(SmsEvent::new("act-4", "222222")).unwrap();
        });

        store
            .await_code("act-4", Duration::from_secs(5))
            .await
            .unwrap();

        // A duplicate webhook for a consumed activation is rejected.
        let err = store.resolve(SmsEvent::new("act-4", "222222")).unwrap_err();
        assert!(matches!(err, EngineError::ActivationNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_after_buffer_expiry_is_not_found() {
        let store = SmsCorrelator::new(Duration::from_secs(5));
        store.resolve(SmsEvent::new("act-5", "333333")).unwrap();

        // Expire the buffer, then touch the store so the sweep runs.
        tokio::time::sleep(Duration::from_secs(6)).await;
        let err = store.resolve(SmsEvent::new("act-5", "333333")).unwrap_err();
        assert!(matches!(err, EngineError::ActivationNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn webhook_after_wait_timeout_serves_a_retry() {
        let store = SmsCorrelator::new(GRACE);

        let outcome = store.await_code("act-6", Duration::from_millis(50)).await;
        assert_eq!(outcome, Err(SmsWaitTimeout));

        // The late webhook is buffered, so a retried wait still succeeds.
        store.resolve(SmsEvent::new("act-6", "444444")).unwrap();
        let event = store
            .await_code("act-6", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(event.code, "444444");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_deadline_cleanup_spares_a_newer_wait() {
        let store = Arc::new(SmsCorrelator::new(GRACE));
        let waiter = Arc::clone(&store);
        let handle = tokio::spawn(async move {
            waiter.await_code("act-8", Duration::from_secs(10)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.pending_waits(), 1);

        // A cleanup carrying a generation that was never issued (an earlier
        // wait whose deadline fired late) must not evict the live wait.
        store.remove_wait_if_current("act-8", 0);
        assert_eq!(store.pending_waits(), 1);

        store.resolve(SmsEvent::new("act-8", "777777")).unwrap();
        let event = handle.await.unwrap().unwrap();
        assert_eq!(event.code, "777777");
    }

    #[test]
    fn webhook_payload_aliases() {
        let event: SmsEvent = serde_json::from_str(
            r#"{"id": "987", "phone": "+5511999990000", "sms": "55443", "status": "ok"}"#,
        )
        .unwrap();
        assert_eq!(event.activation_id, "987");
        assert_eq!(event.code, "55443");
        assert_eq!(event.phone_number.as_deref(), Some("+5511999990000"));
    }
}
