//! Notification dispatch engine.
//!
//! The host service addresses completion callbacks by a single numeric
//! namespace, so one [`DispatchEngine`] instance demultiplexes every
//! asynchronous completion event to the operation waiting for it. Operations
//! register a waiter, receive a token, hand the token to the host adapter,
//! and then block on [`DispatchEngine::wait`] until the expected notification
//! kind arrives, a deadline elapses, or the waiter is torn down underneath
//! them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::trace;

/// Token addressing one registered waiter.
pub type Token = u64;

/// The completion event kinds the host can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Created,
    Started,
    Paused,
    Resumed,
    Exited,
    OperationInvoked,
}

const SYSTEM_KINDS: &[NotificationKind] = &[
    NotificationKind::Created,
    NotificationKind::Started,
    NotificationKind::Paused,
    NotificationKind::Resumed,
    NotificationKind::Exited,
    NotificationKind::OperationInvoked,
];

const PROCESS_KINDS: &[NotificationKind] = &[NotificationKind::Exited];

/// Completion status carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    Success,
    /// The system went down without a preceding shutdown or terminate request.
    UnexpectedExit,
    Failed(i32),
}

/// One asynchronous completion event from the host.
#[derive(Debug, Clone)]
pub struct Notification {
    pub status: NotifyStatus,
    pub data: Option<String>,
}

impl Notification {
    pub fn success() -> Self {
        Self {
            status: NotifyStatus::Success,
            data: None,
        }
    }

    pub fn unexpected_exit() -> Self {
        Self {
            status: NotifyStatus::UnexpectedExit,
            data: None,
        }
    }

    pub fn failed(code: i32) -> Self {
        Self {
            status: NotifyStatus::Failed(code),
            data: None,
        }
    }
}

/// Why a wait ended without its notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The waiter was unregistered while the wait was outstanding; the
    /// underlying handle is gone.
    #[error("the watched handle is gone")]
    Gone,
}

struct Waiter {
    system_id: String,
    process_id: Option<u32>,
    dispatching: AtomicUsize,
    senders: Mutex<Option<HashMap<NotificationKind, mpsc::Sender<Notification>>>>,
    receivers: HashMap<NotificationKind, tokio::sync::Mutex<mpsc::Receiver<Notification>>>,
}

impl Waiter {
    fn new(system_id: &str, process_id: Option<u32>, kinds: &[NotificationKind]) -> Self {
        let mut senders = HashMap::with_capacity(kinds.len());
        let mut receivers = HashMap::with_capacity(kinds.len());
        for &kind in kinds {
            // Capacity 1: a duplicate notification for the same kind is
            // dropped, not queued.
            let (tx, rx) = mpsc::channel(1);
            senders.insert(kind, tx);
            receivers.insert(kind, tokio::sync::Mutex::new(rx));
        }
        Self {
            system_id: system_id.to_string(),
            process_id,
            dispatching: AtomicUsize::new(0),
            senders: Mutex::new(Some(senders)),
            receivers,
        }
    }
}

struct Registry {
    next_token: Token,
    waiters: HashMap<Token, Arc<Waiter>>,
}

/// Process-wide demultiplexer for host completion notifications.
pub struct DispatchEngine {
    registry: Mutex<Registry>,
}

impl DispatchEngine {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_token: 1,
                waiters: HashMap::new(),
            }),
        }
    }

    /// Registers a waiter interested in every system-level notification kind.
    pub fn register_system(&self, system_id: &str) -> Token {
        self.register(Waiter::new(system_id, None, SYSTEM_KINDS))
    }

    /// Registers a waiter interested in process exit only.
    pub fn register_process(&self, system_id: &str, pid: u32) -> Token {
        self.register(Waiter::new(system_id, Some(pid), PROCESS_KINDS))
    }

    fn register(&self, waiter: Waiter) -> Token {
        let mut registry = self.registry.lock();
        let token = registry.next_token;
        registry.next_token += 1;
        registry.waiters.insert(token, Arc::new(waiter));
        token
    }

    /// Routes one notification to the waiter holding `token`.
    ///
    /// Never blocks. A notification for an unknown token, an uninteresting
    /// kind, or a kind whose single buffered slot is already full is dropped.
    pub fn dispatch(&self, token: Token, kind: NotificationKind, notification: Notification) {
        let waiter = {
            let registry = self.registry.lock();
            match registry.waiters.get(&token) {
                Some(waiter) => {
                    waiter.dispatching.fetch_add(1, Ordering::AcqRel);
                    Arc::clone(waiter)
                }
                None => {
                    trace!(token, ?kind, "dropping notification for unknown token");
                    return;
                }
            }
        };

        if let Some(senders) = waiter.senders.lock().as_ref() {
            if let Some(tx) = senders.get(&kind) {
                if tx.try_send(notification).is_err() {
                    trace!(
                        token,
                        ?kind,
                        system_id = %waiter.system_id,
                        process_id = ?waiter.process_id,
                        "dropping duplicate notification"
                    );
                }
            }
        }
        waiter.dispatching.fetch_sub(1, Ordering::AcqRel);
    }

    /// Blocks until a notification of `kind` arrives for `token`.
    ///
    /// With a deadline, yields [`WaitError::Timeout`] when it elapses.
    /// Returns [`WaitError::Gone`] when the waiter was unregistered, which
    /// callers treat as "the handle was invalidated" rather than a hang.
    pub async fn wait(
        &self,
        token: Token,
        kind: NotificationKind,
        timeout: Option<Duration>,
    ) -> Result<Notification, WaitError> {
        let waiter = {
            let registry = self.registry.lock();
            registry.waiters.get(&token).cloned()
        };
        let waiter = match waiter {
            Some(waiter) => waiter,
            None => return Err(WaitError::Gone),
        };
        let receiver = match waiter.receivers.get(&kind) {
            Some(receiver) => receiver,
            None => return Err(WaitError::Gone),
        };

        let mut rx = receiver.lock().await;
        let received = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx.recv()).await {
                Ok(received) => received,
                Err(_) => return Err(WaitError::Timeout(deadline)),
            },
            None => rx.recv().await,
        };
        received.ok_or(WaitError::Gone)
    }

    /// Removes the waiter for `token` and frees its channels.
    ///
    /// Any dispatch already in flight for the waiter is allowed to finish
    /// before the channels are closed, so `dispatch` never observes a freed
    /// channel map mid-send.
    pub async fn unregister(&self, token: Token) {
        let waiter = {
            let mut registry = self.registry.lock();
            registry.waiters.remove(&token)
        };
        let Some(waiter) = waiter else { return };
        while waiter.dispatching.load(Ordering::Acquire) > 0 {
            tokio::task::yield_now().await;
        }
        // Dropping the senders closes every channel, waking pending waits
        // with a Gone classification.
        waiter.senders.lock().take();
    }
}

impl Default for DispatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal outcome signal closed exactly once.
///
/// The compare-and-set on the inner `OnceLock` linearizes racing closers:
/// whichever wins publishes the outcome every waiter observes, and the loser
/// learns it lost from the `false` return.
pub(crate) struct WaitGate<T> {
    done: OnceLock<T>,
    notify: Notify,
}

impl<T> WaitGate<T> {
    pub fn new() -> Self {
        Self {
            done: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    /// Closes the gate with `value`. Returns `true` if this call won the
    /// race; a gate never closes twice.
    pub fn close(&self, value: T) -> bool {
        let won = self.done.set(value).is_ok();
        if won {
            self.notify.notify_waiters();
        }
        won
    }

    /// Non-blocking read of the terminal value.
    pub fn peek(&self) -> Option<&T> {
        self.done.get()
    }

    /// Suspends until the gate is closed, then returns the terminal value.
    pub async fn wait(&self) -> &T {
        loop {
            if let Some(value) = self.done.get() {
                return value;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.done.get() {
                return value;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_then_wait_delivers_notification() {
        let engine = DispatchEngine::new();
        let token = engine.register_system("vm");

        engine.dispatch(token, NotificationKind::Created, Notification::success());
        let notification = engine
            .wait(token, NotificationKind::Created, None)
            .await
            .unwrap();
        assert_eq!(notification.status, NotifyStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_notification() {
        let engine = DispatchEngine::new();
        let token = engine.register_system("vm");

        let err = engine
            .wait(
                token,
                NotificationKind::Started,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn notification_of_other_kind_does_not_wake_waiter() {
        let engine = DispatchEngine::new();
        let token = engine.register_system("vm");

        engine.dispatch(token, NotificationKind::Started, Notification::success());
        let err = engine
            .wait(
                token,
                NotificationKind::Created,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout(_)));
    }

    #[tokio::test]
    async fn late_and_duplicate_notifications_are_dropped() {
        let engine = DispatchEngine::new();
        // Unknown token: dropped, not an error.
        engine.dispatch(99, NotificationKind::Exited, Notification::success());

        let token = engine.register_system("vm");
        engine.dispatch(token, NotificationKind::Exited, Notification::success());
        engine.dispatch(token, NotificationKind::Exited, Notification::failed(-1));

        // Only the first buffered notification survives.
        let first = engine
            .wait(token, NotificationKind::Exited, None)
            .await
            .unwrap();
        assert_eq!(first.status, NotifyStatus::Success);
    }

    #[tokio::test]
    async fn unregister_wakes_pending_waiter_as_gone() {
        let engine = Arc::new(DispatchEngine::new());
        let token = engine.register_system("vm");

        let waiting = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.wait(token, NotificationKind::Exited, None).await })
        };
        tokio::task::yield_now().await;

        engine.unregister(token).await;
        assert_eq!(waiting.await.unwrap().unwrap_err(), WaitError::Gone);
    }

    #[tokio::test]
    async fn tokens_are_monotonic_and_independent() {
        let engine = DispatchEngine::new();
        let a = engine.register_system("vm-a");
        let b = engine.register_process("vm-a", 7);
        assert!(b > a);

        engine.dispatch(b, NotificationKind::Exited, Notification::success());
        // Waiter `a` saw nothing.
        let err = engine
            .wait(a, NotificationKind::Exited, Some(Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout(_)));
    }

    #[tokio::test]
    async fn wait_gate_closes_exactly_once() {
        let gate: Arc<WaitGate<i32>> = Arc::new(WaitGate::new());
        assert!(gate.peek().is_none());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move { *gate.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;

        assert!(gate.close(7));
        assert!(!gate.close(9));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 7);
        }
        assert_eq!(gate.peek(), Some(&7));
    }
}
