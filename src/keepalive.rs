//! Pending-operation keepalive tracker.
//!
//! Bridged crypto calls register their host operation here and get a VM
//! Promise back. The runner must not tear the VM down while anything is in
//! flight, so after the script body returns it calls [`await_quiescence`],
//! which keeps settling operations until the pending set has been observed
//! empty for `grace_rounds` consecutive polls. A single empty observation is
//! not enough: a settled operation may schedule a follow-up from a VM
//! microtask that only runs on the next drain.
//!
//! Once quiescent the session's key registry is disposed and the keepalive
//! token is released.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::error::Result;
use crate::key_registry::KeyRegistry;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_GRACE_ROUNDS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveSettings {
    pub poll_interval: Duration,
    pub grace_rounds: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_rounds: DEFAULT_GRACE_ROUNDS,
        }
    }
}

/// Lifecycle of the session's single keepalive token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// No operation has been tracked yet.
    Unregistered,
    Held,
    Released,
}

#[derive(Debug)]
pub struct KeepaliveTracker<T> {
    pending: VecDeque<(u64, T)>,
    next_id: u64,
    token: TokenState,
    registry: Rc<RefCell<KeyRegistry>>,
}

impl<T> KeepaliveTracker<T> {
    pub fn new(registry: Rc<RefCell<KeyRegistry>>) -> Self {
        Self {
            pending: VecDeque::new(),
            next_id: 0,
            token: TokenState::Unregistered,
            registry,
        }
    }

    /// Add an operation to the pending set. The first call registers the
    /// keepalive token.
    pub fn track(&mut self, op: T) -> u64 {
        if self.token == TokenState::Unregistered {
            self.token = TokenState::Held;
            tracing::trace!(event = "sandbox.keepalive.register", "Registered keepalive token");
        }
        self.next_id += 1;
        let op_id = self.next_id;
        self.pending.push_back((op_id, op));
        tracing::trace!(
            event = "sandbox.keepalive.track",
            op_id,
            pending = self.pending.len(),
            "Tracked pending operation"
        );
        op_id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub const fn token_state(&self) -> TokenState {
        self.token
    }

    pub fn registry(&self) -> &Rc<RefCell<KeyRegistry>> {
        &self.registry
    }

    /// Remove every pending operation in FIFO order.
    pub fn take_batch(&mut self) -> Vec<(u64, T)> {
        self.pending.drain(..).collect()
    }

    /// Drop every pending operation without settling it, then dispose the
    /// registry and release the token. Returns how many were dropped.
    pub fn abort(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            tracing::debug!(
                event = "sandbox.keepalive.abort",
                dropped,
                "Dropped pending operations"
            );
        }
        self.release();
        dropped
    }

    fn release(&mut self) {
        self.registry.borrow_mut().dispose();
        if self.token == TokenState::Held {
            tracing::trace!(event = "sandbox.keepalive.release", "Released keepalive token");
        }
        self.token = TokenState::Released;
    }
}

/// Drives the VM side while the tracker polls.
pub trait QuiescenceDriver<T> {
    /// Run one host operation and resolve or reject its VM Promise.
    fn settle(&mut self, op_id: u64, op: T) -> Result<()>;

    /// Run pending VM jobs (Promise reactions). Returns how many ran.
    fn drain_jobs(&mut self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuiescenceReport {
    pub rounds: u32,
    pub settled: u64,
}

/// Settle tracked operations until the pending set stays empty for
/// `grace_rounds` consecutive polls, then dispose the registry and release
/// the token. Cleanup also happens when the driver fails.
///
/// No borrow of `tracker` is held while the driver runs, so settling an
/// operation may track follow-ups.
pub fn await_quiescence<T, D>(
    tracker: &RefCell<KeepaliveTracker<T>>,
    driver: &mut D,
    settings: &KeepaliveSettings,
) -> Result<QuiescenceReport>
where
    D: QuiescenceDriver<T>,
{
    let outcome = poll_until_quiescent(tracker, driver, settings);
    tracker.borrow_mut().release();
    match &outcome {
        Ok(report) => tracing::debug!(
            event = "sandbox.keepalive.quiescent",
            rounds = report.rounds,
            settled = report.settled,
            "Pending operations drained"
        ),
        Err(err) => tracing::debug!(
            event = "sandbox.keepalive.aborted",
            error = %err,
            "Keepalive polling aborted"
        ),
    }
    outcome
}

fn poll_until_quiescent<T, D>(
    tracker: &RefCell<KeepaliveTracker<T>>,
    driver: &mut D,
    settings: &KeepaliveSettings,
) -> Result<QuiescenceReport>
where
    D: QuiescenceDriver<T>,
{
    let mut report = QuiescenceReport::default();
    driver.drain_jobs()?;
    if tracker.borrow().token_state() == TokenState::Unregistered {
        return Ok(report);
    }

    let mut empty_rounds = 0;
    while empty_rounds < settings.grace_rounds {
        report.rounds += 1;
        let registry = Rc::clone(tracker.borrow().registry());
        registry.borrow_mut().sweep_if_due();

        let batch = tracker.borrow_mut().take_batch();
        if batch.is_empty() {
            empty_rounds += 1;
        } else {
            empty_rounds = 0;
            for (op_id, op) in batch {
                driver.settle(op_id, op)?;
                report.settled += 1;
                driver.drain_jobs()?;
            }
        }

        if empty_rounds < settings.grace_rounds && !settings.poll_interval.is_zero() {
            std::thread::sleep(settings.poll_interval);
        }
        driver.drain_jobs()?;
    }
    Ok(report)
}
