//! INVITE transaction tracking and call event delivery.
//!
//! The [`TransactionMonitor`] knows when each outstanding INVITE was sent
//! and decides when it has waited long enough. It is also the single place
//! where call events reach the application, so that each call produces at
//! most one accepted-or-rejected notification no matter how many
//! retransmitted responses arrive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::call::TerminationReason;
use crate::message::{ResponseExt, SipResponse};

/// How often pending INVITEs are checked for expiry
pub const MONITOR_TICK: Duration = Duration::from_secs(1);

/// `(call_id, from, to, response)`
pub type CallResponseCallback = Arc<dyn Fn(&str, &str, &str, &SipResponse) + Send + Sync>;

/// `(call_id, from, to, reason)`
pub type CallTerminatedCallback = Arc<dyn Fn(&str, &str, &str, TerminationReason) + Send + Sync>;

/// An outstanding INVITE
#[derive(Debug, Clone)]
pub struct TransactionSession {
    pub call_id: String,
    /// Branch of the INVITE
    pub transaction_id: String,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
    pub response_count: u32,
    pub last_response: Option<u16>,
}

impl TransactionSession {
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[derive(Default, Clone)]
struct Callbacks {
    accepted: Option<CallResponseCallback>,
    rejected: Option<CallResponseCallback>,
    terminated: Option<CallTerminatedCallback>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Delivered {
    /// accepted or rejected went out
    final_outcome: bool,
    terminated: bool,
}

pub struct TransactionMonitor {
    timeout: Duration,
    tick: Duration,
    sessions: Mutex<HashMap<String, TransactionSession>>,
    callbacks: RwLock<Callbacks>,
    delivered: Mutex<HashMap<String, Delivered>>,
}

impl TransactionMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tick: MONITOR_TICK,
            sessions: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(Callbacks::default()),
            delivered: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    pub fn set_accepted_callback(&self, callback: CallResponseCallback) {
        self.callbacks.write().accepted = Some(callback);
    }

    pub fn set_rejected_callback(&self, callback: CallResponseCallback) {
        self.callbacks.write().rejected = Some(callback);
    }

    pub fn set_terminated_callback(&self, callback: CallTerminatedCallback) {
        self.callbacks.write().terminated = Some(callback);
    }

    /// Start tracking the INVITE sent for `call_id`
    pub fn monitor_transaction(&self, call_id: &str, transaction_id: &str) {
        let session = TransactionSession {
            call_id: call_id.to_string(),
            transaction_id: transaction_id.to_string(),
            start_time: Instant::now(),
            started_at: Utc::now(),
            response_count: 0,
            last_response: None,
        };
        debug!(call_id, transaction_id, "Monitoring INVITE transaction");
        self.sessions.lock().insert(call_id.to_string(), session);
    }

    /// Count a response. Final responses end the transaction.
    pub fn record_response(&self, call_id: &str, response: &SipResponse) -> Option<TransactionSession> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(call_id)?;
        session.response_count += 1;
        session.last_response = Some(response.status());
        let snapshot = session.clone();
        if response.is_final() {
            sessions.remove(call_id);
        }
        Some(snapshot)
    }

    /// True once the session has outlived the timeout; the session is dropped
    pub fn check_timeout(&self, call_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let expired = sessions
            .get(call_id)
            .map(|s| s.elapsed() >= self.timeout)
            .unwrap_or(false);
        if expired {
            sessions.remove(call_id);
        }
        expired
    }

    pub fn remove(&self, call_id: &str) -> Option<TransactionSession> {
        self.sessions.lock().remove(call_id)
    }

    pub fn session(&self, call_id: &str) -> Option<TransactionSession> {
        self.sessions.lock().get(call_id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Forget delivery bookkeeping for a call that has been cleaned up
    pub fn forget(&self, call_id: &str) {
        self.sessions.lock().remove(call_id);
        self.delivered.lock().remove(call_id);
    }

    /// Deliver "accepted" unless an outcome was already delivered
    pub fn notify_accepted(&self, call_id: &str, from: &str, to: &str, response: &SipResponse) -> bool {
        if !self.claim_final(call_id) {
            debug!(call_id, "Outcome already delivered, ignoring {}", response.status());
            return false;
        }
        info!(call_id, "Call accepted: {} {}", response.status(), response.reason());
        let callback = self.callbacks.read().accepted.clone();
        match callback {
            Some(callback) => callback(call_id, from, to, response),
            None => warn!(call_id, "No accepted callback registered"),
        }
        true
    }

    /// Deliver "rejected" unless an outcome was already delivered
    pub fn notify_rejected(&self, call_id: &str, from: &str, to: &str, response: &SipResponse) -> bool {
        if !self.claim_final(call_id) {
            debug!(call_id, "Outcome already delivered, ignoring {}", response.status());
            return false;
        }
        info!(call_id, "Call rejected: {} {}", response.status(), response.reason());
        let callback = self.callbacks.read().rejected.clone();
        match callback {
            Some(callback) => callback(call_id, from, to, response),
            None => warn!(call_id, "No rejected callback registered"),
        }
        true
    }

    pub fn notify_terminated(&self, call_id: &str, from: &str, to: &str, reason: TerminationReason) -> bool {
        {
            let mut delivered = self.delivered.lock();
            let entry = delivered.entry(call_id.to_string()).or_default();
            if entry.terminated {
                return false;
            }
            entry.terminated = true;
        }
        info!(call_id, "Call terminated: {}", reason);
        let callback = self.callbacks.read().terminated.clone();
        if let Some(callback) = callback {
            callback(call_id, from, to, reason);
        }
        true
    }

    fn claim_final(&self, call_id: &str) -> bool {
        let mut delivered = self.delivered.lock();
        let entry = delivered.entry(call_id.to_string()).or_default();
        !std::mem::replace(&mut entry.final_outcome, true)
    }
}

impl std::fmt::Debug for TransactionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMonitor")
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}
