//! Call records and the call state machine.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SipProxyError};
use crate::message::{ResponseExt, SipRequest, SipResponse, Uri};

/// Where a call is in its life
///
/// ```text
/// Initiated -> Inviting -> Proceeding -> Accepted -> Terminated
///                  |            |
///                  +------------+--> Rejected | Timeout
/// any non-terminal state -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Record created, INVITE not sent yet
    Initiated,
    /// INVITE sent
    Inviting,
    /// 180/183 received
    Proceeding,
    /// 2xx received and ACKed
    Accepted,
    /// BYE sent or received after acceptance
    Terminated,
    /// Final non-2xx, or the INVITE could not be sent
    Rejected,
    /// No final response in time
    Timeout,
    /// Cancelled locally or by the server before acceptance
    Cancelled,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Rejected | Self::Timeout | Self::Cancelled)
    }

    /// Whether a final response is still expected
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Inviting | Self::Proceeding)
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Initiated, Inviting) => true,
            (Initiated, Rejected) => true,
            (Inviting, Proceeding) => true,
            (Inviting | Proceeding, Accepted | Rejected | Timeout) => true,
            (Accepted, Terminated) => true,
            (from, Cancelled) => !from.is_terminal() && from != Accepted,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initiated => "initiated",
            Self::Inviting => "inviting",
            Self::Proceeding => "proceeding",
            Self::Accepted => "accepted",
            Self::Terminated => "terminated",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// How a call attempt ended, as seen by whoever waits on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Accepted(SipResponse),
    Rejected(SipResponse),
    TimedOut { seconds: u64 },
    Cancelled,
}

impl CallOutcome {
    pub fn into_result(self, call_id: &str) -> Result<SipResponse> {
        match self {
            Self::Accepted(response) => Ok(response),
            Self::Rejected(response) => Err(SipProxyError::DialogRejected {
                code: response.status(),
                reason: response.reason(),
            }),
            Self::TimedOut { seconds } => Err(SipProxyError::DialogTimeout { seconds }),
            Self::Cancelled => Err(SipProxyError::Cancelled {
                call_id: call_id.to_string(),
            }),
        }
    }
}

/// Why an established or pending call went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// We sent BYE
    LocalBye,
    /// The server sent BYE
    RemoteBye,
    /// The server sent CANCEL
    RemoteCancel,
    /// Proxy shutdown
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::LocalBye => "local BYE",
            Self::RemoteBye => "remote BYE",
            Self::RemoteCancel => "remote CANCEL",
            Self::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// SIP dialog material kept after the INVITE goes out
#[derive(Debug, Clone)]
pub(crate) struct Dialog {
    pub invite: SipRequest,
    pub destination: SocketAddr,
    /// To header of the 2xx, with the remote tag
    pub remote_to: Option<String>,
    pub remote_target: Option<Uri>,
    /// A 2xx arrived after we gave up on the call and was closed with BYE
    pub late_bye_sent: bool,
}

/// One in-flight call, keyed by the WhatsApp call ID
#[derive(Debug)]
pub struct CallInfo {
    pub call_id: String,
    pub from: String,
    pub to: String,
    /// Our From tag, fixed for the life of the call
    pub sip_tag: String,
    pub state: CallState,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// WhatsApp-facing RTP port advertised in the offer
    pub rtp_port: u16,
    /// CANCEL asked for while the INVITE was still being written
    pub(crate) cancel_requested: bool,
    pub(crate) dialog: Option<Dialog>,
    pub(crate) cancel: CancellationToken,
    pub(crate) responses: mpsc::UnboundedSender<SipResponse>,
    pub(crate) outcome: watch::Sender<Option<CallOutcome>>,
}

impl CallInfo {
    pub(crate) fn new(
        call_id: &str,
        from: &str,
        to: &str,
        sip_tag: String,
        rtp_port: u16,
        responses: mpsc::UnboundedSender<SipResponse>,
    ) -> Self {
        let now = Utc::now();
        let (outcome, _) = watch::channel(None);
        Self {
            call_id: call_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            sip_tag,
            state: CallState::Initiated,
            start_time: now,
            last_update: now,
            rtp_port,
            cancel_requested: false,
            dialog: None,
            cancel: CancellationToken::new(),
            responses,
            outcome,
        }
    }

    /// Apply a transition if the state machine allows it
    pub(crate) fn transition(&mut self, next: CallState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.last_update = Utc::now();
        true
    }

    /// Jump to a terminal state from wherever the call is
    pub(crate) fn abort(&mut self, state: CallState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.last_update = Utc::now();
    }

    pub(crate) fn finish(&self, outcome: CallOutcome) {
        self.outcome.send_replace(Some(outcome));
    }

    pub(crate) fn same_parties(&self, from: &str, to: &str) -> bool {
        self.from == from && self.to == to
    }

    pub fn summary(&self) -> CallSummary {
        CallSummary {
            call_id: self.call_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            sip_tag: self.sip_tag.clone(),
            state: self.state,
            start_time: self.start_time,
            last_update: self.last_update,
            rtp_port: self.rtp_port,
        }
    }
}

/// Owned view of a [`CallInfo`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSummary {
    pub call_id: String,
    pub from: String,
    pub to: String,
    pub sip_tag: String,
    pub state: CallState,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub rtp_port: u16,
}
