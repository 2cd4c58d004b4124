//! Outbound call lifecycle.
//!
//! [`CallManager`] owns every active call. It sends the INVITE, runs one
//! dialog monitor task per call that consumes the responses routed to it,
//! and sends ACK, BYE or CANCEL as the call progresses. When a call ends
//! for any reason its RTP relay and port reservation are released.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quepasa_nat_core::NetworkManager;
use quepasa_rtp_proxy::RtpProxy;

use crate::builder::{
    InviteParams, build_ack, build_bye, build_cancel, build_invite, generate_branch, generate_tag, remote_target,
};
use crate::call::{CallInfo, CallOutcome, CallState, CallSummary, Dialog, TerminationReason};
use crate::config::Settings;
use crate::error::{Result, SipProxyError};
use crate::message::{DialogHeaders, Method, ResponseExt, SipMessage, SipRequest, SipResponse, body_text, synthetic_response};
use crate::response_handler::ResponseClass;
use crate::sdp::{SdpOffer, parse_answer};
use crate::transaction::TransactionMonitor;
use crate::transport::Transport;

/// Terminal states kept around for `call_state` after cleanup
const FINISHED_HISTORY: usize = 256;

/// A cleaned-up call, kept so late answers to its INVITE can be closed
#[derive(Debug)]
struct FinishedCall {
    call_id: String,
    state: CallState,
    dialog: Option<Dialog>,
}

pub struct CallManager {
    settings: Settings,
    network: Arc<NetworkManager>,
    rtp: Arc<RtpProxy>,
    monitor: Arc<TransactionMonitor>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    calls: Mutex<HashMap<String, CallInfo>>,
    finished: Mutex<VecDeque<FinishedCall>>,
}

impl CallManager {
    pub fn new(
        settings: Settings,
        network: Arc<NetworkManager>,
        rtp: Arc<RtpProxy>,
        monitor: Arc<TransactionMonitor>,
    ) -> Self {
        Self {
            settings,
            network,
            rtp,
            monitor,
            transport: RwLock::new(None),
            calls: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
        }
    }

    /// Socket used for outgoing INVITE, ACK, BYE and CANCEL
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }

    pub fn detach_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.write().take()
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .read()
            .clone()
            .ok_or_else(|| SipProxyError::transport_send("signaling transport is not started"))
    }

    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        self.transport()?.send_message(message, destination).await
    }

    /// `Ok(true)` when the same call is already in flight
    fn existing_call(&self, call_id: &str, from: &str, to: &str) -> Result<bool> {
        match self.calls.lock().get(call_id) {
            Some(call) if call.same_parties(from, to) => Ok(true),
            Some(call) => Err(SipProxyError::DuplicateCallId {
                call_id: call_id.to_string(),
                from: call.from.clone(),
                to: call.to.clone(),
            }),
            None => Ok(false),
        }
    }

    /// Send the INVITE for a WhatsApp call and start monitoring its dialog.
    ///
    /// Repeating a call already in flight with the same parties is a no-op.
    /// The outcome arrives later through the monitor's callbacks.
    pub async fn initiate_call(self: &Arc<Self>, call_id: &str, from: &str, to: &str) -> Result<()> {
        if self.existing_call(call_id, from, to)? {
            info!(call_id, "INVITE already sent, ignoring duplicate request");
            return Ok(());
        }

        let network = self.network.configure().await?;
        let transport = self.transport()?;
        let destination = self.network.sip_server_addr().await?;
        let rtp_port = self.rtp.reserve_port(call_id)?;

        let sip_tag = generate_tag();
        let branch = generate_branch();
        let sdp = SdpOffer::new(from, network.local_ip, network.public_ip, rtp_port)
            .with_session_name(self.settings.sdp_session_name.as_str())
            .render();
        let invite = build_invite(&InviteParams {
            call_id,
            from,
            to,
            local_ip: network.local_ip,
            public_ip: network.public_ip,
            local_port: network.local_port,
            sip_server: &network.sip_server,
            sip_port: network.sip_port,
            user_agent: &self.settings.user_agent,
            from_tag: &sip_tag,
            branch: &branch,
            sdp: &sdp,
        })?;

        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let cancel = {
            let mut calls = self.calls.lock();
            if let Some(existing) = calls.get(call_id) {
                // a concurrent request for the same Call-ID got here first
                if existing.same_parties(from, to) {
                    return Ok(());
                }
                return Err(SipProxyError::DuplicateCallId {
                    call_id: call_id.to_string(),
                    from: existing.from.clone(),
                    to: existing.to.clone(),
                });
            }
            let mut call = CallInfo::new(call_id, from, to, sip_tag, rtp_port, responses_tx);
            call.dialog = Some(Dialog {
                invite: invite.clone(),
                destination,
                remote_to: None,
                remote_target: None,
                late_bye_sent: false,
            });
            let cancel = call.cancel.clone();
            calls.insert(call_id.to_string(), call);
            cancel
        };
        self.monitor.monitor_transaction(call_id, &branch);

        info!(call_id, "Sending INVITE {} -> {} via {} (RTP port {})", from, to, destination, rtp_port);
        if let Err(e) = transport.send_message(&SipMessage::Request(invite), destination).await {
            error!(call_id, "Failed to send INVITE: {}", e);
            if let Some(call) = self.calls.lock().get_mut(call_id) {
                call.abort(CallState::Rejected);
                call.finish(CallOutcome::Rejected(synthetic_response(408, call_id)));
            }
            self.cleanup_call(call_id);
            return Err(e);
        }

        let cancel_requested = match self.calls.lock().get_mut(call_id) {
            Some(call) => {
                call.transition(CallState::Inviting);
                call.cancel_requested
            }
            None => false,
        };

        let manager = Arc::clone(self);
        let monitored = call_id.to_string();
        tokio::spawn(async move {
            manager.monitor_dialog(monitored, responses_rx, cancel).await;
        });

        if cancel_requested {
            info!(call_id, "Call was cancelled while the INVITE was being sent");
            return self.cancel_call(call_id).await;
        }
        Ok(())
    }

    async fn monitor_dialog(
        self: Arc<Self>,
        call_id: String,
        mut responses: mpsc::UnboundedReceiver<SipResponse>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.monitor.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            let done = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(call_id = %call_id, "Dialog monitor cancelled");
                    true
                }
                _ = ticker.tick() => {
                    if self.monitor.check_timeout(&call_id) {
                        self.handle_timeout(&call_id);
                        true
                    } else {
                        false
                    }
                }
                response = responses.recv() => match response {
                    Some(response) => self.handle_invite_response(&call_id, response).await,
                    None => true,
                },
            };
            if done {
                break;
            }
        }
        debug!(call_id = %call_id, "Dialog monitor stopped");
    }

    /// Returns true once the INVITE has its final answer
    async fn handle_invite_response(&self, call_id: &str, response: SipResponse) -> bool {
        let seen = self.monitor.record_response(call_id, &response);
        debug!(
            call_id,
            "INVITE response {} {} (#{})",
            response.status(),
            response.reason(),
            seen.map(|s| s.response_count).unwrap_or_default()
        );

        match ResponseClass::of(response.status()) {
            ResponseClass::Trying => false,
            ResponseClass::Provisional => {
                if let Some(call) = self.calls.lock().get_mut(call_id) {
                    if call.transition(CallState::Proceeding) {
                        info!(call_id, "Call proceeding: {} {}", response.status(), response.reason());
                    }
                }
                false
            }
            ResponseClass::Success => {
                self.handle_accepted(call_id, response).await;
                true
            }
            ResponseClass::Failure => {
                self.handle_rejected(call_id, response);
                true
            }
        }
    }

    async fn handle_accepted(&self, call_id: &str, response: SipResponse) {
        let (ack, destination, from, to, rtp_port) = {
            let mut calls = self.calls.lock();
            let Some(call) = calls.get_mut(call_id) else {
                return;
            };
            if !call.transition(CallState::Accepted) {
                debug!(call_id, "Ignoring 2xx in state {}", call.state);
                return;
            }
            let Some(dialog) = call.dialog.as_mut() else {
                return;
            };
            dialog.remote_to = response.to_value();
            dialog.remote_target = Some(remote_target(&dialog.invite, &response));
            let ack = build_ack(&dialog.invite, &response);
            (ack, dialog.destination, call.from.clone(), call.to.clone(), call.rtp_port)
        };

        if let Err(e) = self.send(&SipMessage::Request(ack), destination).await {
            error!(call_id, "Failed to send ACK: {}", e);
            let timeout = synthetic_response(408, call_id);
            if let Some(call) = self.calls.lock().get_mut(call_id) {
                call.abort(CallState::Rejected);
                call.finish(CallOutcome::Rejected(timeout.clone()));
            }
            self.monitor.notify_rejected(call_id, &from, &to, &timeout);
            self.cleanup_call(call_id);
            return;
        }

        self.monitor.notify_accepted(call_id, &from, &to, &response);
        if let Some(call) = self.calls.lock().get(call_id) {
            call.finish(CallOutcome::Accepted(response.clone()));
        }

        let Some(endpoint) = parse_answer(body_text(&response.body)) else {
            warn!(call_id, "2xx has no usable SDP answer, RTP relay not started");
            return;
        };
        match self
            .rtp
            .create_stream_with_local_port(call_id, rtp_port, &endpoint.host, endpoint.port)
            .await
        {
            Ok(stream) => {
                info!(
                    call_id,
                    "RTP relay up: WhatsApp port {}, SIP port {} -> {}:{}",
                    stream.whatsapp_port(),
                    stream.sip_port(),
                    endpoint.host,
                    endpoint.port
                );
                // the call may have ended while the relay was starting
                if !self.calls.lock().contains_key(call_id) {
                    self.rtp.stop_stream(call_id);
                }
            }
            Err(e) => error!(call_id, "Failed to start RTP relay: {}", e),
        }
    }

    fn handle_rejected(&self, call_id: &str, response: SipResponse) {
        let parties = {
            let mut calls = self.calls.lock();
            match calls.get_mut(call_id) {
                Some(call) if call.state.can_transition_to(CallState::Rejected) => {
                    call.transition(CallState::Rejected);
                    call.finish(CallOutcome::Rejected(response.clone()));
                    Some((call.from.clone(), call.to.clone()))
                }
                _ => None,
            }
        };
        if let Some((from, to)) = parties {
            self.monitor.notify_rejected(call_id, &from, &to, &response);
            self.cleanup_call(call_id);
        }
    }

    fn handle_timeout(&self, call_id: &str) {
        let seconds = self.monitor.timeout().as_secs();
        let parties = {
            let mut calls = self.calls.lock();
            match calls.get_mut(call_id) {
                Some(call) if call.state.can_transition_to(CallState::Timeout) => {
                    call.transition(CallState::Timeout);
                    call.finish(CallOutcome::TimedOut { seconds });
                    Some((call.from.clone(), call.to.clone()))
                }
                _ => None,
            }
        };
        if let Some((from, to)) = parties {
            warn!(call_id, "No final response to INVITE after {}s", seconds);
            let timeout = synthetic_response(408, call_id);
            self.monitor.notify_rejected(call_id, &from, &to, &timeout);
            self.cleanup_call(call_id);
        }
    }

    /// Hand a response to the call it belongs to.
    ///
    /// Returns false when neither an active nor a recently finished call has
    /// this Call-ID.
    pub async fn route_response(&self, call_id: &str, response: SipResponse) -> bool {
        if let Some((_, method)) = response.cseq() {
            if method != Method::Invite {
                debug!(call_id, "{} {} to {}", response.status(), response.reason(), method);
                return self.calls.lock().contains_key(call_id);
            }
        }

        let sender = self.calls.lock().get(call_id).map(|call| call.responses.clone());
        let Some(sender) = sender else {
            return self.handle_finished_response(call_id, response).await;
        };
        if let Err(mpsc::error::SendError(response)) = sender.send(response) {
            self.handle_late_response(call_id, response).await;
        }
        true
    }

    /// Response that arrived after the dialog monitor finished
    async fn handle_late_response(&self, call_id: &str, response: SipResponse) {
        if !response.is_success() {
            debug!(call_id, "Dropping late {} {}", response.status(), response.reason());
            return;
        }
        let requests = {
            let mut calls = self.calls.lock();
            calls.get_mut(call_id).and_then(|call| {
                let state = call.state;
                self.close_late_answer(state, call.dialog.as_mut()?, &response)
            })
        };
        self.send_late(call_id, requests).await;
    }

    /// Response for a call already cleaned up
    async fn handle_finished_response(&self, call_id: &str, response: SipResponse) -> bool {
        let requests = {
            let mut finished = self.finished.lock();
            let Some(entry) = finished.iter_mut().rev().find(|f| f.call_id == call_id) else {
                return false;
            };
            if !response.is_success() {
                debug!(call_id, "Dropping {} {} for finished call", response.status(), response.reason());
                return true;
            }
            let state = entry.state;
            entry
                .dialog
                .as_mut()
                .and_then(|dialog| self.close_late_answer(state, dialog, &response))
        };
        self.send_late(call_id, requests).await;
        true
    }

    /// ACK every 2xx; a 2xx for a call we already gave up on also gets one BYE
    fn close_late_answer(
        &self,
        state: CallState,
        dialog: &mut Dialog,
        response: &SipResponse,
    ) -> Option<(Vec<SipRequest>, SocketAddr)> {
        let ack = build_ack(&dialog.invite, response);
        match state {
            CallState::Accepted | CallState::Terminated => Some((vec![ack], dialog.destination)),
            CallState::Cancelled | CallState::Timeout | CallState::Rejected if !dialog.late_bye_sent => {
                dialog.late_bye_sent = true;
                let remote_to = response.to_value().unwrap_or_default();
                let target = remote_target(&dialog.invite, response);
                let bye = build_bye(&dialog.invite, &remote_to, target, &self.settings.user_agent);
                Some((vec![ack, bye], dialog.destination))
            }
            CallState::Cancelled | CallState::Timeout | CallState::Rejected => Some((vec![ack], dialog.destination)),
            CallState::Initiated | CallState::Inviting | CallState::Proceeding => None,
        }
    }

    async fn send_late(&self, call_id: &str, requests: Option<(Vec<SipRequest>, SocketAddr)>) {
        let Some((requests, destination)) = requests else {
            return;
        };
        for request in requests {
            debug!(call_id, "Sending {} for late 2xx", request.method);
            if let Err(e) = self.send(&SipMessage::Request(request), destination).await {
                warn!(call_id, "Failed to answer late 2xx: {}", e);
            }
        }
    }

    /// End a call from our side: BYE once accepted, CANCEL while pending.
    ///
    /// Unknown or already finished calls are a no-op. Cleanup happens even
    /// when the request cannot be sent; the send error is still returned.
    pub async fn cancel_call(&self, call_id: &str) -> Result<()> {
        let (request, accepted, from, to) = {
            let mut calls = self.calls.lock();
            let Some(call) = calls.get_mut(call_id) else {
                debug!(call_id, "Cancel for unknown call");
                return Ok(());
            };
            if call.state == CallState::Initiated {
                // the INVITE is being written; its sender issues the CANCEL
                debug!(call_id, "Cancel deferred until the INVITE is sent");
                call.cancel_requested = true;
                return Ok(());
            }
            call.cancel.cancel();

            let accepted = call.state == CallState::Accepted;
            let request = call.dialog.as_ref().and_then(|dialog| {
                let request = match call.state {
                    CallState::Accepted => self.bye_for(dialog),
                    CallState::Inviting | CallState::Proceeding => build_cancel(&dialog.invite, &self.settings.user_agent),
                    _ => return None,
                };
                Some((request, dialog.destination))
            });

            if accepted {
                call.transition(CallState::Terminated);
            } else {
                call.transition(CallState::Cancelled);
                call.finish(CallOutcome::Cancelled);
            }
            (request, accepted, call.from.clone(), call.to.clone())
        };

        let sent = match request {
            Some((request, destination)) => {
                info!(call_id, "Sending {} to {}", request.method, destination);
                self.send(&SipMessage::Request(request), destination).await
            }
            None => Ok(()),
        };
        if let Err(e) = &sent {
            warn!(call_id, "Failed to send call teardown: {}", e);
        }

        if accepted {
            self.monitor.notify_terminated(call_id, &from, &to, TerminationReason::LocalBye);
        }
        self.cleanup_call(call_id);
        sent
    }

    fn bye_for(&self, dialog: &Dialog) -> SipRequest {
        let remote_to = dialog
            .remote_to
            .clone()
            .or_else(|| dialog.invite.to_value())
            .unwrap_or_default();
        let target = dialog.remote_target.clone().unwrap_or_else(|| dialog.invite.uri.clone());
        build_bye(&dialog.invite, &remote_to, target, &self.settings.user_agent)
    }

    /// The server hung up
    pub fn on_remote_bye(&self, call_id: &str) -> bool {
        self.end_by_remote(call_id, TerminationReason::RemoteBye)
    }

    /// The server cancelled a call that has not been accepted
    pub fn on_remote_cancel(&self, call_id: &str) -> bool {
        self.end_by_remote(call_id, TerminationReason::RemoteCancel)
    }

    fn end_by_remote(&self, call_id: &str, reason: TerminationReason) -> bool {
        let parties = {
            let mut calls = self.calls.lock();
            let Some(call) = calls.get_mut(call_id) else {
                debug!(call_id, "{} for unknown call", reason);
                return false;
            };
            let accepted = call.state == CallState::Accepted;
            if accepted && reason == TerminationReason::RemoteCancel {
                debug!(call_id, "CANCEL after 2xx has no effect");
                return false;
            }
            call.cancel.cancel();
            if accepted {
                call.transition(CallState::Terminated);
            } else {
                call.abort(CallState::Cancelled);
                call.finish(CallOutcome::Cancelled);
            }
            (call.from.clone(), call.to.clone())
        };

        self.monitor.notify_terminated(call_id, &parties.0, &parties.1, reason);
        self.cleanup_call(call_id);
        true
    }

    /// Cancel every active call
    pub async fn cancel_all(&self) {
        for call_id in self.active_call_ids() {
            if let Err(e) = self.cancel_call(&call_id).await {
                debug!(call_id = %call_id, "Cancel during shutdown failed: {}", e);
            }
        }
    }

    /// Remove the call and release everything it holds. Idempotent.
    fn cleanup_call(&self, call_id: &str) -> Option<CallSummary> {
        let removed = self.calls.lock().remove(call_id);
        self.rtp.stop_stream(call_id);
        self.rtp.release_reservation(call_id);
        self.monitor.forget(call_id);

        let mut call = removed?;
        call.cancel.cancel();
        debug!(call_id, "Call cleaned up in state {}", call.state);
        let summary = call.summary();
        self.remember(FinishedCall {
            call_id: call_id.to_string(),
            state: call.state,
            dialog: call.dialog.take(),
        });
        Some(summary)
    }

    fn remember(&self, call: FinishedCall) {
        let mut finished = self.finished.lock();
        finished.retain(|f| f.call_id != call.call_id);
        finished.push_back(call);
        while finished.len() > FINISHED_HISTORY {
            finished.pop_front();
        }
    }

    /// State of an active call, or the final state of a recently finished one
    pub fn call_state(&self, call_id: &str) -> Option<CallState> {
        if let Some(call) = self.calls.lock().get(call_id) {
            return Some(call.state);
        }
        self.finished
            .lock()
            .iter()
            .rev()
            .find(|f| f.call_id == call_id)
            .map(|f| f.state)
    }

    pub fn call(&self, call_id: &str) -> Option<CallSummary> {
        self.calls.lock().get(call_id).map(CallInfo::summary)
    }

    /// Wait for the INVITE's outcome: the 2xx, or the reason there is none
    pub async fn wait_answer(&self, call_id: &str) -> Result<SipResponse> {
        let mut outcome = match self.calls.lock().get(call_id) {
            Some(call) => call.outcome.subscribe(),
            None => return Err(SipProxyError::call_not_found(call_id)),
        };
        loop {
            if let Some(result) = outcome.borrow_and_update().clone() {
                return result.into_result(call_id);
            }
            if outcome.changed().await.is_err() {
                let last = outcome.borrow().clone();
                return match last {
                    Some(result) => result.into_result(call_id),
                    None => Err(SipProxyError::Cancelled {
                        call_id: call_id.to_string(),
                    }),
                };
            }
        }
    }

    pub fn active_call_ids(&self) -> Vec<String> {
        self.calls.lock().keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn pending_transactions(&self) -> usize {
        self.monitor.pending_count()
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("active_calls", &self.active_count())
            .field("transport", &*self.transport.read())
            .finish()
    }
}
