//! Inbound SIP dispatch.
//!
//! Every datagram received on a signaling socket lands here. Responses are
//! routed to their call by Call-ID; BYE and CANCEL from the server are
//! answered and end the call. Anything else is logged and dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::builder::build_response;
use crate::call_manager::CallManager;
use crate::message::{DialogHeaders, Method, ResponseExt, SipMessage, SipRequest, SipResponse, parse};
use crate::transport::{Transport, TransportEvent};

/// Coarse status code classes the dialog monitor acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 100
    Trying,
    /// 101-199, including 180 Ringing and 183 Session Progress
    Provisional,
    /// 2xx
    Success,
    /// 300 and above
    Failure,
}

impl ResponseClass {
    pub fn of(status_code: u16) -> Self {
        match status_code {
            100 => Self::Trying,
            101..=199 => Self::Provisional,
            200..=299 => Self::Success,
            _ => Self::Failure,
        }
    }
}

pub struct ResponseHandler {
    calls: Arc<CallManager>,
    user_agent: String,
}

impl ResponseHandler {
    pub fn new(calls: Arc<CallManager>, user_agent: impl Into<String>) -> Self {
        Self {
            calls,
            user_agent: user_agent.into(),
        }
    }

    /// Parse and dispatch one datagram. Unparseable input is dropped.
    pub async fn handle_datagram(&self, transport: &dyn Transport, data: &[u8], source: SocketAddr) {
        match parse(data) {
            Ok(message) => self.handle_message(transport, message, source).await,
            Err(e) => debug!("Dropping {} byte datagram from {}: {}", data.len(), source, e),
        }
    }

    pub async fn handle_message(&self, transport: &dyn Transport, message: SipMessage, source: SocketAddr) {
        match message {
            SipMessage::Response(response) => self.handle_response(response, source).await,
            SipMessage::Request(request) => self.handle_request(transport, request, source).await,
        }
    }

    async fn handle_response(&self, response: SipResponse, source: SocketAddr) {
        let Some(call_id) = response.call_id() else {
            debug!("Response {} from {} without Call-ID", response.status(), source);
            return;
        };
        trace!(call_id = %call_id, "{} {} from {}", response.status(), response.reason(), source);
        if !self.calls.route_response(&call_id, response).await {
            debug!(call_id = %call_id, "Response for unknown call from {}", source);
        }
    }

    async fn handle_request(&self, transport: &dyn Transport, request: SipRequest, source: SocketAddr) {
        let call_id = request.call_id().unwrap_or_default();
        match request.method {
            Method::Bye => {
                info!(call_id = %call_id, "BYE from {}", source);
                self.reply(transport, &request, 200, source).await;
                self.calls.on_remote_bye(&call_id);
            }
            Method::Cancel => {
                info!(call_id = %call_id, "CANCEL from {}", source);
                self.reply(transport, &request, 200, source).await;
                self.calls.on_remote_cancel(&call_id);
            }
            Method::Ack => debug!(call_id = %call_id, "ACK from {}", source),
            other => debug!(call_id = %call_id, "Ignoring {} from {}", other, source),
        }
    }

    async fn reply(&self, transport: &dyn Transport, request: &SipRequest, code: u16, destination: SocketAddr) {
        let response = build_response(request, code, &self.user_agent);
        if let Err(e) = transport.send_message(&SipMessage::Response(response), destination).await {
            warn!("Failed to answer {} from {}: {}", request.method, destination, e);
        }
    }
}

impl std::fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandler").field("user_agent", &self.user_agent).finish()
    }
}

/// Feed a transport's events into `handler` until the transport closes
pub fn spawn_dispatcher(
    handler: Arc<ResponseHandler>,
    transport: Arc<dyn Transport>,
    mut events: mpsc::Receiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::DatagramReceived { data, source, .. } => {
                    handler.handle_datagram(transport.as_ref(), &data, source).await;
                }
                TransportEvent::Error { error } => debug!("Transport {:?} error: {}", transport, error),
                TransportEvent::Closed => break,
            }
        }
        debug!("Dispatcher for {:?} stopped", transport);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert_eq!(ResponseClass::of(100), ResponseClass::Trying);
        assert_eq!(ResponseClass::of(180), ResponseClass::Provisional);
        assert_eq!(ResponseClass::of(183), ResponseClass::Provisional);
        assert_eq!(ResponseClass::of(200), ResponseClass::Success);
        assert_eq!(ResponseClass::of(202), ResponseClass::Success);
        assert_eq!(ResponseClass::of(302), ResponseClass::Failure);
        assert_eq!(ResponseClass::of(486), ResponseClass::Failure);
        assert_eq!(ResponseClass::of(603), ResponseClass::Failure);
    }
}
