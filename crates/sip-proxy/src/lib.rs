//! SIP proxy core of the QuePasa WhatsApp gateway.
//!
//! Turns a WhatsApp voice call into an outbound SIP dialog and bridges the
//! audio between the two sides:
//!
//! - [`Manager`] is the entry point; `send_invite` places a call and the
//!   registered callbacks report its outcome
//! - [`call_manager`] runs the client side of each dialog (INVITE, ACK,
//!   BYE, CANCEL)
//! - [`transaction`] watches outstanding INVITEs and delivers call events
//!   exactly once
//! - [`response_handler`] and [`listener`] take inbound SIP traffic
//! - the network bootstrap lives in `quepasa-nat-core`, the RTP relay in
//!   `quepasa-rtp-proxy`
//!
//! # Example
//!
//! ```rust,no_run
//! use quepasa_sip_proxy::{Manager, ResponseExt, Settings};
//!
//! # async fn run() -> quepasa_sip_proxy::Result<()> {
//! let manager = Manager::new(Settings::new("voip.example.com", 26499))?;
//! manager.set_call_accepted_callback(|call_id, _from, _to, response| {
//!     println!("{} answered with {}", call_id, response.status());
//! });
//! manager.set_call_rejected_callback(|call_id, _from, _to, response| {
//!     println!("{} failed: {} {}", call_id, response.status(), response.reason());
//! });
//!
//! manager.send_invite("CID-A", "5511999990000", "5511888880000").await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod call;
pub mod call_manager;
pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod manager;
pub mod message;
pub mod response_handler;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use call::{CallInfo, CallOutcome, CallState, CallSummary, TerminationReason};
pub use call_manager::CallManager;
pub use call_test::{CallAcceptTestManager, CallTestResult};
pub use config::{SIP_INVITE_MAX_ATTEMPTS, Settings, SipTransportProtocol};
pub use error::{Result, SipProxyError};
pub use listener::{ListenerConfig, SipListener};
pub use logging::{LoggingConfig, setup_logging};
pub use manager::{CallRecord, Manager, NetworkInfo, ProxyStats};
pub use message::{DialogHeaders, Method, ResponseExt, SipMessage, SipRequest, SipResponse};
pub use response_handler::{ResponseClass, ResponseHandler};
pub use transaction::{TransactionMonitor, TransactionSession};
pub use transport::{Transport, TransportEvent, UdpTransport};

pub use quepasa_nat_core::{NetworkConfig, NetworkManager, UpnpManager};
pub use quepasa_rtp_proxy::{RtpProxy, RtpStream, StreamStats};

/// Re-export of common types
pub mod prelude {
    pub use super::{
        CallRecord, CallState, Manager, Result, Settings, SipProxyError, SipResponse, TerminationReason,
    };
}
