//! The proxy façade.
//!
//! [`Manager`] wires the components together and is the only type the
//! WhatsApp side talks to:
//!
//! ```text
//! send_invite ──► CallManager ──► NetworkManager (first call only)
//!                     │
//!                     ├─► INVITE over the signaling socket
//!                     └─► TransactionMonitor ──► callbacks
//!                                                   │
//! signaling socket / SipListener ──► ResponseHandler ┘
//! ```
//!
//! Application callbacks are registered on the manager and survive
//! restarts. The manager also keeps a record per call, an attempt counter
//! and a history of call acceptance tests.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use quepasa_nat_core::{MappingProtocol, NetworkManager, UpnpManager};
use quepasa_rtp_proxy::{ForwarderConfig, RtpProxy, RtpProxyConfig};

use crate::call::{CallState, TerminationReason};
use crate::call_manager::CallManager;
use crate::call_test::CallAcceptTestManager;
use crate::config::{SIP_INVITE_MAX_ATTEMPTS, Settings};
use crate::error::{Result, SipProxyError};
use crate::listener::SipListener;
use crate::message::{ResponseExt, SipResponse};
use crate::response_handler::{ResponseHandler, spawn_dispatcher};
use crate::transaction::{CallResponseCallback, CallTerminatedCallback, TransactionMonitor};
use crate::transport::{Transport, UdpTransport};

/// What the manager knows about one call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub from: String,
    pub to: String,
    pub started_at: DateTime<Utc>,
    pub status: CallState,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Resolved addressing, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub local_ip: Ipv4Addr,
    pub public_ip: Ipv4Addr,
    pub local_port: u16,
    pub listener_port: Option<u16>,
    pub sip_server: String,
    pub sip_port: u16,
    pub upnp_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStats {
    pub running: bool,
    pub active_calls: usize,
    pub total_attempts: u64,
    pub active_streams: usize,
    pub pending_transactions: usize,
}

#[derive(Debug, Default)]
struct CallRegistry {
    active: HashMap<String, CallRecord>,
    attempts: HashMap<String, u32>,
}

impl CallRegistry {
    fn set_status(&mut self, call_id: &str, status: CallState) {
        if let Some(record) = self.active.get_mut(call_id) {
            record.status = status;
        }
    }

    fn end(&mut self, call_id: &str, status: CallState) -> Option<CallRecord> {
        let mut record = self.active.remove(call_id)?;
        record.status = status;
        record.ended_at = Some(Utc::now());
        Some(record)
    }
}

#[derive(Default)]
struct Subscribers {
    accepted: RwLock<Option<CallResponseCallback>>,
    rejected: RwLock<Option<CallResponseCallback>>,
    terminated: RwLock<Option<CallTerminatedCallback>>,
}

struct Running {
    transport: Arc<UdpTransport>,
    dispatcher: JoinHandle<()>,
    upnp: Option<JoinHandle<()>>,
}

pub struct Manager {
    settings: Settings,
    network: Arc<NetworkManager>,
    upnp: Arc<UpnpManager>,
    rtp: Arc<RtpProxy>,
    monitor: Arc<TransactionMonitor>,
    calls: Arc<CallManager>,
    responses: Arc<ResponseHandler>,
    listener: SipListener,
    running: Mutex<Option<Running>>,
    registry: Arc<RwLock<CallRegistry>>,
    tests: Arc<CallAcceptTestManager>,
    subscribers: Arc<Subscribers>,
}

impl Manager {
    /// Build every component from `settings`. Nothing is bound until
    /// [`start`](Self::start) or the first [`send_invite`](Self::send_invite).
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_upnp(settings, UpnpManager::new())
    }

    /// Same as [`new`](Self::new) with a caller supplied UPnP manager
    pub fn with_upnp(settings: Settings, upnp: UpnpManager) -> Result<Self> {
        settings.validate()?;

        let network = Arc::new(NetworkManager::new(settings.network_settings()));
        let rtp = Arc::new(RtpProxy::new(RtpProxyConfig {
            ports: settings.port_allocator()?,
            forwarder: ForwarderConfig::default(),
        }));
        let monitor = Arc::new(TransactionMonitor::new(settings.invite_timeout()));
        let calls = Arc::new(CallManager::new(
            settings.clone(),
            network.clone(),
            rtp.clone(),
            monitor.clone(),
        ));
        let responses = Arc::new(ResponseHandler::new(calls.clone(), settings.user_agent.clone()));

        let manager = Self {
            settings,
            network,
            upnp: Arc::new(upnp),
            rtp,
            monitor,
            calls,
            responses,
            listener: SipListener::default(),
            running: Mutex::new(None),
            registry: Arc::new(RwLock::new(CallRegistry::default())),
            tests: Arc::new(CallAcceptTestManager::default()),
            subscribers: Arc::new(Subscribers::default()),
        };
        manager.install_callbacks();
        Ok(manager)
    }

    /// Route monitor events through the call registry before the application sees them
    fn install_callbacks(&self) {
        let registry = self.registry.clone();
        let tests = self.tests.clone();
        let subscribers = self.subscribers.clone();
        self.monitor.set_accepted_callback(Arc::new(move |call_id: &str, from: &str, to: &str, response: &SipResponse| {
            registry.write().set_status(call_id, CallState::Accepted);
            tests.complete_call(call_id, true, None, Some(response.status()));
            let callback = subscribers.accepted.read().clone();
            if let Some(callback) = callback {
                callback(call_id, from, to, response);
            }
        }));

        let registry = self.registry.clone();
        let tests = self.tests.clone();
        let subscribers = self.subscribers.clone();
        self.monitor.set_rejected_callback(Arc::new(move |call_id: &str, from: &str, to: &str, response: &SipResponse| {
            let status = if response.status() == 408 { CallState::Timeout } else { CallState::Rejected };
            registry.write().end(call_id, status);
            tests.complete_call(
                call_id,
                false,
                Some(format!("{} {}", response.status(), response.reason())),
                Some(response.status()),
            );
            let callback = subscribers.rejected.read().clone();
            if let Some(callback) = callback {
                callback(call_id, from, to, response);
            }
        }));

        let registry = self.registry.clone();
        let tests = self.tests.clone();
        let subscribers = self.subscribers.clone();
        self.monitor.set_terminated_callback(Arc::new(move |call_id: &str, from: &str, to: &str, reason: TerminationReason| {
            let status = match reason {
                TerminationReason::RemoteCancel => CallState::Cancelled,
                _ => CallState::Terminated,
            };
            registry.write().end(call_id, status);
            tests.complete_call(call_id, false, Some(reason.to_string()), None);
            let callback = subscribers.terminated.read().clone();
            if let Some(callback) = callback {
                callback(call_id, from, to, reason);
            }
        }));
    }

    pub fn set_call_accepted_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &str, &str, &SipResponse) + Send + Sync + 'static,
    {
        *self.subscribers.accepted.write() = Some(Arc::new(callback));
    }

    pub fn set_call_rejected_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &str, &str, &SipResponse) + Send + Sync + 'static,
    {
        *self.subscribers.rejected.write() = Some(Arc::new(callback));
    }

    pub fn set_call_terminated_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &str, &str, TerminationReason) + Send + Sync + 'static,
    {
        *self.subscribers.terminated.write() = Some(Arc::new(callback));
    }

    /// Discover addresses, open the signaling socket and the listener.
    /// Calling it on a running proxy does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let network = self.network.configure().await?;
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), network.local_port);
        let (transport, events) = UdpTransport::bind(bind, None).await.map_err(|e| {
            SipProxyError::Network(quepasa_nat_core::Error::network_config(format!(
                "cannot bind signaling socket {}: {}",
                bind, e
            )))
        })?;
        let transport = Arc::new(transport);
        let dispatcher = spawn_dispatcher(self.responses.clone(), transport.clone() as Arc<dyn Transport>, events);

        let listener_port = match self.listener.start(self.responses.clone()) {
            Ok(port) => port,
            Err(e) => {
                let _ = transport.close().await;
                dispatcher.abort();
                return Err(e);
            }
        };
        self.calls.attach_transport(transport.clone());

        let upnp = self
            .settings
            .use_upnp
            .then(|| self.spawn_upnp(network.local_port, network.local_ip));

        info!(
            "SIP proxy started: {}:{} (public {}) -> {}, listener port {}",
            network.local_ip,
            network.local_port,
            network.public_ip,
            network.sip_target(),
            listener_port
        );
        *running = Some(Running {
            transport,
            dispatcher,
            upnp,
        });
        Ok(())
    }

    fn spawn_upnp(&self, port: u16, local_ip: Ipv4Addr) -> JoinHandle<()> {
        let upnp = self.upnp.clone();
        tokio::spawn(async move {
            if let Err(e) = upnp.setup().await {
                info!("Continuing without UPnP: {}", e);
                return;
            }
            match upnp.open_port(port, MappingProtocol::Udp, local_ip).await {
                Ok(()) => info!("UPnP mapping added for UDP port {}", port),
                Err(e) => warn!("UPnP mapping for UDP port {} failed: {}", port, e),
            }
        })
    }

    /// Cancel every call, then release sockets and port mappings.
    /// Calling it on a stopped proxy does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return Ok(());
        };

        self.calls.cancel_all().await;
        self.rtp.stop_all();
        {
            let mut registry = self.registry.write();
            let call_ids: Vec<String> = registry.active.keys().cloned().collect();
            for call_id in call_ids {
                registry.end(&call_id, CallState::Cancelled);
                self.tests.complete_call(&call_id, false, Some("proxy stopped".to_string()), None);
            }
        }

        self.listener.stop().await;
        if let Some(task) = current.upnp {
            task.abort();
        }
        self.upnp.close_all().await;

        self.calls.detach_transport();
        current.transport.close().await?;
        current.dispatcher.abort();
        info!("SIP proxy stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Place a SIP call for a WhatsApp call. Starts the proxy if needed.
    ///
    /// Errors cover only what prevents the INVITE from leaving; the answer
    /// arrives through the accepted or rejected callback. A Call-ID gets at
    /// most [`SIP_INVITE_MAX_ATTEMPTS`] INVITEs, repeats while the call is
    /// still active are absorbed.
    pub async fn send_invite(&self, call_id: &str, from: &str, to: &str) -> Result<()> {
        self.start().await?;

        let is_new = {
            let mut registry = self.registry.write();
            if registry.active.contains_key(call_id) {
                false
            } else {
                let attempts = registry.attempts.entry(call_id.to_string()).or_insert(0);
                if *attempts >= SIP_INVITE_MAX_ATTEMPTS {
                    let attempts = *attempts;
                    warn!(call_id, "Refusing INVITE: {} of {} attempts used", attempts, SIP_INVITE_MAX_ATTEMPTS);
                    return Err(SipProxyError::AttemptsExhausted {
                        call_id: call_id.to_string(),
                        attempts,
                    });
                }
                *attempts += 1;
                registry.active.insert(
                    call_id.to_string(),
                    CallRecord {
                        call_id: call_id.to_string(),
                        from: from.to_string(),
                        to: to.to_string(),
                        started_at: Utc::now(),
                        status: CallState::Initiated,
                        ended_at: None,
                    },
                );
                true
            }
        };
        if is_new {
            self.tests.start_test(call_id);
        }

        match self.calls.initiate_call(call_id, from, to).await {
            Ok(()) => {
                let mut registry = self.registry.write();
                if let Some(record) = registry.active.get_mut(call_id) {
                    if record.status == CallState::Initiated {
                        record.status = CallState::Inviting;
                    }
                }
                Ok(())
            }
            Err(e) => {
                if is_new {
                    // the INVITE never reached the wire, so it does not use up an attempt
                    let mut registry = self.registry.write();
                    registry.active.remove(call_id);
                    if let Some(attempts) = registry.attempts.get_mut(call_id) {
                        *attempts = attempts.saturating_sub(1);
                    }
                    drop(registry);
                    self.tests.complete_call(call_id, false, Some(e.to_string()), e.status_code());
                }
                Err(e)
            }
        }
    }

    /// Answer an incoming WhatsApp call by dialing `receiver` on the SIP side
    pub async fn answer_call(&self, call_id: &str, from: &str, receiver: &str) -> Result<()> {
        self.send_invite(call_id, from, receiver).await
    }

    /// Hang up or cancel a call. Unknown calls are a no-op.
    pub async fn cancel_call(&self, call_id: &str) -> Result<()> {
        let result = self.calls.cancel_call(call_id).await;
        let ended = self.registry.write().end(call_id, CallState::Cancelled);
        if ended.is_some() {
            self.tests.complete_call(call_id, false, Some("cancelled".to_string()), None);
        }
        result
    }

    /// Wait for the 2xx of a call in flight
    pub async fn wait_answer(&self, call_id: &str) -> Result<SipResponse> {
        self.calls.wait_answer(call_id).await
    }

    pub fn call_state(&self, call_id: &str) -> Option<CallState> {
        self.calls.call_state(call_id)
    }

    pub fn call_record(&self, call_id: &str) -> Option<CallRecord> {
        self.registry.read().active.get(call_id).cloned()
    }

    /// Forget a call record and its attempt counter
    pub fn remove_call(&self, call_id: &str) -> Option<CallRecord> {
        let mut registry = self.registry.write();
        registry.attempts.remove(call_id);
        registry.active.remove(call_id)
    }

    pub fn active_call_ids(&self) -> Vec<String> {
        self.registry.read().active.keys().cloned().collect()
    }

    pub fn call_attempts(&self, call_id: &str) -> u32 {
        self.registry.read().attempts.get(call_id).copied().unwrap_or(0)
    }

    /// `None` until the network has been configured
    pub fn network_info(&self) -> Option<NetworkInfo> {
        let config = self.network.config()?;
        Some(NetworkInfo {
            local_ip: config.local_ip,
            public_ip: config.public_ip,
            local_port: config.local_port,
            listener_port: self.listener.port(),
            sip_server: config.sip_server,
            sip_port: config.sip_port,
            upnp_available: self.upnp.is_available(),
        })
    }

    pub async fn stats(&self) -> ProxyStats {
        let (active_calls, total_attempts) = {
            let registry = self.registry.read();
            (
                registry.active.len(),
                registry.attempts.values().map(|n| u64::from(*n)).sum(),
            )
        };
        ProxyStats {
            running: self.is_running().await,
            active_calls,
            total_attempts,
            active_streams: self.rtp.stream_count(),
            pending_transactions: self.calls.pending_transactions(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn rtp_proxy(&self) -> &Arc<RtpProxy> {
        &self.rtp
    }

    pub fn call_tests(&self) -> &CallAcceptTestManager {
        &self.tests
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("sip_server", &self.settings.sip_server)
            .field("sip_port", &self.settings.sip_port)
            .field("network", &self.network)
            .field("calls", &self.calls)
            .finish()
    }
}
