//! Doubles shared by the unit tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::agent::{AgentConfig, Context};
use crate::error::{Result, UaError};
use crate::events::{CallAction, CallInfo, EndReason, EventSink, IncomingOffer, SipEvent};
use crate::identity::Identity;
use crate::message::{Method, SipMessage};
use crate::sdp;
use crate::transport::Transport;

/// Records every outgoing message instead of sending it
pub struct MockTransport {
    sent: Mutex<Vec<(SipMessage, SocketAddr)>>,
    failing: AtomicBool,
    local: SocketAddr,
}

impl MockTransport {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            local,
        }
    }

    pub fn sent(&self) -> Vec<(SipMessage, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_sent(&self) -> SipMessage {
        self.last_sent_with_destination().0
    }

    pub fn last_sent_with_destination(&self) -> (SipMessage, SocketAddr) {
        self.sent.lock().unwrap().last().cloned().expect("nothing sent")
    }

    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UaError::network("Network is unreachable"));
        }
        self.sent.lock().unwrap().push((message.clone(), destination));
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// Collects callbacks as [`SipEvent`]s and answers offers with a fixed action
pub struct RecordingSink {
    events: Mutex<Vec<SipEvent>>,
    action: CallAction,
}

impl RecordingSink {
    pub fn new(action: CallAction) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            action,
        }
    }

    pub fn events(&self) -> Vec<SipEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&SipEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: SipEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl EventSink for RecordingSink {
    fn on_registering(&self, aor: &str) {
        self.push(SipEvent::Registering { aor: aor.to_string() });
    }

    fn on_registration_done(&self, aor: &str, expiry_secs: u32) {
        self.push(SipEvent::RegistrationDone {
            aor: aor.to_string(),
            expiry_secs,
        });
    }

    fn on_registration_failed(&self, aor: &str, reason: &str) {
        self.push(SipEvent::RegistrationFailed {
            aor: aor.to_string(),
            reason: reason.to_string(),
        });
    }

    fn on_incoming_call(&self, offer: &IncomingOffer) -> CallAction {
        self.push(SipEvent::IncomingCall {
            call_id: offer.call_id.clone(),
            caller: offer.caller.clone(),
            auto: None,
        });
        self.action
    }

    fn on_call_established(&self, call: &CallInfo) {
        self.push(SipEvent::CallEstablished {
            call_id: call.call_id.clone(),
            remote: call.remote.clone(),
            direction: call.direction,
        });
    }

    fn on_call_failed(&self, call: &CallInfo, reason: &str) {
        self.push(SipEvent::CallFailed {
            call_id: call.call_id.clone(),
            remote: call.remote.clone(),
            reason: reason.to_string(),
        });
    }

    fn on_call_ended(&self, call: &CallInfo, reason: EndReason) {
        self.push(SipEvent::CallEnded {
            call_id: call.call_id.clone(),
            remote: call.remote.clone(),
            reason,
        });
    }
}

/// alice@example.com behind a mock transport, registrar at 192.0.2.1
pub struct Harness {
    pub config: AgentConfig,
    pub transport: Arc<MockTransport>,
    pub sink: Arc<RecordingSink>,
    pub registrar: SocketAddr,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_action(CallAction::Defer)
    }

    pub fn with_action(action: CallAction) -> Self {
        let registrar: SocketAddr = "192.0.2.1:5060".parse().unwrap();
        let identity = Identity::new("alice", "example.com", "secret");
        Self {
            config: AgentConfig::new(identity, registrar),
            transport: Arc::new(MockTransport::new("192.0.2.10:5060".parse().unwrap())),
            sink: Arc::new(RecordingSink::new(action)),
            registrar,
        }
    }

    pub(crate) fn ctx(&self) -> Context<'_> {
        Context::new(&self.config, &*self.transport, &*self.sink)
    }
}

/// INVITE from `caller` to alice, sent from 10.0.0.9
pub fn inbound_invite(call_id: &str, caller: &str) -> SipMessage {
    let user = caller
        .trim_start_matches("sip:")
        .split('@')
        .next()
        .unwrap_or("caller");
    let offer = sdp::audio_description("10.0.0.9".parse().unwrap(), 20000, 1);
    SipMessage::request(Method::Invite, "sip:alice@example.com")
        .with_header("Via", "SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bKinvite1")
        .with_header("Max-Forwards", "70")
        .with_header("From", format!("<{}>;tag={}tag", caller, user))
        .with_header("To", "<sip:alice@example.com>")
        .with_header("Call-ID", call_id)
        .with_header("CSeq", "1 INVITE")
        .with_header("Contact", format!("<sip:{}@10.0.0.9:5060>", user))
        .with_body(sdp::CONTENT_TYPE, offer)
}
