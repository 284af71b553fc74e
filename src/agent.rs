//! User-agent core: one registration, at most one call.
//!
//! Every inbound message and every application action goes through a
//! `&mut UserAgent`, so transitions are applied strictly one at a time.
//! Time is passed in by the caller; the agent only reports its next
//! deadline and reacts when [`UserAgent::handle_timeout`] is invoked.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, UaError};
use crate::events::{CallInfo, EventSink, IncomingOffer};
use crate::identity::Identity;
use crate::message::{new_branch, new_tag, Method, SipMessage};
use crate::registration::{RegistrationManager, RegistrationState, DEFAULT_REGISTRATION_TIMEOUT};
use crate::session::{CallSession, CallState};
use crate::transport::Transport;

/// Call setup gives up after this long without a final response
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_EXPIRY_SECS: u32 = 3600;

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub identity: Identity,
    /// Registrar, also used as outbound proxy for every request we originate
    pub registrar: SocketAddr,
    pub expiry_secs: u32,
    pub call_timeout: Duration,
    pub registration_timeout: Duration,
    pub user_agent: String,
}

impl AgentConfig {
    pub fn new(identity: Identity, registrar: SocketAddr) -> Self {
        Self {
            identity,
            registrar,
            expiry_secs: DEFAULT_EXPIRY_SECS,
            call_timeout: CALL_TIMEOUT,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            user_agent: format!("voip-demo/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// What registration and call handling need from their owner for the
/// duration of one operation.
pub(crate) struct Context<'a> {
    pub config: &'a AgentConfig,
    pub transport: &'a dyn Transport,
    pub sink: &'a dyn EventSink,
}

impl<'a> Context<'a> {
    pub fn new(config: &'a AgentConfig, transport: &'a dyn Transport, sink: &'a dyn EventSink) -> Self {
        Self {
            config,
            transport,
            sink,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.config.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn via(&self, branch: &str) -> String {
        format!("SIP/2.0/UDP {};branch={};rport", self.local_addr(), branch)
    }

    pub fn contact(&self) -> String {
        format!("<{}>", self.identity().contact(&self.local_addr().to_string()))
    }

    /// New request with a fresh Via branch and the headers every request carries
    pub fn request(&self, method: Method, uri: &str) -> SipMessage {
        SipMessage::request(method, uri)
            .with_header("Via", self.via(&new_branch()))
            .with_header("Max-Forwards", "70")
            .with_header("User-Agent", self.config.user_agent.clone())
    }

    pub async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        self.transport.send(message, destination).await
    }
}

pub struct UserAgent {
    config: AgentConfig,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    registration: RegistrationManager,
    call: Option<CallSession>,
}

impl UserAgent {
    pub fn new(config: AgentConfig, transport: Arc<dyn Transport>, sink: Arc<dyn EventSink>) -> Self {
        let registration = RegistrationManager::new(config.registration_timeout);
        Self {
            config,
            transport,
            sink,
            registration,
            call: None,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registration_state(&self) -> &RegistrationState {
        self.registration.state()
    }

    /// State of the current (or most recent) call
    pub fn call_state(&self) -> Option<CallState> {
        self.call.as_ref().map(CallSession::state)
    }

    pub fn current_call(&self) -> Option<CallInfo> {
        self.call.as_ref().map(CallSession::info)
    }

    /// The inbound call waiting for accept/decline, if any
    pub fn pending_offer(&self) -> Option<IncomingOffer> {
        self.call.as_ref().and_then(CallSession::offer)
    }

    pub async fn register(&mut self, now: Instant) {
        let ctx = Context::new(&self.config, &*self.transport, &*self.sink);
        self.registration
            .register(&ctx, self.config.registrar, self.config.expiry_secs, now)
            .await;
    }

    pub async fn unregister(&mut self, now: Instant) {
        let ctx = Context::new(&self.config, &*self.transport, &*self.sink);
        self.registration.unregister(&ctx, self.config.registrar, now).await;
    }

    /// Places an outbound call.
    ///
    /// Fails with `Busy` while another call is live and with `Network` if
    /// the INVITE cannot be sent; the outcome of the call itself arrives
    /// through the event sink.
    pub async fn originate(&mut self, address: &str, now: Instant) -> Result<()> {
        if self.has_live_call() {
            warn!(target_address = address, "rejecting call attempt: already in a call");
            return Err(UaError::Busy);
        }
        let target = self.config.identity.target_uri(address)?;

        let ctx = Context::new(&self.config, &*self.transport, &*self.sink);
        let mut session = CallSession::outbound(&ctx, target, self.config.registrar);
        let result = session.originate(&ctx, now).await;
        self.call = Some(session);
        result
    }

    pub async fn accept_incoming(&mut self) -> Result<()> {
        let ctx = Context::new(&self.config, &*self.transport, &*self.sink);
        match self.call.as_mut() {
            Some(call) if call.offer().is_some() => call.accept(&ctx).await,
            _ => Err(UaError::session("no incoming call to accept")),
        }
    }

    pub async fn decline_incoming(&mut self) -> Result<()> {
        let ctx = Context::new(&self.config, &*self.transport, &*self.sink);
        match self.call.as_mut() {
            Some(call) if call.offer().is_some() => call.decline(&ctx).await,
            _ => Err(UaError::session("no incoming call to decline")),
        }
    }

    /// Hangs up, cancels or rejects the current call. A no-op once the call
    /// has already ended.
    pub async fn end_call(&mut self) -> Result<()> {
        let ctx = Context::new(&self.config, &*self.transport, &*self.sink);
        match self.call.as_mut() {
            Some(call) => call.end(&ctx).await,
            None => Err(UaError::session("no call to end")),
        }
    }

    pub async fn handle_message(&mut self, message: SipMessage, from: SocketAddr, now: Instant) {
        let ctx = Context::new(&self.config, &*self.transport, &*self.sink);

        if message.is_response() && message.call_id() == Some(self.registration.call_id()) {
            self.registration
                .handle_response(&ctx, &message, self.config.registrar, now)
                .await;
            return;
        }

        if let Some(call) = self.call.as_mut().filter(|call| call.matches(&message)) {
            if message.is_request() {
                call.handle_request(&ctx, &message, from).await;
            } else {
                call.handle_response(&ctx, &message).await;
            }
            return;
        }

        if message.method() == Some(&Method::Invite) {
            if self.call.as_ref().is_some_and(|call| !call.state().is_terminal()) {
                info!(caller = ?message.header("From"), "busy, rejecting second INVITE");
                let busy = SipMessage::response_to(&message, 486, "Busy Here", Some(&new_tag()));
                if let Err(e) = ctx.send(&busy, from).await {
                    warn!(error = %e, "failed to send 486");
                }
                return;
            }
            match CallSession::inbound(&message, from) {
                Ok(mut session) => {
                    session.ring(&ctx, now).await;
                    self.call = Some(session);
                }
                Err(e) => warn!(error = %e, "dropping malformed INVITE"),
            }
            return;
        }

        debug!(message = %message.summary(), %from, "no dialog matches, dropping");
    }

    pub async fn handle_timeout(&mut self, now: Instant) {
        let ctx = Context::new(&self.config, &*self.transport, &*self.sink);
        self.registration.handle_timeout(&ctx, now);
        if let Some(call) = self.call.as_mut() {
            call.handle_timeout(&ctx, now).await;
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let call = self.call.as_ref().and_then(CallSession::deadline);
        match (self.registration.deadline(), call) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn has_live_call(&self) -> bool {
        self.call.as_ref().is_some_and(|call| !call.state().is_terminal())
    }
}
