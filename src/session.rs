//! Per-call state machine for one outbound or inbound call.
//!
//! ```text
//! Idle --originate--> Dialing --2xx--> Established --BYE--> Terminating --> Terminated
//!                        |  \--failure/timeout--> Failed
//! Idle --INVITE--> Ringing --accept--> Established
//!                     |  \--decline/CANCEL--> Terminated
//!                     \--timeout--> Failed
//! ```
//!
//! There are no retry edges: a failed call stays failed.

use std::net::SocketAddr;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::Context;
use crate::digest::{digest_response, new_cnonce, Challenge};
use crate::error::{Result, UaError};
use crate::events::{CallAction, CallInfo, Direction, EndReason, IncomingOffer};
use crate::message::{new_branch, new_call_id, new_tag, tag_param, uri_of, Method, SipMessage, StatusClass};
use crate::sdp::{self, MediaEndpoint};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    Established,
    Terminating,
    Terminated,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Terminated | CallState::Failed)
    }
}

pub struct CallSession {
    call_id: String,
    direction: Direction,
    state: CallState,
    local_uri: String,
    remote_uri: String,
    local_tag: String,
    remote_tag: Option<String>,
    local_cseq: u32,
    /// INVITE we sent, or the one we are answering
    invite: Option<SipMessage>,
    /// Where requests and responses for this call are sent
    peer: SocketAddr,
    remote_target: Option<String>,
    remote_media: Option<MediaEndpoint>,
    authenticated: bool,
    deadline: Option<Instant>,
}

impl CallSession {
    pub(crate) fn outbound(ctx: &Context<'_>, target: String, proxy: SocketAddr) -> Self {
        Self {
            call_id: new_call_id(),
            direction: Direction::Outbound,
            state: CallState::Idle,
            local_uri: ctx.identity().aor(),
            remote_uri: target,
            local_tag: new_tag(),
            remote_tag: None,
            local_cseq: 0,
            invite: None,
            peer: proxy,
            remote_target: None,
            remote_media: None,
            authenticated: false,
            deadline: None,
        }
    }

    pub(crate) fn inbound(invite: &SipMessage, from: SocketAddr) -> Result<Self> {
        let call_id = invite
            .call_id()
            .ok_or_else(|| UaError::parse("INVITE without Call-ID"))?;
        let from_header = invite
            .header("From")
            .ok_or_else(|| UaError::parse("INVITE without From"))?;
        let to_header = invite
            .header("To")
            .ok_or_else(|| UaError::parse("INVITE without To"))?;
        if invite.cseq().is_none() {
            return Err(UaError::parse("INVITE without CSeq"));
        }

        Ok(Self {
            call_id: call_id.to_string(),
            direction: Direction::Inbound,
            state: CallState::Idle,
            local_uri: uri_of(to_header).to_string(),
            remote_uri: uri_of(from_header).to_string(),
            local_tag: new_tag(),
            remote_tag: tag_param(from_header),
            local_cseq: 0,
            invite: Some(invite.clone()),
            peer: from,
            remote_target: invite.header("Contact").map(|c| uri_of(c).to_string()),
            remote_media: sdp::parse_media_endpoint(invite.body()).ok(),
            authenticated: false,
            deadline: None,
        })
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.call_id.clone(),
            remote: self.remote_uri.clone(),
            direction: self.direction,
            remote_media: self.remote_media.clone(),
        }
    }

    /// Present only while an inbound call is ringing
    pub fn offer(&self) -> Option<IncomingOffer> {
        (self.direction == Direction::Inbound && self.state == CallState::Ringing).then(|| IncomingOffer {
            call_id: self.call_id.clone(),
            caller: self.remote_uri.clone(),
            callee: self.local_uri.clone(),
        })
    }

    /// Dialog match on Call-ID; responses must also carry our From tag.
    pub fn matches(&self, message: &SipMessage) -> bool {
        if message.call_id() != Some(self.call_id.as_str()) {
            return false;
        }
        if message.is_response() {
            return message.from_tag().map_or(true, |tag| tag == self.local_tag);
        }
        true
    }

    pub(crate) async fn originate(&mut self, ctx: &Context<'_>, now: Instant) -> Result<()> {
        if self.state != CallState::Idle {
            return Err(UaError::session("call already started"));
        }

        self.local_cseq += 1;
        let offer = sdp::audio_description(ctx.local_addr().ip(), sdp::DEFAULT_AUDIO_PORT, sdp::session_id());
        let invite = ctx
            .request(Method::Invite, &self.remote_uri)
            .with_header("From", format!("<{}>;tag={}", self.local_uri, self.local_tag))
            .with_header("To", format!("<{}>", self.remote_uri))
            .with_header("Call-ID", self.call_id.clone())
            .with_header("CSeq", format!("{} INVITE", self.local_cseq))
            .with_header("Contact", ctx.contact())
            .with_body(sdp::CONTENT_TYPE, offer);

        info!(call_id = %self.call_id, target = %self.remote_uri, "placing call");
        if let Err(e) = ctx.send(&invite, self.peer).await {
            warn!(call_id = %self.call_id, error = %e, "failed to send INVITE");
            self.state = CallState::Failed;
            return Err(e);
        }

        self.invite = Some(invite);
        self.state = CallState::Dialing;
        self.deadline = Some(now + ctx.config.call_timeout);
        Ok(())
    }

    /// Alerts for a fresh inbound INVITE and lets the sink decide.
    pub(crate) async fn ring(&mut self, ctx: &Context<'_>, now: Instant) {
        self.state = CallState::Ringing;
        self.deadline = Some(now + ctx.config.call_timeout);
        self.respond_to_invite(ctx, 180, "Ringing").await;

        let Some(offer) = self.offer() else {
            return;
        };
        info!(call_id = %self.call_id, caller = %offer.caller, "incoming call");

        match ctx.sink.on_incoming_call(&offer) {
            CallAction::Accept => {
                if let Err(e) = self.accept(ctx).await {
                    warn!(call_id = %self.call_id, error = %e, "auto-answer failed");
                }
            }
            CallAction::Decline => {
                if let Err(e) = self.decline(ctx).await {
                    warn!(call_id = %self.call_id, error = %e, "auto-decline failed");
                }
            }
            CallAction::Defer => {}
        }
    }

    pub(crate) async fn accept(&mut self, ctx: &Context<'_>) -> Result<()> {
        if self.offer().is_none() {
            return Err(UaError::session("no ringing call to accept"));
        }
        let Some(invite) = self.invite.as_ref() else {
            return Err(UaError::session("no INVITE to answer"));
        };

        let answer = sdp::audio_description(ctx.local_addr().ip(), sdp::DEFAULT_AUDIO_PORT, sdp::session_id());
        let ok = SipMessage::response_to(invite, 200, "OK", Some(&self.local_tag))
            .with_header("Contact", ctx.contact())
            .with_body(sdp::CONTENT_TYPE, answer);

        self.deadline = None;
        match ctx.send(&ok, self.peer).await {
            Ok(()) => {
                self.state = CallState::Established;
                info!(call_id = %self.call_id, "call answered");
                ctx.sink.on_call_established(&self.info());
                Ok(())
            }
            Err(e) => {
                self.state = CallState::Failed;
                ctx.sink.on_call_failed(&self.info(), &e.to_string());
                Err(e)
            }
        }
    }

    pub(crate) async fn decline(&mut self, ctx: &Context<'_>) -> Result<()> {
        if self.offer().is_none() {
            return Err(UaError::session("no ringing call to decline"));
        }
        self.respond_to_invite(ctx, 603, "Decline").await;
        self.finish(ctx, EndReason::Declined);
        Ok(())
    }

    /// Hangs up whatever stage the call is in. Always ends `Terminated`
    /// unless the call had already ended, in which case nothing happens.
    pub(crate) async fn end(&mut self, ctx: &Context<'_>) -> Result<()> {
        match self.state {
            CallState::Terminated | CallState::Failed => {
                debug!(call_id = %self.call_id, "call already ended");
                return Ok(());
            }
            CallState::Idle => {
                self.state = CallState::Terminated;
                return Ok(());
            }
            CallState::Dialing => self.send_cancel(ctx).await,
            CallState::Ringing => self.respond_to_invite(ctx, 603, "Decline").await,
            CallState::Established | CallState::Terminating => {
                self.state = CallState::Terminating;
                self.send_bye(ctx).await;
            }
        }
        self.finish(ctx, EndReason::LocalHangup);
        Ok(())
    }

    pub(crate) async fn handle_request(&mut self, ctx: &Context<'_>, request: &SipMessage, from: SocketAddr) {
        let Some(method) = request.method() else {
            return;
        };
        match method {
            Method::Invite => match self.state {
                // retransmission of the INVITE we are ringing for
                CallState::Ringing => self.respond_to_invite(ctx, 180, "Ringing").await,
                state if state.is_terminal() => {
                    debug!(call_id = %self.call_id, "INVITE for an ended call, dropping")
                }
                _ => {
                    info!(call_id = %self.call_id, "busy, rejecting INVITE within the current call");
                    self.reply(ctx, request, 486, "Busy Here", from).await;
                }
            },
            Method::Ack => debug!(call_id = %self.call_id, "ACK received"),
            Method::Bye => {
                if self.state == CallState::Established {
                    self.reply(ctx, request, 200, "OK", from).await;
                    self.state = CallState::Terminating;
                    info!(call_id = %self.call_id, "remote hung up");
                    self.finish(ctx, EndReason::RemoteHangup);
                } else {
                    self.reply(ctx, request, 481, "Call/Transaction Does Not Exist", from)
                        .await;
                }
            }
            Method::Cancel => {
                if self.state.is_terminal() {
                    self.reply(ctx, request, 481, "Call/Transaction Does Not Exist", from)
                        .await;
                } else if self.offer().is_some() {
                    self.reply(ctx, request, 200, "OK", from).await;
                    self.respond_to_invite(ctx, 487, "Request Terminated").await;
                    info!(call_id = %self.call_id, "caller cancelled");
                    self.finish(ctx, EndReason::RemoteCancelled);
                } else {
                    // already answered: CANCEL has no effect
                    self.reply(ctx, request, 200, "OK", from).await;
                }
            }
            other => {
                debug!(call_id = %self.call_id, method = %other, "unsupported in-dialog request");
                self.reply(ctx, request, 501, "Not Implemented", from).await;
            }
        }
    }

    pub(crate) async fn handle_response(&mut self, ctx: &Context<'_>, response: &SipMessage) {
        match response.cseq() {
            Some((_, Method::Invite)) => self.handle_invite_response(ctx, response).await,
            Some((_, method)) => {
                debug!(call_id = %self.call_id, %method, status = %response.summary(), "response absorbed")
            }
            None => {}
        }
    }

    pub(crate) async fn handle_timeout(&mut self, ctx: &Context<'_>, now: Instant) {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return,
        }
        self.deadline = None;

        match self.state {
            CallState::Dialing => {
                warn!(call_id = %self.call_id, "no answer before timeout, cancelling");
                self.send_cancel(ctx).await;
            }
            CallState::Ringing => {
                warn!(call_id = %self.call_id, "incoming call not answered before timeout");
                self.respond_to_invite(ctx, 408, "Request Timeout").await;
            }
            _ => return,
        }
        self.state = CallState::Failed;
        ctx.sink.on_call_failed(&self.info(), "timeout");
    }

    async fn handle_invite_response(&mut self, ctx: &Context<'_>, response: &SipMessage) {
        let Some(status) = response.status() else {
            return;
        };
        let current = self.invite.as_ref().and_then(SipMessage::cseq).map(|(n, _)| n);
        if response.cseq().map(|(n, _)| n) != current {
            debug!(call_id = %self.call_id, status = %response.summary(), "stale INVITE response");
            return;
        }

        let class = StatusClass::of(status);
        if class == StatusClass::Failure {
            self.ack_failure(ctx, response).await;
        }

        if self.state != CallState::Dialing {
            if class == StatusClass::Success {
                self.late_success(ctx, response).await;
            }
            return;
        }

        match class {
            StatusClass::Provisional => {
                if let Some(tag) = response.to_tag() {
                    self.remote_tag = Some(tag);
                }
                info!(call_id = %self.call_id, status = %response.summary(), "call progress");
            }
            StatusClass::Success => {
                self.adopt_answer(response);
                let ack = self.dialog_request(ctx, Method::Ack);
                if let Err(e) = ctx.send(&ack, self.peer).await {
                    warn!(call_id = %self.call_id, error = %e, "failed to send ACK");
                }
                self.state = CallState::Established;
                self.deadline = None;
                info!(call_id = %self.call_id, "call established");
                ctx.sink.on_call_established(&self.info());
            }
            StatusClass::Failure => {
                if matches!(status, 401 | 407) && !self.authenticated {
                    match self.reinvite_with_credentials(ctx, response).await {
                        Ok(()) => return,
                        Err(e) => warn!(call_id = %self.call_id, error = %e, "cannot answer challenge"),
                    }
                }
                let reason = response.summary();
                warn!(call_id = %self.call_id, %reason, "call failed");
                self.state = CallState::Failed;
                self.deadline = None;
                ctx.sink.on_call_failed(&self.info(), &reason);
            }
        }
    }

    // A 2xx after we stopped dialing: re-ACK a retransmission, or tear
    // down a call that was answered while our CANCEL was in flight.
    async fn late_success(&mut self, ctx: &Context<'_>, response: &SipMessage) {
        match self.state {
            CallState::Established => {
                let ack = self.dialog_request(ctx, Method::Ack);
                if let Err(e) = ctx.send(&ack, self.peer).await {
                    warn!(call_id = %self.call_id, error = %e, "failed to re-send ACK");
                }
            }
            CallState::Terminated | CallState::Failed if self.direction == Direction::Outbound => {
                info!(call_id = %self.call_id, "answered after cancel, hanging up");
                self.adopt_answer(response);
                let ack = self.dialog_request(ctx, Method::Ack);
                if let Err(e) = ctx.send(&ack, self.peer).await {
                    warn!(call_id = %self.call_id, error = %e, "failed to send ACK");
                }
                self.send_bye(ctx).await;
            }
            _ => {}
        }
    }

    fn adopt_answer(&mut self, response: &SipMessage) {
        self.remote_tag = response.to_tag();
        self.remote_target = response.header("Contact").map(|c| uri_of(c).to_string());
        self.remote_media = sdp::parse_media_endpoint(response.body()).ok();
    }

    async fn reinvite_with_credentials(&mut self, ctx: &Context<'_>, response: &SipMessage) -> Result<()> {
        let Some(previous) = self.invite.as_ref() else {
            return Err(UaError::session("no INVITE to authenticate"));
        };
        let challenge = Challenge::from_response(response)?;
        let identity = ctx.identity();
        let authorization = digest_response(
            identity.username(),
            identity.password(),
            Method::Invite.as_str(),
            &self.remote_uri,
            &challenge,
            &new_cnonce(),
        )?;

        let mut invite = previous.clone();
        invite.set_header("Via", ctx.via(&new_branch()));
        invite.set_header("CSeq", format!("{} INVITE", self.local_cseq + 1));
        invite.set_header(challenge.answer_header(), authorization);

        debug!(call_id = %self.call_id, realm = ?challenge.realm(), "answering INVITE challenge");
        ctx.send(&invite, self.peer).await?;

        self.local_cseq += 1;
        self.invite = Some(invite);
        self.authenticated = true;
        Ok(())
    }

    fn finish(&mut self, ctx: &Context<'_>, reason: EndReason) {
        self.state = CallState::Terminated;
        self.deadline = None;
        info!(call_id = %self.call_id, ?reason, "call ended");
        ctx.sink.on_call_ended(&self.info(), reason);
    }

    /// In-dialog request from our side of the dialog
    fn dialog_request(&mut self, ctx: &Context<'_>, method: Method) -> SipMessage {
        // ACK reuses the INVITE sequence number
        if method != Method::Ack {
            self.local_cseq += 1;
        }
        let uri = self.remote_target.as_deref().unwrap_or(&self.remote_uri);
        let to = match &self.remote_tag {
            Some(tag) => format!("<{}>;tag={}", self.remote_uri, tag),
            None => format!("<{}>", self.remote_uri),
        };
        ctx.request(method.clone(), uri)
            .with_header("From", format!("<{}>;tag={}", self.local_uri, self.local_tag))
            .with_header("To", to)
            .with_header("Call-ID", self.call_id.clone())
            .with_header("CSeq", format!("{} {}", self.local_cseq, method))
    }

    /// CANCEL or non-2xx ACK: same transaction as our INVITE
    fn invite_transaction_request(&self, ctx: &Context<'_>, method: Method, to: &str) -> Option<SipMessage> {
        let invite = self.invite.as_ref()?;
        let (cseq, _) = invite.cseq()?;
        Some(
            SipMessage::request(method.clone(), invite.request_uri()?)
                .with_header("Via", invite.header("Via")?)
                .with_header("Max-Forwards", "70")
                .with_header("From", invite.header("From")?)
                .with_header("To", to)
                .with_header("Call-ID", self.call_id.clone())
                .with_header("CSeq", format!("{} {}", cseq, method))
                .with_header("User-Agent", ctx.config.user_agent.clone()),
        )
    }

    async fn ack_failure(&self, ctx: &Context<'_>, response: &SipMessage) {
        if self.direction != Direction::Outbound {
            return;
        }
        let Some(to) = response.header("To") else {
            return;
        };
        if let Some(ack) = self.invite_transaction_request(ctx, Method::Ack, to) {
            if let Err(e) = ctx.send(&ack, self.peer).await {
                warn!(call_id = %self.call_id, error = %e, "failed to ACK failure response");
            }
        }
    }

    async fn send_cancel(&self, ctx: &Context<'_>) {
        let to = self
            .invite
            .as_ref()
            .and_then(|invite| invite.header("To"))
            .unwrap_or_default()
            .to_string();
        let Some(cancel) = self.invite_transaction_request(ctx, Method::Cancel, &to) else {
            return;
        };
        if let Err(e) = ctx.send(&cancel, self.peer).await {
            warn!(call_id = %self.call_id, error = %e, "failed to send CANCEL (call terminated anyway)");
        }
    }

    async fn send_bye(&mut self, ctx: &Context<'_>) {
        let bye = self.dialog_request(ctx, Method::Bye);
        if let Err(e) = ctx.send(&bye, self.peer).await {
            warn!(call_id = %self.call_id, error = %e, "failed to send BYE (call terminated anyway)");
        }
    }

    async fn respond_to_invite(&self, ctx: &Context<'_>, code: u16, reason: &str) {
        let Some(invite) = self.invite.as_ref().filter(|_| self.direction == Direction::Inbound) else {
            return;
        };
        let mut response = SipMessage::response_to(invite, code, reason, Some(&self.local_tag));
        if code < 300 {
            response.push_header("Contact", ctx.contact());
        }
        if let Err(e) = ctx.send(&response, self.peer).await {
            warn!(call_id = %self.call_id, code, error = %e, "failed to respond to INVITE");
        }
    }

    async fn reply(&self, ctx: &Context<'_>, request: &SipMessage, code: u16, reason: &str, to: SocketAddr) {
        let response = SipMessage::response_to(request, code, reason, Some(&self.local_tag));
        if let Err(e) = ctx.send(&response, to).await {
            warn!(call_id = %self.call_id, code, error = %e, "failed to send response");
        }
    }
}
