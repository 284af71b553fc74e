//! REGISTER lifecycle for the local identity.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::Context;
use crate::digest::{digest_response, new_cnonce, Challenge};
use crate::error::Result;
use crate::message::{new_branch, new_call_id, new_tag, param, Method, SipMessage, StatusClass};

/// Registrar response wait when no timeout is configured
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered { expires: u32 },
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Purpose {
    Register,
    Unregister,
}

/// The REGISTER currently awaiting a final response
struct Pending {
    purpose: Purpose,
    request: SipMessage,
    cseq: u32,
    authenticated: bool,
    deadline: Instant,
}

pub struct RegistrationManager {
    state: RegistrationState,
    call_id: String,
    from_tag: String,
    cseq: u32,
    requested_expiry: u32,
    timeout: Duration,
    pending: Option<Pending>,
}

impl RegistrationManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: RegistrationState::Unregistered,
            call_id: new_call_id(),
            from_tag: new_tag(),
            cseq: 0,
            requested_expiry: 0,
            timeout,
            pending: None,
        }
    }

    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.state, RegistrationState::Registered { .. })
    }

    /// Call-ID shared by every REGISTER this manager sends
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    pub(crate) async fn register(
        &mut self,
        ctx: &Context<'_>,
        registrar: SocketAddr,
        expiry: u32,
        now: Instant,
    ) {
        let aor = ctx.identity().aor();
        info!(%aor, %registrar, expiry, "registering");

        self.state = RegistrationState::Registering;
        self.requested_expiry = expiry;
        self.pending = None;
        ctx.sink.on_registering(&aor);

        let request = self.build_register(ctx, expiry);
        let cseq = self.cseq;
        match ctx.send(&request, registrar).await {
            Ok(()) => {
                self.pending = Some(Pending {
                    purpose: Purpose::Register,
                    request,
                    cseq,
                    authenticated: false,
                    deadline: now + self.timeout,
                });
            }
            Err(e) => self.fail(ctx, e.to_string()),
        }
    }

    /// Best effort: the state is `Unregistered` whatever the registrar says.
    pub(crate) async fn unregister(&mut self, ctx: &Context<'_>, registrar: SocketAddr, now: Instant) {
        self.state = RegistrationState::Unregistered;
        self.pending = None;

        let request = self.build_register(ctx, 0);
        let cseq = self.cseq;
        match ctx.send(&request, registrar).await {
            Ok(()) => {
                info!(aor = %ctx.identity().aor(), "unregister sent (Expires: 0)");
                self.pending = Some(Pending {
                    purpose: Purpose::Unregister,
                    request,
                    cseq,
                    authenticated: false,
                    deadline: now + self.timeout,
                });
            }
            Err(e) => warn!(error = %e, "failed to send unregister (continuing anyway)"),
        }
    }

    pub(crate) async fn handle_response(
        &mut self,
        ctx: &Context<'_>,
        response: &SipMessage,
        registrar: SocketAddr,
        now: Instant,
    ) {
        let Some(pending) = self.pending.as_ref() else {
            debug!(status = %response.summary(), "no REGISTER in flight, dropping response");
            return;
        };
        if response.cseq() != Some((pending.cseq, Method::Register)) {
            debug!(status = %response.summary(), "stale REGISTER response");
            return;
        }

        match response.status_class() {
            Some(StatusClass::Provisional) | None => {}
            Some(StatusClass::Success) => {
                let Some(pending) = self.pending.take() else {
                    return;
                };
                if pending.purpose == Purpose::Unregister {
                    info!("unregistered successfully");
                    return;
                }
                let expires = granted_expiry(response).unwrap_or(self.requested_expiry);
                let aor = ctx.identity().aor();
                info!(%aor, expires, "registration successful");
                self.state = RegistrationState::Registered { expires };
                ctx.sink.on_registration_done(&aor, expires);
            }
            Some(StatusClass::Failure) => {
                let challenged = matches!(response.status(), Some(401 | 407));
                let reason = if challenged && !pending.authenticated {
                    match self.answer_challenge(ctx, response, registrar, now).await {
                        Ok(()) => return,
                        Err(e) => format!("{}: {}", response.summary(), e),
                    }
                } else {
                    response.summary()
                };

                let Some(pending) = self.pending.take() else {
                    return;
                };
                match pending.purpose {
                    Purpose::Register => self.fail(ctx, reason),
                    Purpose::Unregister => warn!(%reason, "unregister rejected"),
                }
            }
        }
    }

    pub(crate) fn handle_timeout(&mut self, ctx: &Context<'_>, now: Instant) {
        let expired = matches!(&self.pending, Some(p) if p.deadline <= now);
        if !expired {
            return;
        }
        if let Some(pending) = self.pending.take() {
            match pending.purpose {
                Purpose::Register => {
                    let secs = self.timeout.as_secs();
                    self.fail(ctx, format!("Timeout waiting for registrar response ({}s)", secs));
                }
                Purpose::Unregister => debug!("no response to unregister"),
            }
        }
    }

    // Re-sends the pending REGISTER once with credentials.
    async fn answer_challenge(
        &mut self,
        ctx: &Context<'_>,
        response: &SipMessage,
        registrar: SocketAddr,
        now: Instant,
    ) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        let challenge = Challenge::from_response(response)?;
        let identity = ctx.identity();
        let uri = pending.request.request_uri().unwrap_or_default().to_string();
        let authorization = digest_response(
            identity.username(),
            identity.password(),
            Method::Register.as_str(),
            &uri,
            &challenge,
            &new_cnonce(),
        )?;

        self.cseq += 1;
        let mut request = pending.request.clone();
        request.set_header("Via", ctx.via(&new_branch()));
        request.set_header("CSeq", format!("{} REGISTER", self.cseq));
        request.set_header(challenge.answer_header(), authorization);

        debug!(realm = ?challenge.realm(), "answering registrar challenge");
        ctx.send(&request, registrar).await?;

        pending.request = request;
        pending.cseq = self.cseq;
        pending.authenticated = true;
        pending.deadline = now + self.timeout;
        Ok(())
    }

    fn build_register(&mut self, ctx: &Context<'_>, expiry: u32) -> SipMessage {
        self.cseq += 1;
        let aor = ctx.identity().aor();
        ctx.request(Method::Register, &format!("sip:{}", ctx.identity().domain()))
            .with_header("From", format!("<{}>;tag={}", aor, self.from_tag))
            .with_header("To", format!("<{}>", aor))
            .with_header("Call-ID", self.call_id.clone())
            .with_header("CSeq", format!("{} REGISTER", self.cseq))
            .with_header("Contact", ctx.contact())
            .with_header("Expires", expiry.to_string())
    }

    fn fail(&mut self, ctx: &Context<'_>, reason: String) {
        let aor = ctx.identity().aor();
        warn!(%aor, %reason, "registration failed");
        self.state = RegistrationState::Failed(reason.clone());
        ctx.sink.on_registration_failed(&aor, &reason);
    }
}

// Contact ;expires= wins over the Expires header
fn granted_expiry(response: &SipMessage) -> Option<u32> {
    response
        .headers("Contact")
        .find_map(|contact| param(contact, "expires"))
        .and_then(|v| v.parse().ok())
        .or_else(|| response.header("Expires").and_then(|v| v.trim().parse().ok()))
}
