//! Notifications from the user agent to the surrounding application.
//!
//! The core calls an [`EventSink`] synchronously at each state transition,
//! on the same path that handles protocol traffic, so implementations must
//! return quickly. [`ChannelSink`] is the stock implementation: it turns
//! every callback into a [`SipEvent`] on an unbounded channel.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::sdp::MediaEndpoint;

/// What to do with a ringing inbound call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallAction {
    /// Answer immediately
    Accept,
    /// Reject immediately
    Decline,
    /// Keep ringing until the application calls accept or decline
    Defer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A ringing inbound call awaiting a decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingOffer {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
}

/// Identifies a call in event callbacks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallInfo {
    pub call_id: String,
    pub remote: String,
    pub direction: Direction,
    /// Peer audio endpoint from its session description, if any
    pub remote_media: Option<MediaEndpoint>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Declined,
    RemoteCancelled,
}

pub trait EventSink: Send + Sync {
    fn on_registering(&self, _aor: &str) {}

    fn on_registration_done(&self, aor: &str, expiry_secs: u32);

    fn on_registration_failed(&self, aor: &str, reason: &str);

    fn on_incoming_call(&self, offer: &IncomingOffer) -> CallAction;

    fn on_call_established(&self, call: &CallInfo);

    fn on_call_failed(&self, call: &CallInfo, reason: &str);

    fn on_call_ended(&self, call: &CallInfo, reason: EndReason);
}

/// Serialisable form of every sink callback
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SipEvent {
    Registering {
        aor: String,
    },
    RegistrationDone {
        aor: String,
        expiry_secs: u32,
    },
    RegistrationFailed {
        aor: String,
        reason: String,
    },
    IncomingCall {
        call_id: String,
        caller: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        auto: Option<String>,
    },
    CallEstablished {
        call_id: String,
        remote: String,
        direction: Direction,
    },
    CallFailed {
        call_id: String,
        remote: String,
        reason: String,
    },
    CallEnded {
        call_id: String,
        remote: String,
        reason: EndReason,
    },
}

/// Forwards events over a channel; optionally auto-answers.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SipEvent>,
    incoming_action: CallAction,
}

impl ChannelSink {
    pub fn new(auto_answer: bool) -> (Self, mpsc::UnboundedReceiver<SipEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let incoming_action = if auto_answer {
            CallAction::Accept
        } else {
            CallAction::Defer
        };
        (Self { tx, incoming_action }, rx)
    }

    fn emit(&self, event: SipEvent) {
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_registering(&self, aor: &str) {
        self.emit(SipEvent::Registering { aor: aor.to_string() });
    }

    fn on_registration_done(&self, aor: &str, expiry_secs: u32) {
        self.emit(SipEvent::RegistrationDone {
            aor: aor.to_string(),
            expiry_secs,
        });
    }

    fn on_registration_failed(&self, aor: &str, reason: &str) {
        self.emit(SipEvent::RegistrationFailed {
            aor: aor.to_string(),
            reason: reason.to_string(),
        });
    }

    fn on_incoming_call(&self, offer: &IncomingOffer) -> CallAction {
        let auto = match self.incoming_action {
            CallAction::Accept => Some("accepted".to_string()),
            CallAction::Decline => Some("declined".to_string()),
            CallAction::Defer => None,
        };
        self.emit(SipEvent::IncomingCall {
            call_id: offer.call_id.clone(),
            caller: offer.caller.clone(),
            auto,
        });
        self.incoming_action
    }

    fn on_call_established(&self, call: &CallInfo) {
        self.emit(SipEvent::CallEstablished {
            call_id: call.call_id.clone(),
            remote: call.remote.clone(),
            direction: call.direction,
        });
    }

    fn on_call_failed(&self, call: &CallInfo, reason: &str) {
        self.emit(SipEvent::CallFailed {
            call_id: call.call_id.clone(),
            remote: call.remote.clone(),
            reason: reason.to_string(),
        });
    }

    fn on_call_ended(&self, call: &CallInfo, reason: EndReason) {
        self.emit(SipEvent::CallEnded {
            call_id: call.call_id.clone(),
            remote: call.remote.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> IncomingOffer {
        IncomingOffer {
            call_id: "c1".to_string(),
            caller: "sip:bob@example.com".to_string(),
            callee: "sip:alice@example.com".to_string(),
        }
    }

    #[test]
    fn test_channel_sink_defers_by_default() {
        let (sink, mut rx) = ChannelSink::new(false);
        assert_eq!(sink.on_incoming_call(&offer()), CallAction::Defer);
        assert_eq!(
            rx.try_recv().unwrap(),
            SipEvent::IncomingCall {
                call_id: "c1".to_string(),
                caller: "sip:bob@example.com".to_string(),
                auto: None,
            }
        );
    }

    #[test]
    fn test_channel_sink_auto_answer() {
        let (sink, _rx) = ChannelSink::new(true);
        assert_eq!(sink.on_incoming_call(&offer()), CallAction::Accept);
    }

    #[test]
    fn test_event_json_shape() {
        let event = SipEvent::CallEnded {
            call_id: "c1".to_string(),
            remote: "sip:bob@example.com".to_string(),
            reason: EndReason::RemoteHangup,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "call_ended");
        assert_eq!(json["reason"], "remote_hangup");
    }
}
