//! Minimal SIP user agent: registration, one call at a time, and an
//! accept/decline prompt for incoming calls.
//!
//! [`UserAgent`] is the protocol core and is driven by explicit calls;
//! [`Softphone`] runs it against a live [`UdpTransport`].

pub mod agent;
pub mod config;
pub mod digest;
pub mod error;
pub mod events;
pub mod identity;
pub mod message;
pub mod phone;
pub mod registration;
pub mod sdp;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use agent::{AgentConfig, UserAgent, CALL_TIMEOUT};
pub use config::Settings;
pub use error::{Result, UaError};
pub use events::{CallAction, CallInfo, ChannelSink, Direction, EndReason, EventSink, IncomingOffer, SipEvent};
pub use identity::Identity;
pub use message::{Method, SipMessage};
pub use phone::Softphone;
pub use registration::RegistrationState;
pub use session::CallState;
pub use transport::{Transport, UdpTransport};
