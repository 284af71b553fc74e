//! Long-running handle that drives a [`UserAgent`] from a transport.
//!
//! The agent sits behind one `tokio::sync::Mutex`; a background task
//! feeds it inbound messages and fires its deadlines. Application calls
//! take the same lock, so nothing is ever applied concurrently.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::agent::UserAgent;
use crate::error::{Result, UaError};
use crate::events::{CallInfo, IncomingOffer};
use crate::registration::RegistrationState;
use crate::session::CallState;
use crate::transport::Incoming;

pub struct Softphone {
    agent: Arc<Mutex<UserAgent>>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Softphone {
    /// Starts the receive/timer task. Must be called inside a tokio runtime.
    pub fn spawn(agent: UserAgent, incoming: BoxStream<'static, Incoming>) -> Self {
        let agent = Arc::new(Mutex::new(agent));
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(run(agent.clone(), wake.clone(), incoming));
        Self { agent, wake, task }
    }

    pub async fn register(&self) {
        self.agent.lock().await.register(Instant::now()).await;
        self.wake.notify_one();
    }

    pub async fn unregister(&self) {
        self.agent.lock().await.unregister(Instant::now()).await;
        self.wake.notify_one();
    }

    pub async fn originate(&self, address: &str) -> Result<()> {
        let result = self.agent.lock().await.originate(address, Instant::now()).await;
        self.wake.notify_one();
        result
    }

    pub async fn accept_incoming(&self) -> Result<()> {
        let result = self.agent.lock().await.accept_incoming().await;
        self.wake.notify_one();
        result
    }

    pub async fn decline_incoming(&self) -> Result<()> {
        let result = self.agent.lock().await.decline_incoming().await;
        self.wake.notify_one();
        result
    }

    pub async fn end_call(&self) -> Result<()> {
        let result = self.agent.lock().await.end_call().await;
        self.wake.notify_one();
        result
    }

    pub async fn registration_state(&self) -> RegistrationState {
        self.agent.lock().await.registration_state().clone()
    }

    pub async fn call_state(&self) -> Option<CallState> {
        self.agent.lock().await.call_state()
    }

    pub async fn current_call(&self) -> Option<CallInfo> {
        self.agent.lock().await.current_call()
    }

    pub async fn pending_offer(&self) -> Option<IncomingOffer> {
        self.agent.lock().await.pending_offer()
    }

    /// Hangs up any live call, unregisters, and stops the background task.
    pub async fn shutdown(self) {
        info!("shutting down SIP user agent");
        {
            let mut agent = self.agent.lock().await;
            if agent.call_state().is_some_and(|state| !state.is_terminal()) {
                if let Err(e) = agent.end_call().await {
                    warn!(error = %e, "failed to end call during shutdown");
                }
            }
            if agent.registration_state() != &RegistrationState::Unregistered {
                agent.unregister(Instant::now()).await;
            }
        }
        self.task.abort();
    }
}

impl Drop for Softphone {
    // the task holds the agent and the socket stream
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(agent: Arc<Mutex<UserAgent>>, wake: Arc<Notify>, mut incoming: BoxStream<'static, Incoming>) {
    loop {
        let deadline = agent.lock().await.next_deadline();
        let timer = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            item = incoming.next() => match item {
                Some(Ok((message, from))) => {
                    agent.lock().await.handle_message(message, from, Instant::now()).await;
                }
                Some(Err(UaError::Parse { message })) => {
                    debug!(%message, "dropping undecodable datagram");
                }
                Some(Err(e)) => warn!(error = %e, "receive failed"),
                None => {
                    info!("inbound stream closed, stopping receive loop");
                    break;
                }
            },
            _ = timer => agent.lock().await.handle_timeout(Instant::now()).await,
            // an action may have armed an earlier deadline
            _ = wake.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use futures::channel::mpsc;

    use super::*;
    use crate::events::SipEvent;
    use crate::message::{Method, SipMessage};
    use crate::testing::{inbound_invite, Harness};

    fn phone(h: &Harness) -> (Softphone, mpsc::UnboundedSender<(SipMessage, SocketAddr)>) {
        let (tx, rx) = mpsc::unbounded();
        let agent = UserAgent::new(h.config.clone(), h.transport.clone(), h.sink.clone());
        (Softphone::spawn(agent, rx.map(Ok).boxed()), tx)
    }

    async fn wait_for(phone: &Softphone, state: CallState) {
        for _ in 0..100 {
            if phone.call_state().await == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("call never reached {:?}", state);
    }

    #[tokio::test]
    async fn test_inbound_invite_rings_and_is_answered() {
        let h = Harness::new();
        let (phone, tx) = phone(&h);
        let bob: SocketAddr = "10.0.0.9:5060".parse().unwrap();

        tx.unbounded_send((inbound_invite("in-1", "sip:bob@example.com"), bob))
            .unwrap();
        wait_for(&phone, CallState::Ringing).await;
        assert_eq!(phone.pending_offer().await.unwrap().call_id, "in-1");

        phone.accept_incoming().await.unwrap();
        assert_eq!(phone.call_state().await, Some(CallState::Established));
        assert_eq!(h.transport.last_sent().status(), Some(200));
        phone.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_task_fires_call_timeout() {
        let mut h = Harness::new();
        h.config.call_timeout = Duration::from_millis(50);
        let (phone, _tx) = phone(&h);

        phone.originate("bob").await.unwrap();
        wait_for(&phone, CallState::Failed).await;
        assert_eq!(h.transport.last_sent().method(), Some(&Method::Cancel));
        assert_eq!(h.sink.count(|e| matches!(e, SipEvent::CallFailed { reason, .. } if reason == "timeout")), 1);
        phone.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_stops_background_task() {
        let h = Harness::new();
        let (phone, tx) = phone(&h);
        let agent = Arc::downgrade(&phone.agent);

        drop(phone);
        for _ in 0..100 {
            if agent.upgrade().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(agent.upgrade().is_none());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_hangs_up_and_unregisters() {
        let h = Harness::new();
        let (phone, _tx) = phone(&h);

        phone.register().await;
        phone.originate("bob").await.unwrap();
        phone.shutdown().await;

        let methods: Vec<_> = h
            .transport
            .sent()
            .iter()
            .filter_map(|(m, _)| m.method().cloned())
            .collect();
        assert_eq!(
            methods,
            vec![Method::Register, Method::Invite, Method::Cancel, Method::Register]
        );
        assert_eq!(h.transport.last_sent().header("Expires"), Some("0"));
    }
}
