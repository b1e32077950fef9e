//! Client side of the tunnel/relay protocol.
//!
//! A private node opens one long-lived bidirectional stream to a chosen
//! public node, announces itself with an `Establish` frame, and from then on
//! multiplexes any number of outstanding method calls over the stream,
//! correlated by snowflake IDs. The supervisor is an explicit state machine:
//!
//! ```text
//! Connecting -> Established -> Draining -> Connecting   (recoverable error)
//!      \------------------------------> Closed          (cancelled)
//! ```
//!
//! All writes funnel through one outbound channel, so the stream never sees
//! interleaved frames; the inbound half only dispatches.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;

use crate::error::{FleetError, Result};
use crate::net::frame::{self, Establish, RelayFrame};
use crate::promise::{Promise, PromiseEvent};
use crate::proto::fleet_daemon_client::FleetDaemonClient;
use crate::proto::{FrameType, TunnelFrame};

const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(15);
const OUTBOUND_QUEUE: usize = 64;

/// Answers method calls that arrive over the tunnel addressed to this node.
#[tonic::async_trait]
pub trait LocalDispatcher: Send + Sync {
    async fn dispatch(&self, node: &str, method: &str, args: &[String]) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Established,
    Draining,
    Closed,
}

pub struct Tunnel {
    name: String,
    client: FleetDaemonClient<Channel>,
    promise: Arc<Promise>,
    dispatcher: Arc<dyn LocalDispatcher>,
    state: Mutex<TunnelState>,
}

impl Tunnel {
    pub fn new(
        name: impl Into<String>,
        client: FleetDaemonClient<Channel>,
        promise: Arc<Promise>,
        dispatcher: Arc<dyn LocalDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            promise,
            dispatcher,
            state: Mutex::new(TunnelState::Connecting),
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock().expect("tunnel state lock poisoned")
    }

    fn set_state(&self, state: TunnelState) {
        tracing::debug!(name = %self.name, ?state, "tunnel state");
        *self.state.lock().expect("tunnel state lock poisoned") = state;
    }

    /// Supervise the tunnel until cancelled. Recoverable failures (stream or
    /// transport errors) drain and reconnect with backoff; cancellation is
    /// the only clean exit.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<PromiseEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut backoff = RECONNECT_BACKOFF;
        loop {
            if shutdown.is_cancelled() {
                self.set_state(TunnelState::Closed);
                tracing::info!(name = %self.name, "tunnel closed");
                return Ok(());
            }
            self.set_state(TunnelState::Connecting);
            match self.session(&mut events, &shutdown).await {
                Ok(()) => {
                    self.set_state(TunnelState::Closed);
                    tracing::info!(name = %self.name, "tunnel closed");
                    return Ok(());
                }
                Err(err) if recoverable(&err) => {
                    self.set_state(TunnelState::Draining);
                    tracing::warn!(name = %self.name, %err, backoff = ?backoff, "tunnel lost, reconnecting");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                }
                Err(err) => {
                    self.set_state(TunnelState::Closed);
                    tracing::error!(name = %self.name, %err, "tunnel failed");
                    return Err(err);
                }
            }
        }
    }

    /// One connected session: establish, then pump both directions until the
    /// stream dies or we are cancelled.
    async fn session(
        &self,
        events: &mut mpsc::Receiver<PromiseEvent>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<TunnelFrame>(OUTBOUND_QUEUE);
        let mut inbound = self
            .client
            .clone()
            .tunnel(Request::new(ReceiverStream::new(rx)))
            .await?
            .into_inner();

        let establish = RelayFrame::Establish(Establish {
            name: self.name.clone(),
            delay: 0,
        });
        send(&tx, establish.into_tunnel_frame(self.promise.next_id())).await?;
        self.set_state(TunnelState::Established);
        tracing::info!(name = %self.name, "tunnel established");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(ev) => {
                        tracing::debug!(id = ev.id, "relay outbound call");
                        send(&tx, ev.frame.into_tunnel_frame(ev.id)).await?;
                    }
                    // The daemon dropped its event queue; nothing left to carry.
                    None => return Ok(()),
                },
                frame = inbound.message() => match frame? {
                    Some(f) => self.handle_frame(f, &tx),
                    None => {
                        return Err(FleetError::Grpc(tonic::Status::unavailable(
                            "tunnel stream ended by relay",
                        )))
                    }
                },
            }
        }
    }

    fn handle_frame(&self, f: TunnelFrame, tx: &mpsc::Sender<TunnelFrame>) {
        match FrameType::try_from(f.r#type).unwrap_or(FrameType::Unknown) {
            FrameType::MethodCall => {
                let call = match frame::parse_method_call(&f.body) {
                    Ok(call) => call,
                    Err(err) => {
                        tracing::warn!(id = f.id, %err, "malformed method call frame");
                        return;
                    }
                };
                tracing::info!(id = f.id, node = %call.node, method = %call.method, "inbound tunnel call");
                let dispatcher = self.dispatcher.clone();
                let tx = tx.clone();
                // Dispatch off the pump loop so a slow method cannot stall
                // the stream.
                tokio::spawn(async move {
                    let (method, args) = call.parts();
                    let body = match dispatcher.dispatch(&call.node, method, &args).await {
                        Ok(body) => body,
                        Err(err) => {
                            tracing::warn!(id = f.id, %err, "tunnel dispatch failed");
                            format!("error: {err}")
                        }
                    };
                    if tx.send(frame::method_return(f.id, body)).await.is_err() {
                        tracing::debug!(id = f.id, "tunnel gone before answer");
                    }
                });
            }
            FrameType::MethodReturn => {
                tracing::debug!(id = f.id, "inbound tunnel return");
                self.promise.store(f.id, f.body);
            }
            FrameType::Establish | FrameType::Unknown => {
                tracing::debug!(id = f.id, kind = f.r#type, "ignoring unexpected frame");
            }
        }
    }
}

async fn send(tx: &mpsc::Sender<TunnelFrame>, frame: TunnelFrame) -> Result<()> {
    tx.send(frame).await.map_err(|_| {
        FleetError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "tunnel outbound queue closed",
        ))
    })
}

/// Transient network trouble reconnects; everything else is fatal.
fn recoverable(err: &FleetError) -> bool {
    matches!(
        err,
        FleetError::Grpc(_) | FleetError::Transport(_) | FleetError::Io(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_errors_are_recoverable() {
        assert!(recoverable(&FleetError::Grpc(tonic::Status::unavailable(
            "gone"
        ))));
        assert!(recoverable(&FleetError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe"
        ))));
    }

    #[test]
    fn logical_errors_are_fatal() {
        assert!(!recoverable(&FleetError::DeadlineExceeded));
        assert!(!recoverable(&FleetError::CallFailed));
        assert!(!recoverable(&FleetError::InvalidMethod("x".into())));
    }
}
