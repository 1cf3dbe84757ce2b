//! Event pump
//!
//! One task per connection owns the [`ProtocolEngine`] and the
//! [`ConnectionCore`]. It races three sources with `tokio::select!`:
//! commands from handles, engine readiness, and the core's next timer
//! deadline. After each wakeup it fires due timers, flushes outbound frames
//! into the engine and publishes the connection state.

use crate::engine::{Endpoint, ProtocolEngine};
use crate::state::{
    Completion, ConnectionCore, ConnectionInfo, ConnectionState, LinkAttached, LinkSpec,
};
use crate::types::{DeliveryOutcome, LinkHandle, Payload, SessionId, TransactionalState};
use aqueduct_core::{AmqpError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Work submitted to the pump by handles
pub(crate) enum PumpCommand {
    Open {
        reply: Completion<()>,
    },
    CreateSession {
        name: String,
        reply: Completion<SessionId>,
    },
    EndSession {
        channel: SessionId,
        reply: Completion<()>,
    },
    AttachLink {
        channel: SessionId,
        spec: LinkSpec,
        reply: Completion<LinkAttached>,
    },
    DetachLink {
        handle: LinkHandle,
        reply: Completion<()>,
    },
    Send {
        handle: LinkHandle,
        payload: Payload,
        state: Option<TransactionalState>,
        reply: Completion<DeliveryOutcome>,
    },
    Consumed {
        handle: LinkHandle,
    },
    AddCredit {
        handle: LinkHandle,
        credit: u32,
    },
    Close {
        reply: Completion<()>,
    },
    Info {
        reply: oneshot::Sender<ConnectionInfo>,
    },
}

/// Caller-side access to a running pump
#[derive(Clone)]
pub(crate) struct PumpHandle {
    commands: mpsc::UnboundedSender<PumpCommand>,
    state: watch::Receiver<ConnectionState>,
    connection_id: Arc<str>,
}

impl PumpHandle {
    pub(crate) fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Submit a command and wait for its completion.
    pub(crate) async fn request<T>(
        &self,
        build: impl FnOnce(Completion<T>) -> PumpCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| AmqpError::transport("event pump has stopped"))?;
        response
            .await
            .map_err(|_| AmqpError::transport("event pump dropped the request"))?
    }

    /// Submit a command without waiting.
    pub(crate) fn notify(&self, command: PumpCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| AmqpError::transport("event pump has stopped"))
    }

    pub(crate) async fn info(&self) -> Result<ConnectionInfo> {
        let (reply, response) = oneshot::channel();
        self.notify(PumpCommand::Info { reply })?;
        response
            .await
            .map_err(|_| AmqpError::transport("event pump dropped the request"))
    }
}

pub(crate) struct EventPump<E> {
    engine: E,
    endpoint: Endpoint,
    core: ConnectionCore,
    commands: mpsc::UnboundedReceiver<PumpCommand>,
    state: watch::Sender<ConnectionState>,
    engine_closed: bool,
}

impl<E: ProtocolEngine> EventPump<E> {
    pub(crate) fn new(engine: E, endpoint: Endpoint, core: ConnectionCore) -> (Self, PumpHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(core.state());
        let handle = PumpHandle {
            commands: commands_tx,
            state: state_rx,
            connection_id: Arc::from(core.connection_id()),
        };
        let pump = Self {
            engine,
            endpoint,
            core,
            commands,
            state,
            engine_closed: false,
        };
        (pump, handle)
    }

    /// Drive the connection until every handle is gone.
    pub(crate) async fn run(mut self) {
        debug!(connection_id = %self.core.connection_id(), "Event pump started");
        loop {
            self.flush();
            self.publish().await;

            let deadline = self.core.next_deadline();
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                ready = self.engine.ready(), if !self.engine_closed => match ready {
                    Ok(()) => {
                        let now = Instant::now();
                        for event in self.engine.pump_once() {
                            self.core.handle_event(event, now);
                        }
                    }
                    Err(err) => self.core.fail(err),
                },
                () = timer => {}
            }

            self.core.poll_timers(Instant::now());
        }

        if !self.engine_closed {
            let _ = self.engine.close().await;
        }
        debug!(connection_id = %self.core.connection_id(), "Event pump stopped");
    }

    async fn handle_command(&mut self, command: PumpCommand) {
        let now = Instant::now();
        match command {
            PumpCommand::Open { reply } => {
                if self.core.state() == ConnectionState::Uninitialized {
                    info!(
                        connection_id = %self.core.connection_id(),
                        host = %self.endpoint.host,
                        port = self.endpoint.port,
                        "Opening transport"
                    );
                    if let Err(err) = self.engine.open(&self.endpoint).await {
                        self.core.fail(err.clone());
                        let _ = reply.send(Err(err));
                        return;
                    }
                }
                self.core.open(reply, Instant::now());
            }
            PumpCommand::CreateSession { name, reply } => self.core.create_session(&name, reply),
            PumpCommand::EndSession { channel, reply } => self.core.end_session(channel, reply),
            PumpCommand::AttachLink {
                channel,
                spec,
                reply,
            } => self.core.attach_link(channel, spec, reply),
            PumpCommand::DetachLink { handle, reply } => self.core.detach_link(handle, reply),
            PumpCommand::Send {
                handle,
                payload,
                state,
                reply,
            } => self.core.send(handle, payload, state, reply),
            PumpCommand::Consumed { handle } => self.core.consumed(handle),
            PumpCommand::AddCredit { handle, credit } => self.core.add_credit(handle, credit),
            PumpCommand::Close { reply } => self.core.close(reply, now),
            PumpCommand::Info { reply } => {
                let _ = reply.send(self.core.info());
            }
        }
    }

    fn flush(&mut self) {
        let frames = self.core.drain_outbound(Instant::now());
        if self.engine_closed {
            return;
        }
        for frame in frames {
            if let Err(err) = self.engine.submit(frame) {
                self.core.fail(err);
                return;
            }
        }
    }

    async fn publish(&mut self) {
        let state = self.core.state();
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });

        if state.is_terminal() && !self.engine_closed {
            self.engine_closed = true;
            if let Err(err) = self.engine.close().await {
                debug!(
                    connection_id = %self.core.connection_id(),
                    error = %err,
                    "Engine close failed"
                );
            }
        }
    }
}
