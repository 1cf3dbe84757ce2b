//! Connection state machine and the session/link arenas it owns

use super::link::{LinkEntry, LinkInfo, LinkSpec, LinkState};
use super::session::{SessionEntry, SessionInfo, SessionState};
use super::{complete, Completion, LinkAttached};
use crate::engine::{EngineEvent, Frame};
use crate::types::{
    AmqpMessage, DeliveryOutcome, LinkHandle, Payload, SessionId, TransactionalState,
};
use aqueduct_core::config::{NAME_KEY, VERSION_KEY};
use aqueduct_core::{AmqpError, ConnectionOptions, ErrorCondition, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, nothing sent
    Uninitialized,
    /// Open sent, waiting for the peer
    Opening,
    /// Open on both ends
    Active,
    /// Close cascade in progress
    Closing,
    /// Closed on both ends, or force-closed
    Closed,
    /// Unrecoverable transport failure
    Failed,
}

impl ConnectionState {
    /// Whether the connection can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Diagnostic snapshot of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Connection id
    pub connection_id: String,
    /// Current state
    pub state: ConnectionState,
    /// Idle timeout advertised by the peer
    pub remote_idle_timeout: Option<Duration>,
    /// Sessions in channel order
    pub sessions: Vec<SessionInfo>,
    /// Links in handle order
    pub links: Vec<LinkInfo>,
}

/// Sans-IO connection core
pub struct ConnectionCore {
    options: Arc<ConnectionOptions>,
    state: ConnectionState,
    sessions: BTreeMap<SessionId, SessionEntry>,
    session_names: HashMap<String, SessionId>,
    links: BTreeMap<LinkHandle, LinkEntry>,
    next_channel: u16,
    next_handle: u32,
    outbound: Vec<Frame>,
    open_waiters: Vec<Completion<()>>,
    close_waiters: Vec<Completion<()>>,
    close_deadline: Option<Instant>,
    close_sent: bool,
    remote_idle_timeout: Option<Duration>,
    last_sent: Instant,
    last_received: Instant,
    failure: Option<AmqpError>,
}

impl ConnectionCore {
    /// Create an unopened connection
    pub fn new(options: Arc<ConnectionOptions>, now: Instant) -> Self {
        Self {
            options,
            state: ConnectionState::Uninitialized,
            sessions: BTreeMap::new(),
            session_names: HashMap::new(),
            links: BTreeMap::new(),
            next_channel: 0,
            next_handle: 0,
            outbound: Vec::new(),
            open_waiters: Vec::new(),
            close_waiters: Vec::new(),
            close_deadline: None,
            close_sent: false,
            remote_idle_timeout: None,
            last_sent: now,
            last_received: now,
            failure: None,
        }
    }

    /// Connection id
    pub fn connection_id(&self) -> &str {
        self.options.connection_id()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            ConnectionState::Active => Ok(()),
            ConnectionState::Failed => Err(self
                .failure
                .clone()
                .unwrap_or_else(|| AmqpError::transport("connection failed"))),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(AmqpError::transport("connection is closed"))
            }
            ConnectionState::Uninitialized | ConnectionState::Opening => {
                Err(AmqpError::transport("connection is not open"))
            }
        }
    }

    /// Send the open frame, or join an open already in flight.
    pub fn open(&mut self, waiter: Completion<()>, now: Instant) {
        match self.state {
            ConnectionState::Uninitialized => {
                self.state = ConnectionState::Opening;
                self.last_received = now;
                self.open_waiters.push(waiter);

                let metadata = self.options.client_metadata();
                let mut properties = BTreeMap::new();
                properties.insert(NAME_KEY.to_string(), metadata.product.clone());
                properties.insert(VERSION_KEY.to_string(), metadata.version.clone());
                properties.insert("user-agent".to_string(), metadata.user_agent());

                self.outbound.push(Frame::Open {
                    container_id: self.options.connection_id().to_string(),
                    hostname: self.options.hostname().to_string(),
                    idle_timeout: self.options.idle_timeout(),
                    properties,
                });
                debug!(connection_id = %self.connection_id(), "Open sent");
            }
            ConnectionState::Opening => self.open_waiters.push(waiter),
            _ => complete(waiter, self.ensure_active()),
        }
    }

    /// Begin a session called `name`, reusing a mapped or in-flight one.
    pub fn create_session(&mut self, name: &str, waiter: Completion<SessionId>) {
        if let Err(err) = self.ensure_active() {
            complete(waiter, Err(err));
            return;
        }

        if let Some(channel) = self.session_names.get(name).copied() {
            match self.sessions.get(&channel).map(|session| session.state) {
                Some(SessionState::EndSent) => {
                    // the ending session finishes under its channel, unnamed
                    self.session_names.remove(name);
                }
                Some(state) if !state.is_terminal() => {
                    if let Some(session) = self.sessions.get_mut(&channel) {
                        session.join(waiter);
                    }
                    return;
                }
                _ => self.discard_session(channel),
            }
        }

        let channel = self.allocate_channel();
        let mut session = SessionEntry::new(name.to_string(), channel);
        session.begin(waiter, &mut self.outbound);
        debug!(connection_id = %self.connection_id(), session = name, %channel, "Begin sent");
        self.sessions.insert(channel, session);
        self.session_names.insert(name.to_string(), channel);
    }

    fn discard_session(&mut self, channel: SessionId) {
        if let Some(session) = self.sessions.remove(&channel) {
            for handle in &session.links {
                self.links.remove(handle);
            }
            self.session_names.remove(&session.name);
        }
    }

    /// Drop a terminal link from the arena and from its session.
    fn reap_link(&mut self, handle: LinkHandle) {
        let Some(link) = self.links.remove(&handle) else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(&link.session) {
            session.links.remove(&handle);
        }
        debug!(link = %link.name(), %handle, state = ?link.state, "Link released");
    }

    fn allocate_channel(&mut self) -> SessionId {
        loop {
            let channel = SessionId(self.next_channel);
            self.next_channel = self.next_channel.wrapping_add(1);
            if !self.sessions.contains_key(&channel) {
                return channel;
            }
        }
    }

    fn allocate_handle(&mut self) -> LinkHandle {
        loop {
            let handle = LinkHandle(self.next_handle);
            self.next_handle = self.next_handle.wrapping_add(1);
            if !self.links.contains_key(&handle) {
                return handle;
            }
        }
    }

    /// End a session; its links are detached first.
    pub fn end_session(&mut self, channel: SessionId, waiter: Completion<()>) {
        let Some(session) = self.sessions.get(&channel) else {
            complete(waiter, Ok(()));
            return;
        };
        let handles: Vec<LinkHandle> = session.links.iter().copied().collect();
        for handle in handles {
            if let Some(link) = self.links.get_mut(&handle) {
                link.begin_detach(None, &mut self.outbound);
            }
        }
        if let Some(session) = self.sessions.get_mut(&channel) {
            session.begin_end(Some(waiter), &mut self.outbound);
        }
    }

    /// Attach a link on a mapped session.
    pub fn attach_link(
        &mut self,
        channel: SessionId,
        spec: LinkSpec,
        waiter: Completion<LinkAttached>,
    ) {
        let Some(session) = self.sessions.get(&channel) else {
            complete(
                waiter,
                Err(AmqpError::link_creation(format!("unknown session {channel}"))),
            );
            return;
        };
        if session.state != SessionState::Mapped {
            complete(
                waiter,
                Err(AmqpError::link_creation(format!(
                    "session '{}' is not mapped ({:?})",
                    session.name, session.state
                ))),
            );
            return;
        }
        let in_use = session.links.iter().any(|handle| {
            self.links
                .get(handle)
                .is_some_and(|link| link.name() == spec.name && !link.state.is_terminal())
        });
        if in_use {
            complete(
                waiter,
                Err(AmqpError::link_creation(format!(
                    "link name '{}' is already in use on session '{}'",
                    spec.name, session.name
                ))),
            );
            return;
        }

        let handle = self.allocate_handle();
        debug!(
            connection_id = %self.connection_id(),
            session = %channel,
            link = %spec.name,
            %handle,
            "Attach sent"
        );
        let mut link = LinkEntry::new(handle, channel, spec);
        link.begin_attach(waiter, &mut self.outbound);
        self.links.insert(handle, link);
        if let Some(session) = self.sessions.get_mut(&channel) {
            session.links.insert(handle);
        }
    }

    /// Detach and close a link.
    ///
    /// The link leaves the arena once it is terminal; a link that already
    /// failed or was detached by the peer is released right away.
    pub fn detach_link(&mut self, handle: LinkHandle, waiter: Completion<()>) {
        match self.links.get_mut(&handle) {
            Some(link) => {
                link.begin_detach(Some(waiter), &mut self.outbound);
                if link.state.is_terminal() {
                    self.reap_link(handle);
                }
            }
            None => complete(waiter, Ok(())),
        }
        self.maybe_send_close();
    }

    /// Queue a transfer on a sending link.
    pub fn send(
        &mut self,
        handle: LinkHandle,
        payload: Payload,
        state: Option<TransactionalState>,
        reply: Completion<DeliveryOutcome>,
    ) {
        if let Err(err) = self.ensure_active() {
            complete(reply, Err(err));
            return;
        }
        match self.links.get_mut(&handle) {
            Some(link) => link.enqueue_send(payload, state, reply, &mut self.outbound),
            None => complete(
                reply,
                Err(AmqpError::link(
                    ErrorCondition::NotFound,
                    format!("unknown link {handle}"),
                )),
            ),
        }
    }

    /// The consumer of a receiving link took one message.
    pub fn consumed(&mut self, handle: LinkHandle) {
        if let Some(link) = self.links.get_mut(&handle) {
            link.on_consumed(&mut self.outbound);
        }
    }

    /// Grant additional credit on a receiving link.
    pub fn add_credit(&mut self, handle: LinkHandle, credit: u32) {
        if let Some(link) = self.links.get_mut(&handle) {
            link.add_credit(credit, &mut self.outbound);
        }
    }

    /// Start the close cascade.
    pub fn close(&mut self, waiter: Completion<()>, now: Instant) {
        match self.state {
            ConnectionState::Closed | ConnectionState::Failed => complete(waiter, Ok(())),
            ConnectionState::Uninitialized => {
                self.state = ConnectionState::Closed;
                complete(waiter, Ok(()));
            }
            ConnectionState::Closing => self.close_waiters.push(waiter),
            ConnectionState::Opening | ConnectionState::Active => {
                info!(connection_id = %self.connection_id(), "Closing connection");
                self.state = ConnectionState::Closing;
                self.close_deadline = Some(now + self.options.shutdown_timeout());
                self.close_waiters.push(waiter);

                let aborted = AmqpError::transport("connection closed while opening");
                for waiter in self.open_waiters.drain(..) {
                    complete(waiter, Err(aborted.clone()));
                }
                for link in self.links.values_mut() {
                    link.begin_detach(None, &mut self.outbound);
                }
                for session in self.sessions.values_mut() {
                    session.begin_end(None, &mut self.outbound);
                }
                self.maybe_send_close();
            }
        }
    }

    fn children_settled(&self) -> bool {
        self.sessions
            .values()
            .all(|session| session.state.is_terminal() || session.state == SessionState::Unmapped)
            && self.links.values().all(|link| link.state.is_terminal())
    }

    fn maybe_send_close(&mut self) {
        if self.state == ConnectionState::Closing && !self.close_sent && self.children_settled() {
            debug!(connection_id = %self.connection_id(), "Children settled, close sent");
            self.outbound.push(Frame::Close);
            self.close_sent = true;
        }
    }

    fn force_close(&mut self) {
        let mut stragglers: Vec<String> = self
            .links
            .values()
            .filter(|link| !link.state.is_terminal())
            .map(|link| format!("link '{}'", link.name()))
            .collect();
        stragglers.extend(
            self.sessions
                .values()
                .filter(|session| !session.state.is_terminal())
                .map(|session| format!("session '{}'", session.name)),
        );
        if self.close_sent {
            stragglers.push("connection close".to_string());
        }
        warn!(
            connection_id = %self.connection_id(),
            timeout_ms = self.options.shutdown_timeout().as_millis() as u64,
            stragglers = ?stragglers,
            "Shutdown timeout elapsed, forcing close"
        );

        let cause = AmqpError::cancelled("connection force-closed");
        for link in self.links.values_mut() {
            link.force_close(&cause);
        }
        for session in self.sessions.values_mut() {
            session.force_close(&cause);
        }
        if !self.close_sent {
            self.outbound.push(Frame::Close);
            self.close_sent = true;
        }
        self.finish_close();
    }

    fn finish_close(&mut self) {
        self.state = ConnectionState::Closed;
        self.close_deadline = None;
        for waiter in self.close_waiters.drain(..) {
            complete(waiter, Ok(()));
        }
        info!(connection_id = %self.connection_id(), "Connection closed");
    }

    /// Move to `Failed`, failing every waiter and child.
    pub fn fail(&mut self, cause: AmqpError) {
        if self.state.is_terminal() {
            return;
        }
        error!(connection_id = %self.connection_id(), error = %cause, "Connection failed");
        self.state = ConnectionState::Failed;
        self.close_deadline = None;
        self.outbound.clear();

        for waiter in self.open_waiters.drain(..) {
            complete(waiter, Err(cause.clone()));
        }
        for waiter in self.close_waiters.drain(..) {
            complete(waiter, Err(cause.clone()));
        }
        for link in self.links.values_mut() {
            link.fail(&cause);
        }
        for session in self.sessions.values_mut() {
            session.fail(&cause);
        }
        self.failure = Some(cause);
    }

    /// Apply one engine event.
    pub fn handle_event(&mut self, event: EngineEvent, now: Instant) {
        self.last_received = now;
        match event {
            EngineEvent::Opened {
                remote_idle_timeout,
            } => self.on_opened(remote_idle_timeout),
            EngineEvent::Begun { channel } => match self.sessions.get_mut(&channel) {
                Some(session) => session.on_begun(),
                None => debug!(%channel, "Begin for unknown session"),
            },
            EngineEvent::Attached { handle } => match self.links.get_mut(&handle) {
                Some(link) => link.on_attached(&mut self.outbound),
                None => debug!(%handle, "Attach for unknown link"),
            },
            EngineEvent::IncomingAttach {
                channel,
                name,
                role,
            } => self.on_incoming_attach(channel, name, role),
            EngineEvent::Flow {
                handle,
                link_credit,
            } => {
                if let Some(link) = self.links.get_mut(&handle) {
                    link.on_flow(link_credit, &mut self.outbound);
                }
            }
            EngineEvent::Transfer { handle, message } => self.on_transfer(handle, message),
            EngineEvent::Disposition {
                handle,
                tag,
                outcome,
            } => match self.links.get_mut(&handle) {
                Some(link) => link.on_disposition(&tag, outcome),
                None => debug!(%handle, %tag, "Disposition for unknown link"),
            },
            EngineEvent::Detached { handle, error } => {
                match self.links.get_mut(&handle) {
                    Some(link) => {
                        let requested = link.state == LinkState::DetachSent;
                        link.on_detached(error, &mut self.outbound);
                        if requested {
                            self.reap_link(handle);
                        }
                    }
                    None => debug!(%handle, "Detach for unknown link"),
                }
                self.maybe_send_close();
            }
            EngineEvent::Ended { channel, error } => {
                self.on_ended(channel, error);
                self.maybe_send_close();
            }
            EngineEvent::Closed { error } => self.on_closed(error),
            EngineEvent::Heartbeat => {}
            EngineEvent::TransportError { message } => self.fail(AmqpError::transport(message)),
        }
    }

    fn on_opened(&mut self, remote_idle_timeout: Option<Duration>) {
        if self.state != ConnectionState::Opening {
            debug!(state = ?self.state, "Ignoring open outside of opening");
            return;
        }
        self.state = ConnectionState::Active;
        self.remote_idle_timeout = remote_idle_timeout.filter(|timeout| !timeout.is_zero());
        info!(
            connection_id = %self.connection_id(),
            host = %self.options.hostname(),
            remote_idle_timeout = ?self.remote_idle_timeout,
            "Connection active"
        );
        for waiter in self.open_waiters.drain(..) {
            complete(waiter, Ok(()));
        }
    }

    fn on_incoming_attach(&mut self, channel: SessionId, name: String, role: crate::types::Role) {
        let handle = self.allocate_handle();
        let Some(session) = self.sessions.get_mut(&channel) else {
            debug!(%channel, link = %name, "Incoming attach on unknown session");
            return;
        };
        info!(
            connection_id = %self.options.connection_id(),
            session = %session.name,
            link = %name,
            ?role,
            "Refusing peer-initiated link"
        );
        session.incoming_link_requests.push(name);
        self.outbound.push(Frame::Detach {
            channel,
            handle,
            closed: true,
            error: Some(ErrorCondition::NotAllowed),
        });
    }

    fn on_transfer(&mut self, handle: LinkHandle, message: AmqpMessage) {
        match self.links.get_mut(&handle) {
            Some(link) => link.on_transfer(message),
            None => debug!(%handle, "Transfer for unknown link"),
        }
    }

    fn on_ended(&mut self, channel: SessionId, error: Option<(ErrorCondition, String)>) {
        let failed = error.is_some();
        let cause = match error {
            Some((condition, description)) => {
                warn!(%channel, %condition, %description, "Session ended by peer with error");
                AmqpError::link(condition, description)
            }
            None => AmqpError::cancelled(format!("session {channel} ended")),
        };

        let Some(session) = self.sessions.get_mut(&channel) else {
            debug!(%channel, "End for unknown session");
            return;
        };
        let requested = session.state == SessionState::EndSent;
        let unsolicited = session.on_ended(&cause, failed);
        let handles: Vec<LinkHandle> = session.links.iter().copied().collect();
        let replaced = self.session_names.get(&session.name) != Some(&channel);
        if unsolicited {
            self.outbound.push(Frame::End { channel });
        }
        for handle in &handles {
            if let Some(link) = self.links.get_mut(handle) {
                if failed {
                    link.fail(&cause);
                } else {
                    link.force_close(&cause);
                }
            }
        }

        if requested || replaced {
            for handle in handles {
                self.reap_link(handle);
            }
        }
        if replaced {
            debug!(%channel, "Replaced session ended");
            self.sessions.remove(&channel);
        }
    }

    fn on_closed(&mut self, error: Option<(ErrorCondition, String)>) {
        match (self.state, error) {
            (ConnectionState::Closing, None) => self.finish_close(),
            (_, Some((condition, description))) => self.fail(AmqpError::transport(format!(
                "connection closed by peer [{condition}]: {description}"
            ))),
            (state, None) if !state.is_terminal() => {
                self.outbound.push(Frame::Close);
                self.fail(AmqpError::transport("connection closed by peer"));
            }
            _ => {}
        }
    }

    /// Fire keep-alive, idle and shutdown timers that are due.
    pub fn poll_timers(&mut self, now: Instant) {
        if matches!(
            self.state,
            ConnectionState::Opening | ConnectionState::Active | ConnectionState::Closing
        ) {
            let idle = self.options.idle_timeout();
            if now.saturating_duration_since(self.last_received) >= idle {
                self.fail(AmqpError::transport(format!(
                    "no frames received for {idle:?}"
                )));
                return;
            }
        }

        if let Some(deadline) = self.close_deadline {
            if self.state == ConnectionState::Closing && now >= deadline {
                self.force_close();
                return;
            }
        }

        if let Some(interval) = self.keepalive_interval() {
            if self.outbound.is_empty() && now >= self.last_sent + interval {
                self.outbound.push(Frame::Empty);
            }
        }
    }

    fn keepalive_interval(&self) -> Option<Duration> {
        match self.state {
            ConnectionState::Active | ConnectionState::Closing => {
                self.remote_idle_timeout.map(|timeout| timeout / 2)
            }
            _ => None,
        }
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        let idle = matches!(
            self.state,
            ConnectionState::Opening | ConnectionState::Active | ConnectionState::Closing
        )
        .then(|| self.last_received + self.options.idle_timeout());
        let keepalive = self
            .keepalive_interval()
            .map(|interval| self.last_sent + interval);
        let shutdown = self
            .close_deadline
            .filter(|_| self.state == ConnectionState::Closing);

        [idle, keepalive, shutdown].into_iter().flatten().min()
    }

    /// Take the frames queued since the last call.
    pub fn drain_outbound(&mut self, now: Instant) -> Vec<Frame> {
        if !self.outbound.is_empty() {
            self.last_sent = now;
        }
        std::mem::take(&mut self.outbound)
    }

    /// Diagnostic snapshot
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.connection_id().to_string(),
            state: self.state,
            remote_idle_timeout: self.remote_idle_timeout,
            sessions: self
                .sessions
                .values()
                .map(|session| SessionInfo {
                    name: session.name.clone(),
                    channel: session.channel,
                    state: session.state,
                    links: session
                        .links
                        .iter()
                        .filter_map(|handle| self.links.get(handle))
                        .map(|link| link.name().to_string())
                        .collect(),
                    incoming_link_requests: session.incoming_link_requests.clone(),
                })
                .collect(),
            links: self.links.values().map(LinkEntry::info).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, SenderSettleMode, Target};
    use aqueduct_core::{AccessToken, CbsAuthorizationType, TokenCredential};
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    struct NoCredential;

    #[async_trait]
    impl TokenCredential for NoCredential {
        async fn get_token(&self, _scopes: &[String]) -> Result<AccessToken> {
            Err(AmqpError::configuration("not used"))
        }
    }

    fn options() -> Arc<ConnectionOptions> {
        Arc::new(
            ConnectionOptions::builder()
                .connection_id("test-connection")
                .fully_qualified_namespace("contoso.servicebus.windows.net")
                .credential(Arc::new(NoCredential))
                .authorization_type(CbsAuthorizationType::JsonWebToken)
                .authorization_scope("scope")
                .shutdown_timeout(Duration::from_secs(5))
                .idle_timeout(Duration::from_secs(30))
                .build()
                .unwrap(),
        )
    }

    fn active_core(now: Instant) -> ConnectionCore {
        let mut core = ConnectionCore::new(options(), now);
        let (tx, _rx) = oneshot::channel();
        core.open(tx, now);
        core.handle_event(
            EngineEvent::Opened {
                remote_idle_timeout: Some(Duration::from_secs(10)),
            },
            now,
        );
        core.drain_outbound(now);
        core
    }

    fn mapped_session(core: &mut ConnectionCore, name: &str, now: Instant) -> SessionId {
        let (tx, mut rx) = oneshot::channel();
        core.create_session(name, tx);
        let Some(Frame::Begin { channel }) = core.drain_outbound(now).pop() else {
            panic!("expected begin");
        };
        core.handle_event(EngineEvent::Begun { channel }, now);
        assert_eq!(rx.try_recv().unwrap().unwrap(), channel);
        channel
    }

    fn sender_spec(name: &str) -> LinkSpec {
        LinkSpec {
            name: name.to_string(),
            role: Role::Sender,
            source: None,
            target: Some(Target::Address("queue".to_string())),
            settle_mode: SenderSettleMode::Unsettled,
            prefetch: 0,
        }
    }

    #[test]
    fn test_open_frame_carries_client_identity() {
        let now = Instant::now();
        let mut core = ConnectionCore::new(options(), now);
        let (tx, _rx) = oneshot::channel();
        core.open(tx, now);

        let frames = core.drain_outbound(now);
        let Some(Frame::Open {
            container_id,
            properties,
            ..
        }) = frames.first()
        else {
            panic!("expected open");
        };
        assert_eq!(container_id, "test-connection");
        assert_eq!(properties.get("name").map(String::as_str), Some("UNKNOWN"));
        assert_eq!(core.state(), ConnectionState::Opening);
    }

    #[test]
    fn test_session_reused_by_name() {
        let now = Instant::now();
        let mut core = active_core(now);
        let first = mapped_session(&mut core, "main", now);

        let (tx, mut rx) = oneshot::channel();
        core.create_session("main", tx);
        assert_eq!(rx.try_recv().unwrap().unwrap(), first);
        assert!(core.drain_outbound(now).is_empty());
    }

    #[test]
    fn test_duplicate_link_name_refused() {
        let now = Instant::now();
        let mut core = active_core(now);
        let channel = mapped_session(&mut core, "main", now);

        let (tx, _rx) = oneshot::channel();
        core.attach_link(channel, sender_spec("orders"), tx);
        let (tx, mut rx) = oneshot::channel();
        core.attach_link(channel, sender_spec("orders"), tx);

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(AmqpError::LinkCreation { .. })
        ));
    }

    #[test]
    fn test_keepalive_and_idle_deadlines() {
        let now = Instant::now();
        let mut core = active_core(now);
        assert_eq!(core.next_deadline(), Some(now + Duration::from_secs(5)));

        core.poll_timers(now + Duration::from_secs(5));
        assert_eq!(
            core.drain_outbound(now + Duration::from_secs(5)),
            vec![Frame::Empty]
        );

        core.poll_timers(now + Duration::from_secs(30));
        assert_eq!(core.state(), ConnectionState::Failed);
        assert_eq!(core.next_deadline(), None);
    }

    #[test]
    fn test_close_waits_for_children() {
        let now = Instant::now();
        let mut core = active_core(now);
        let channel = mapped_session(&mut core, "main", now);
        let (tx, _rx) = oneshot::channel();
        core.attach_link(channel, sender_spec("orders"), tx);
        core.handle_event(
            EngineEvent::Attached {
                handle: LinkHandle(0),
            },
            now,
        );
        core.drain_outbound(now);

        let (tx, mut rx) = oneshot::channel();
        core.close(tx, now);
        let frames = core.drain_outbound(now);
        assert!(frames.iter().any(|f| matches!(f, Frame::Detach { .. })));
        assert!(frames.iter().any(|f| matches!(f, Frame::End { .. })));
        assert!(!frames.contains(&Frame::Close));

        core.handle_event(
            EngineEvent::Detached {
                handle: LinkHandle(0),
                error: None,
            },
            now,
        );
        core.handle_event(EngineEvent::Ended { channel, error: None }, now);
        assert_eq!(core.drain_outbound(now), vec![Frame::Close]);

        core.handle_event(EngineEvent::Closed { error: None }, now);
        assert_eq!(core.state(), ConnectionState::Closed);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_incoming_attach_refused() {
        let now = Instant::now();
        let mut core = active_core(now);
        let channel = mapped_session(&mut core, "main", now);

        core.handle_event(
            EngineEvent::IncomingAttach {
                channel,
                name: "peer-link".to_string(),
                role: Role::Sender,
            },
            now,
        );

        assert!(matches!(
            core.drain_outbound(now).as_slice(),
            [Frame::Detach {
                error: Some(ErrorCondition::NotAllowed),
                ..
            }]
        ));
        assert_eq!(
            core.info().sessions[0].incoming_link_requests,
            vec!["peer-link".to_string()]
        );
    }
}
