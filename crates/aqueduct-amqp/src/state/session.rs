//! Session state machine

use super::{complete, Completion};
use crate::engine::Frame;
use crate::types::{LinkHandle, SessionId};
use aqueduct_core::AmqpError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No begin sent yet
    Unmapped,
    /// Begin sent, waiting for the peer
    BeginSent,
    /// Mapped on both ends
    Mapped,
    /// End sent, waiting for the peer
    EndSent,
    /// Ended on both ends
    Ended,
    /// Failed with the connection
    Failed,
}

impl SessionState {
    /// Whether the session can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }
}

/// Diagnostic snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session name
    pub name: String,
    /// Local channel
    pub channel: SessionId,
    /// Current state
    pub state: SessionState,
    /// Names of the links created on this session
    pub links: Vec<String>,
    /// Names of peer-initiated links that were refused
    pub incoming_link_requests: Vec<String>,
}

pub(crate) struct SessionEntry {
    pub(crate) name: String,
    pub(crate) channel: SessionId,
    pub(crate) state: SessionState,
    pub(crate) links: BTreeSet<LinkHandle>,
    pub(crate) incoming_link_requests: Vec<String>,
    begin_waiters: Vec<Completion<SessionId>>,
    end_waiters: Vec<Completion<()>>,
}

impl SessionEntry {
    pub(crate) fn new(name: String, channel: SessionId) -> Self {
        Self {
            name,
            channel,
            state: SessionState::Unmapped,
            links: BTreeSet::new(),
            incoming_link_requests: Vec::new(),
            begin_waiters: Vec::new(),
            end_waiters: Vec::new(),
        }
    }

    pub(crate) fn begin(&mut self, waiter: Completion<SessionId>, out: &mut Vec<Frame>) {
        self.state = SessionState::BeginSent;
        self.begin_waiters.push(waiter);
        out.push(Frame::Begin {
            channel: self.channel,
        });
    }

    /// Join an in-flight begin, or answer immediately once mapped.
    pub(crate) fn join(&mut self, waiter: Completion<SessionId>) {
        match self.state {
            SessionState::Mapped => complete(waiter, Ok(self.channel)),
            _ => self.begin_waiters.push(waiter),
        }
    }

    pub(crate) fn on_begun(&mut self) {
        if self.state != SessionState::BeginSent {
            debug!(session = %self.name, state = ?self.state, "Ignoring unexpected begin");
            return;
        }
        self.state = SessionState::Mapped;
        for waiter in self.begin_waiters.drain(..) {
            complete(waiter, Ok(self.channel));
        }
    }

    pub(crate) fn begin_end(&mut self, waiter: Option<Completion<()>>, out: &mut Vec<Frame>) {
        match self.state {
            SessionState::BeginSent | SessionState::Mapped => {
                self.state = SessionState::EndSent;
                out.push(Frame::End {
                    channel: self.channel,
                });
                self.end_waiters.extend(waiter);
            }
            SessionState::EndSent => self.end_waiters.extend(waiter),
            SessionState::Unmapped => {
                self.state = SessionState::Ended;
                if let Some(waiter) = waiter {
                    complete(waiter, Ok(()));
                }
            }
            SessionState::Ended | SessionState::Failed => {
                if let Some(waiter) = waiter {
                    complete(waiter, Ok(()));
                }
            }
        }
    }

    /// Peer ended the session. Returns `true` when the end was unsolicited
    /// and must be answered.
    pub(crate) fn on_ended(&mut self, cause: &AmqpError, failed: bool) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let unsolicited = self.state == SessionState::Mapped;
        for waiter in self.begin_waiters.drain(..) {
            complete(waiter, Err(cause.clone()));
        }
        for waiter in self.end_waiters.drain(..) {
            complete(waiter, Ok(()));
        }
        self.state = if failed {
            SessionState::Failed
        } else {
            SessionState::Ended
        };
        unsolicited
    }

    pub(crate) fn fail(&mut self, cause: &AmqpError) {
        if self.state.is_terminal() {
            return;
        }
        for waiter in self.begin_waiters.drain(..) {
            complete(waiter, Err(cause.clone()));
        }
        for waiter in self.end_waiters.drain(..) {
            complete(waiter, Err(cause.clone()));
        }
        self.state = SessionState::Failed;
    }

    pub(crate) fn force_close(&mut self, cause: &AmqpError) {
        if self.state.is_terminal() {
            return;
        }
        for waiter in self.begin_waiters.drain(..) {
            complete(waiter, Err(cause.clone()));
        }
        for waiter in self.end_waiters.drain(..) {
            complete(waiter, Ok(()));
        }
        self.state = SessionState::Ended;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_waiters_share_one_begin() {
        let mut session = SessionEntry::new("main".to_string(), SessionId(0));
        let mut out = Vec::new();
        let (first, mut first_rx) = oneshot::channel();
        let (second, mut second_rx) = oneshot::channel();

        session.begin(first, &mut out);
        session.join(second);
        assert_eq!(out.len(), 1);

        session.on_begun();
        assert_eq!(first_rx.try_recv().unwrap().unwrap(), SessionId(0));
        assert_eq!(second_rx.try_recv().unwrap().unwrap(), SessionId(0));
    }

    #[test]
    fn test_end_is_sent_once() {
        let mut session = SessionEntry::new("main".to_string(), SessionId(2));
        let mut out = Vec::new();
        let (tx, _rx) = oneshot::channel();
        session.begin(tx, &mut out);
        session.on_begun();

        session.begin_end(None, &mut out);
        session.begin_end(None, &mut out);
        let ends = out
            .iter()
            .filter(|frame| matches!(frame, Frame::End { .. }))
            .count();
        assert_eq!(ends, 1);
        assert_eq!(session.state, SessionState::EndSent);
    }
}
