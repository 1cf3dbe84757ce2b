//! Sans-IO connection, session and link state machines
//!
//! [`ConnectionCore`] owns arenas of sessions and links keyed by their
//! local ids. It consumes commands and engine events, queues outbound
//! frames and completes caller waiters; it never awaits and never touches a
//! socket, so the event pump can drive it from a single task.

pub mod connection;
pub mod link;
pub mod session;

pub use connection::{ConnectionCore, ConnectionInfo, ConnectionState};
pub use link::{LinkAttached, LinkInfo, LinkSpec, LinkState};
pub use session::{SessionInfo, SessionState};

use aqueduct_core::Result;
use tokio::sync::oneshot;

/// One-shot completion handed back to a caller
pub type Completion<T> = oneshot::Sender<Result<T>>;

/// Complete a waiter; a caller that stopped waiting is not an error.
pub(crate) fn complete<T>(waiter: Completion<T>, result: Result<T>) {
    let _ = waiter.send(result);
}
