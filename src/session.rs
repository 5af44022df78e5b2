//! Session glue: one connection, one close-hook registry, exactly-once close.
//!
//! A session owns exactly one [`Connection`] and one [`CallbackRegistry`].
//! Hook mutation takes the exclusive side of a lock and is refused once the
//! session is closed; invocation takes the shared side and is gated behind a
//! one-shot latch so repeated close attempts never re-run the hooks.

use crate::callback::{CallbackRegistry, HookKey};
use crate::conn::Connection;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// How the local endpoint participates in the conversation.
///
/// Determines whether datagram sends require an explicit destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointRole {
    /// Connection-oriented client: the socket has a fixed peer.
    #[default]
    Connected,
    /// Connectionless listener: every datagram needs a destination address.
    Listener,
}

/// Non-owning view of a session, handed to its connection.
///
/// The connection holds this as a `Weak` reference set once after
/// construction; it never extends the session's lifetime.
pub trait SessionRef: Send + Sync {
    /// The session's endpoint role.
    fn endpoint_role(&self) -> EndpointRole;
    /// Whether the session has been closed.
    fn is_closed(&self) -> bool;
}

/// A logical peer conversation owning one transport connection and its
/// close-time hooks.
pub struct Session<C: Connection> {
    conn: C,
    role: EndpointRole,
    closed: AtomicBool,
    /// One-shot latch for the close sequence.
    close_started: AtomicBool,
    close_callbacks: RwLock<CallbackRegistry>,
}

impl<C: Connection + 'static> Session<C> {
    /// Create a session owning `conn` and wire the connection's non-owning
    /// back-reference.
    pub fn new(conn: C, role: EndpointRole) -> Arc<Self> {
        let session = Arc::new(Self {
            conn,
            role,
            closed: AtomicBool::new(false),
            close_started: AtomicBool::new(false),
            close_callbacks: RwLock::new(CallbackRegistry::new()),
        });
        let weak: Weak<dyn SessionRef> =
            Arc::downgrade(&(Arc::clone(&session) as Arc<dyn SessionRef>));
        session.conn.set_session(weak);
        session
    }
}

impl<C: Connection> Session<C> {
    /// The owned connection.
    pub fn conn(&self) -> &C {
        &self.conn
    }

    pub fn endpoint_role(&self) -> EndpointRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a hook to run when the session closes.
    ///
    /// A `(handler, key)` identity already present has its hook replaced in
    /// place. Silent no-op once the session is closed.
    pub fn add_close_callback(
        &self,
        handler: impl Into<HookKey>,
        key: impl Into<HookKey>,
        hook: impl Fn() + Send + Sync + 'static,
    ) {
        let mut callbacks = self.close_callbacks.write().unwrap();
        if self.is_closed() {
            return;
        }
        callbacks.add(handler, key, hook);
    }

    /// Remove a registered close hook. Silent no-op once the session is
    /// closed or when the identity is absent.
    pub fn remove_close_callback(&self, handler: impl Into<HookKey>, key: impl Into<HookKey>) {
        let mut callbacks = self.close_callbacks.write().unwrap();
        if self.is_closed() {
            return;
        }
        callbacks.remove(handler, key);
    }

    /// Number of currently registered close hooks.
    pub fn close_callback_count(&self) -> usize {
        self.close_callbacks.read().unwrap().count()
    }

    /// Run the registered close hooks in insertion order, reporting any
    /// failures. Called exactly once by the close sequence.
    fn invoke_close_callbacks(&self) {
        let callbacks = self.close_callbacks.read().unwrap();
        for failure in callbacks.invoke() {
            tracing::error!(
                conn.id = self.conn.id(),
                hook.handler = %failure.handler,
                hook.key = %failure.key,
                hook.panic = %failure.message,
                "close callback panicked"
            );
        }
    }

    /// Close the session: tear down the connection, then run the close hooks.
    ///
    /// Repeated calls are no-ops; the registry is invoked at most once in the
    /// session's lifetime.
    pub async fn close(&self, linger: Option<Duration>) {
        self.closed.store(true, Ordering::SeqCst);
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(
            conn.id = self.conn.id(),
            conn.peer = self.conn.remote_addr(),
            "closing session"
        );
        self.conn.close_conn(linger).await;
        self.invoke_close_callbacks();
    }

    /// Convenience passthrough to the connection's send.
    pub async fn send(&self, payload: impl Into<crate::conn::Payload>) -> Result<usize> {
        self.conn.send(payload.into()).await
    }
}

impl<C: Connection> SessionRef for Session<C> {
    fn endpoint_role(&self) -> EndpointRole {
        self.role
    }

    fn is_closed(&self) -> bool {
        Session::is_closed(self)
    }
}
