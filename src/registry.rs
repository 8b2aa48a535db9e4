use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::AsyncWrite,
    sync::{Mutex, RwLock},
};
use tracing::debug;

use crate::message::{self, IncomingFrame};

/// Identity assigned to a connection for the registry's lifetime.
pub type SessionId = u64;

/// Shared handle to one connection's write half. Boxed so the registry
/// works over any transport; tests drive it with in-memory pipes.
pub type SessionWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// The set of live sessions, keyed by identity.
///
/// Identities start at 1 and only grow. An identity leaves the map when its
/// connection is torn down and is never issued again, so a stale identity
/// can at worst address nobody.
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, SessionWriter>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates the next identity and stores the connection's write half
    /// under it. The identity is visible to `identities` and `contains` as
    /// soon as this returns.
    pub async fn register(&self, writer: SessionWriter) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().await.insert(id, writer);
        id
    }

    /// Removes a session. Idempotent: deregistering an absent identity is
    /// a no-op.
    pub async fn deregister(&self, id: SessionId) {
        self.sessions.write().await.remove(&id);
    }

    /// Whether the identity belongs to a currently registered session.
    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// A snapshot of the registered identities, in no particular order.
    pub async fn identities(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Fans an `INCOMING` frame out to every registered recipient except
    /// the sender. Duplicate and unknown recipient ids are skipped, as is
    /// any recipient whose socket write fails (its own session loop will
    /// observe the broken transport and tear it down). Returns how many
    /// deliveries reached the transport.
    pub async fn broadcast(
        &self,
        sender: SessionId,
        recipients: &[SessionId],
        body: &[u8],
    ) -> usize {
        let frame = IncomingFrame {
            sender,
            body: body.to_vec(),
        }
        .encode();
        let wanted: HashSet<SessionId> = recipients.iter().copied().collect();

        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for (&id, writer) in sessions.iter() {
            if id == sender || !wanted.contains(&id) {
                continue;
            }
            let mut writer = writer.lock().await;
            match message::write_frame(&mut *writer, &frame).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    debug!(recipient = id, error = ?error, "skipping undeliverable recipient");
                }
            }
        }
        delivered
    }
}
