//! The session registry: the one place where concurrent mutation happens.
//!
//! All structural changes (admit, evict) and membership reads go through a
//! single `tokio::sync::Mutex` over the session map, so two admissions racing
//! on the same name can never both succeed. Broadcast snapshots the map under
//! that same lock and hands each payload to the session's bounded outbound
//! channel with `try_send`; a slow or dead peer can therefore never stall
//! delivery to the others. Its channel fills up, it is handed a disconnect
//! signal, and it evicts itself through its own task's cleanup path.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use chrono::{DateTime, Local, Utc};
use tracing::{info, warn};

use crate::secure::EncryptionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u128);

impl SessionId {
    pub fn new() -> Self {
        let mut b = [0u8; 16];
        getrandom::getrandom(&mut b).expect("getrandom");
        Self(u128::from_be_bytes(b))
    }

    // Good enough for logs: XOR high/low halves.
    pub fn short(self) -> u64 {
        (self.0 as u64) ^ ((self.0 >> 64) as u64)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.short())
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    sender: tokio::sync::mpsc::Sender<Bytes>,
    disconnect_tx: tokio::sync::watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub enum AdmitError {
    NameConflict(String),
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmitError::NameConflict(name) => write!(f, "name already taken: {name}"),
        }
    }
}

impl std::error::Error for AdmitError {}

#[derive(Debug)]
pub struct Registry {
    inner: tokio::sync::Mutex<HashMap<SessionId, Session>>,
    crypto: Option<std::sync::Arc<EncryptionContext>>,
}

impl Registry {
    pub fn new(crypto: Option<std::sync::Arc<EncryptionContext>>) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(HashMap::new()),
            crypto,
        }
    }

    pub fn crypto(&self) -> Option<&std::sync::Arc<EncryptionContext>> {
        self.crypto.as_ref()
    }

    /// Atomically check name uniqueness and insert. Names are case-sensitive
    /// and immutable for the session's lifetime.
    pub async fn try_admit(
        &self,
        id: SessionId,
        name: &str,
        peer: SocketAddr,
        sender: tokio::sync::mpsc::Sender<Bytes>,
        disconnect_tx: tokio::sync::watch::Sender<bool>,
    ) -> Result<(), AdmitError> {
        let mut m = self.inner.lock().await;
        if m.values().any(|s| s.name == name) {
            return Err(AdmitError::NameConflict(name.to_string()));
        }
        m.insert(
            id,
            Session {
                name: name.to_string(),
                peer,
                connected_at: Utc::now(),
                sender,
                disconnect_tx,
            },
        );
        Ok(())
    }

    /// Idempotent eviction; returns the evicted session for the leave notice.
    pub async fn remove(&self, id: SessionId) -> Option<Session> {
        self.inner.lock().await.remove(&id)
    }

    /// Fan `text` out to every registered session except `exclude`. Delivery
    /// uses the session's bounded channel and never blocks; a failing session
    /// is signalled to disconnect rather than retried.
    pub async fn broadcast(&self, text: &str, exclude: Option<SessionId>) {
        let payload = self.seal_line(text);
        let m = self.inner.lock().await;
        for (id, s) in m.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if s.sender.try_send(payload.clone()).is_err() {
                warn!(session = %id, name = %s.name, "outbound queue unavailable; scheduling eviction");
                let _ = s.disconnect_tx.send(true);
            }
        }
    }

    /// Format a chat line as `[HH:MM:SS] name: text` and broadcast it to
    /// everyone but the sender.
    pub async fn broadcast_chat(&self, from: SessionId, name: &str, text: &str) {
        let stamped = format!("[{}] {name}: {text}", Local::now().format("%H:%M:%S"));
        info!("{stamped}");
        self.broadcast(&stamped, Some(from)).await;
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Snapshot of `(name, origin ip)` pairs, oldest session first. Later
    /// mutations are not reflected in a returned snapshot.
    pub async fn list_summaries(&self) -> Vec<(String, IpAddr)> {
        let m = self.inner.lock().await;
        let mut v = m
            .values()
            .map(|s| (s.connected_at, s.name.clone(), s.peer.ip()))
            .collect::<Vec<_>>();
        v.sort();
        v.into_iter().map(|(_, name, ip)| (name, ip)).collect()
    }

    fn seal_line(&self, text: &str) -> Bytes {
        let line = match &self.crypto {
            Some(ctx) => ctx.encrypt(text),
            None => text.to_string(),
        };
        Bytes::from(format!("{line}\n"))
    }
}
