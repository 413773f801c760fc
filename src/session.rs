//! Per-connection session state.

use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU8, Ordering},
};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

/// Monotonically increasing, per-frontend session identifier.
pub type SessionId = i64;

/// Session lifecycle status.
///
/// Ordered `Start < Handshake < Working < Closed`; [`Session::transition_to`]
/// enforces that the status never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Status {
    /// Connection accepted, no handshake yet.
    Start = 0,
    /// Handshake blob received, server reply sent.
    Handshake = 1,
    /// Handshake acknowledged; `Data` packets are now accepted.
    Working = 2,
    /// Terminal; all further reads/writes are refused.
    Closed = 3,
}

impl Status {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Start,
            1 => Self::Handshake,
            2 => Self::Working,
            _ => Self::Closed,
        }
    }
}

/// A status transition that would violate the non-decreasing invariant.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot transition session status from {from:?} to {to:?}")]
pub struct StatusError {
    /// The status at the time of the rejected transition.
    pub from: u8,
    /// The status that was requested.
    pub to: u8,
}

/// Per-connection state: identity, handshake payload, a free-form value bag,
/// and the monotonic lifecycle status.
///
/// The bag is keyed by string and holds arbitrary JSON values, mirroring the
/// "mapping string to any" contract; it must never be published across
/// sessions.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    uid: std::sync::RwLock<Option<String>>,
    handshake: std::sync::RwLock<Vec<u8>>,
    bag: DashMap<String, Value>,
    status: AtomicU8,
}

impl Session {
    /// Builds a new session in [`Status::Start`].
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            uid: std::sync::RwLock::new(None),
            handshake: std::sync::RwLock::new(Vec::new()),
            bag: DashMap::new(),
            status: AtomicU8::new(Status::Start as u8),
        }
    }

    /// The session's numeric id.
    #[must_use]
    pub const fn id(&self) -> SessionId { self.id }

    /// The bound uid, if the session has been bound.
    ///
    /// Recovers from a poisoned lock rather than panicking: a panic while
    /// holding the lock does not invalidate the uid it was guarding.
    #[must_use]
    pub fn uid(&self) -> Option<String> {
        self.uid.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Binds this session to a uid.
    ///
    /// Recovers from a poisoned lock rather than panicking.
    pub fn bind(&self, uid: impl Into<String>) {
        *self.uid.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(uid.into());
    }

    /// Stores the raw handshake payload.
    ///
    /// Recovers from a poisoned lock rather than panicking.
    pub fn set_handshake(&self, blob: Vec<u8>) {
        *self.handshake.write().unwrap_or_else(std::sync::PoisonError::into_inner) = blob;
    }

    /// Returns a copy of the stored handshake payload.
    ///
    /// Recovers from a poisoned lock rather than panicking.
    #[must_use]
    pub fn handshake(&self) -> Vec<u8> {
        self.handshake.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> Status { Status::from_u8(self.status.load(Ordering::Acquire)) }

    /// Attempts to move the session to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError`] when `next` is not strictly greater than the
    /// current status.
    pub fn transition_to(&self, next: Status) -> Result<(), StatusError> {
        let current = self.status.load(Ordering::Acquire);
        if next as u8 <= current {
            return Err(StatusError {
                from: current,
                to: next as u8,
            });
        }
        self.status.store(next as u8, Ordering::Release);
        Ok(())
    }

    /// Whether the session has reached [`Status::Closed`].
    #[must_use]
    pub fn is_closed(&self) -> bool { self.status() == Status::Closed }

    /// Reads a value bag entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> { self.bag.get(key).map(|v| v.clone()) }

    /// Writes a value bag entry.
    pub fn set(&self, key: impl Into<String>, value: Value) { self.bag.insert(key.into(), value); }
}

/// Generates monotonically increasing session ids for a single frontend.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    next: AtomicI64,
}

impl SessionIdGenerator {
    /// Builds a generator starting at 1.
    #[must_use]
    pub const fn new() -> Self { Self { next: AtomicI64::new(1) } }

    /// Allocates the next session id.
    #[must_use]
    pub fn next_id(&self) -> SessionId { self.next.fetch_add(1, Ordering::Relaxed) }
}

/// Shared handle to a session, cheaply cloned across tasks.
pub type SharedSession = Arc<Session>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cannot_go_backwards() {
        let session = Session::new(1);
        session.transition_to(Status::Handshake).expect("start->handshake");
        session.transition_to(Status::Working).expect("handshake->working");
        assert_eq!(
            session.transition_to(Status::Handshake),
            Err(StatusError { from: 2, to: 1 })
        );
    }

    #[test]
    fn status_cannot_repeat() {
        let session = Session::new(1);
        session.transition_to(Status::Handshake).expect("start->handshake");
        assert!(session.transition_to(Status::Handshake).is_err());
    }

    #[test]
    fn closed_is_terminal() {
        let session = Session::new(1);
        session.transition_to(Status::Closed).expect("start->closed");
        assert!(session.is_closed());
        assert!(session.transition_to(Status::Handshake).is_err());
    }

    #[test]
    fn generator_is_monotonic() {
        let gen = SessionIdGenerator::new();
        let a = gen.next_id();
        let b = gen.next_id();
        assert!(b > a);
    }

    #[test]
    fn bag_round_trips() {
        let session = Session::new(1);
        session.set("k", Value::from(42));
        assert_eq!(session.get("k"), Some(Value::from(42)));
        assert_eq!(session.get("missing"), None);
    }
}
