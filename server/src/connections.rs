//! Connection registry: participant identifier → live transport handle
//!
//! The registry never fails. Absence is an expected state that callers check
//! before emitting; a later `register` for the same participant replaces the
//! earlier handle (last writer wins) and hands the old one back to the caller.

use shared::{ParticipantId, ServerEvent};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Delivery capability behind a registered participant.
///
/// The in-process transport implements this with a channel into the
/// connection's writer task. A multi-process deployment would implement it
/// with a handle that publishes to the owning process instead.
pub trait PeerChannel {
    /// Queues `event` for the participant. Returns false when the channel is
    /// gone, in which case the event is dropped.
    fn deliver(&self, event: ServerEvent) -> bool;
}

impl PeerChannel for mpsc::UnboundedSender<ServerEvent> {
    fn deliver(&self, event: ServerEvent) -> bool {
        self.send(event).is_ok()
    }
}

/// Registered transport handles indexed by participant
pub struct ConnectionRegistry<C> {
    handles: HashMap<ParticipantId, C>,
}

impl<C: PeerChannel> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }

    /// Stores `handle` for `user_id`, returning the handle it replaced.
    pub fn register(&mut self, user_id: &str, handle: C) -> Option<C> {
        self.handles.insert(user_id.to_string(), handle)
    }

    pub fn lookup(&self, user_id: &str) -> Option<&C> {
        self.handles.get(user_id)
    }

    pub fn remove(&mut self, user_id: &str) -> Option<C> {
        self.handles.remove(user_id)
    }

    /// Delivers through the registered handle, if any.
    pub fn send_to(&self, user_id: &str, event: ServerEvent) -> bool {
        match self.handles.get(user_id) {
            Some(handle) => handle.deliver(event),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<C: PeerChannel> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
