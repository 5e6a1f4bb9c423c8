//! Room directory: room identifier → ordered member list
//!
//! Rooms are created on first reference. By default an emptied room keeps its
//! (empty) entry; with reaping enabled the entry is dropped as soon as the
//! last member leaves.

use log::debug;
use shared::{ParticipantId, RoomId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomId, Vec<ParticipantId>>,
    reap_empty_rooms: bool,
}

impl RoomDirectory {
    pub fn new(reap_empty_rooms: bool) -> Self {
        Self {
            rooms: HashMap::new(),
            reap_empty_rooms,
        }
    }

    /// Adds `user_id` to the room, creating the room if needed. Returns false
    /// if the participant was already a member.
    pub fn join(&mut self, room_id: &str, user_id: &str) -> bool {
        let members = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            debug!("Room {} created", room_id);
            Vec::new()
        });

        if members.iter().any(|member| member == user_id) {
            return false;
        }
        members.push(user_id.to_string());
        true
    }

    /// Removes `user_id` from the room. Returns false if it was not a member.
    pub fn leave(&mut self, room_id: &str, user_id: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };

        let before = members.len();
        members.retain(|member| member != user_id);
        let removed = members.len() != before;

        if removed && members.is_empty() && self.reap_empty_rooms {
            self.rooms.remove(room_id);
            debug!("Room {} reaped", room_id);
        }
        removed
    }

    /// Members in join order; empty for an unknown room.
    pub fn members_of(&self, room_id: &str) -> &[ParticipantId] {
        self.rooms.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Number of room entries, including retained empty ones.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Drops every empty room entry and returns how many were dropped.
    pub fn prune_empty(&mut self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|_, members| !members.is_empty());
        before - self.rooms.len()
    }
}
