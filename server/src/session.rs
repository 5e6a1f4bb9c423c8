//! Session lifecycle: connect, move, shot and disconnect handling
//!
//! `SessionState` owns the connection registry, the room directory, the
//! movement ledger and the participant → room membership record. It is
//! driven from a single task (see `network::Server::run`), so none of the
//! maps need locking; every join or broadcast observes one consistent
//! membership snapshot.
//!
//! Fan-out is best effort. A room member without a registered handle, or
//! whose handle no longer accepts events, is skipped and counted in
//! [`Fanout::skipped`].

use crate::connections::{ConnectionRegistry, PeerChannel};
use crate::movement::MovementLedger;
use crate::rooms::RoomDirectory;
use log::{debug, info};
use shared::{MovementRecord, ParticipantId, RoomId, ServerEvent};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("connect requires both a user_id and a room_id")]
    MalformedConnect,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    pub delivered: usize,
    pub skipped: usize,
}

impl Fanout {
    fn record(&mut self, delivered: bool) {
        if delivered {
            self.delivered += 1;
        } else {
            self.skipped += 1;
        }
    }
}

/// Outcome of a successful connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinReport {
    /// Members told about the newcomer.
    pub announced: usize,
    /// Position snapshots sent to the newcomer.
    pub snapshots: usize,
    /// A previous handle for the same participant was replaced.
    pub superseded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connections: usize,
    pub rooms: usize,
    pub participants_in_rooms: usize,
}

pub struct SessionState<C> {
    connections: ConnectionRegistry<C>,
    rooms: RoomDirectory,
    ledger: MovementLedger,
    memberships: HashMap<ParticipantId, RoomId>,
}

impl<C: PeerChannel> SessionState<C> {
    pub fn new(move_speed: f32, reap_empty_rooms: bool) -> Self {
        Self {
            connections: ConnectionRegistry::new(),
            rooms: RoomDirectory::new(reap_empty_rooms),
            ledger: MovementLedger::new(move_speed),
            memberships: HashMap::new(),
        }
    }

    /// Registers `user_id` in `room_id` behind `handle`, announces it to the
    /// room and sends it a position snapshot of every member already there.
    ///
    /// A handle previously registered for the same participant is dropped,
    /// which closes that transport. If the participant was in a different
    /// room it leaves that room first.
    pub fn connect(
        &mut self,
        user_id: &str,
        room_id: &str,
        handle: C,
    ) -> Result<JoinReport, SessionError> {
        if user_id.is_empty() || room_id.is_empty() {
            return Err(SessionError::MalformedConnect);
        }

        if let Some(previous_room) = self.memberships.get(user_id).cloned() {
            if previous_room != room_id {
                self.rooms.leave(&previous_room, user_id);
                self.announce_departure(&previous_room, user_id);
            }
        }

        self.rooms.join(room_id, user_id);
        let superseded = self.connections.register(user_id, handle).is_some();
        self.memberships
            .insert(user_id.to_string(), room_id.to_string());
        self.ledger.reset(user_id);

        let mut report = JoinReport {
            superseded,
            ..JoinReport::default()
        };

        let Some(newcomer) = self.connections.lookup(user_id) else {
            return Ok(report);
        };

        for member in self.rooms.members_of(room_id) {
            if member == user_id {
                continue;
            }
            let Some(peer) = self.connections.lookup(member) else {
                continue;
            };

            if peer.deliver(ServerEvent::UserJoined {
                user_id: user_id.to_string(),
            }) {
                report.announced += 1;
            }

            let position = self.ledger.aggregate(member);
            if newcomer.deliver(ServerEvent::position(member, position)) {
                report.snapshots += 1;
            }
        }

        info!(
            "Participant {} joined room {} ({} members)",
            user_id,
            room_id,
            self.rooms.members_of(room_id).len()
        );
        Ok(report)
    }

    /// Records a movement and relays the raw delta to the rest of the room.
    /// Returns `None` if the participant is not in a room.
    pub fn handle_move(&mut self, user_id: &str, record: MovementRecord) -> Option<Fanout> {
        let room_id = self.memberships.get(user_id)?;

        self.ledger.append(user_id, &record);
        let fanout = self.broadcast(room_id, Some(user_id), &ServerEvent::moved(user_id, &record));

        debug!(
            "Move from {} relayed to {} ({} skipped)",
            user_id, fanout.delivered, fanout.skipped
        );
        Some(fanout)
    }

    /// Relays a shot to the rest of the room. Returns `None` if the
    /// participant is not in a room.
    pub fn handle_shot(&mut self, user_id: &str) -> Option<Fanout> {
        let room_id = self.memberships.get(user_id)?;

        let event = ServerEvent::UserShot {
            user_id: user_id.to_string(),
        };
        let fanout = self.broadcast(room_id, Some(user_id), &event);

        debug!(
            "Shot from {} relayed to {} ({} skipped)",
            user_id, fanout.delivered, fanout.skipped
        );
        Some(fanout)
    }

    /// Removes every trace of the participant and tells the remaining room
    /// members it left. Safe to call repeatedly.
    pub fn disconnect(&mut self, user_id: &str) -> Fanout {
        let room_id = self.memberships.remove(user_id);
        if let Some(room_id) = &room_id {
            self.rooms.leave(room_id, user_id);
        }
        self.connections.remove(user_id);
        self.ledger.remove(user_id);

        let Some(room_id) = room_id else {
            return Fanout::default();
        };

        info!("Participant {} left room {}", user_id, room_id);
        self.announce_departure(&room_id, user_id)
    }

    fn announce_departure(&self, room_id: &str, user_id: &str) -> Fanout {
        let event = ServerEvent::UserLeft {
            user_id: user_id.to_string(),
        };
        self.broadcast(room_id, Some(user_id), &event)
    }

    /// Sends `event` to every member of `room_id` except `exclude`.
    pub fn broadcast(&self, room_id: &str, exclude: Option<&str>, event: &ServerEvent) -> Fanout {
        let mut fanout = Fanout::default();

        for member in self.rooms.members_of(room_id) {
            if Some(member.as_str()) == exclude {
                continue;
            }
            fanout.record(self.connections.send_to(member, event.clone()));
        }

        fanout
    }

    /// Room the participant is currently in.
    pub fn room_of(&self, user_id: &str) -> Option<&str> {
        self.memberships.get(user_id).map(String::as_str)
    }

    pub fn connections(&self) -> &ConnectionRegistry<C> {
        &self.connections
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    pub fn ledger(&self) -> &MovementLedger {
        &self.ledger
    }

    /// Drops retained empty room entries.
    pub fn prune_empty_rooms(&mut self) -> usize {
        self.rooms.prune_empty()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            connections: self.connections.len(),
            rooms: self.rooms.room_count(),
            participants_in_rooms: self.memberships.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::Position;
    use std::collections::HashSet;
    use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

    type Handle = UnboundedSender<ServerEvent>;

    fn channel() -> (Handle, UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn joined(user_id: &str) -> ServerEvent {
        ServerEvent::UserJoined {
            user_id: user_id.to_string(),
        }
    }

    fn left(user_id: &str) -> ServerEvent {
        ServerEvent::UserLeft {
            user_id: user_id.to_string(),
        }
    }

    #[test]
    fn test_connect_rejects_missing_identifiers() {
        let mut state: SessionState<Handle> = SessionState::new(1.0, false);
        let (tx, _rx) = channel();

        assert_eq!(
            state.connect("", "room", tx.clone()),
            Err(SessionError::MalformedConnect)
        );
        assert_eq!(
            state.connect("alice", "", tx),
            Err(SessionError::MalformedConnect)
        );

        assert_eq!(state.stats(), SessionStats::default());
        assert_eq!(state.rooms().room_count(), 0);
        assert!(state.ledger().is_empty());
    }

    #[test]
    fn test_first_member_receives_nothing() {
        let mut state = SessionState::new(1.0, false);
        let (tx, mut rx) = channel();

        let report = state.connect("alice", "room", tx).unwrap();

        assert_eq!(report, JoinReport::default());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(state.room_of("alice"), Some("room"));
    }

    #[test]
    fn test_two_participant_scenario() {
        let mut state = SessionState::new(1.0, false);
        let (a_tx, mut a_rx) = channel();
        let (b_tx, mut b_rx) = channel();

        state.connect("A", "R", a_tx).unwrap();
        let report = state.connect("B", "R", b_tx).unwrap();
        assert_eq!(report.announced, 1);
        assert_eq!(report.snapshots, 1);

        assert_eq!(
            drain(&mut b_rx),
            vec![ServerEvent::position("A", Position::ORIGIN)]
        );
        assert_eq!(drain(&mut a_rx), vec![joined("B")]);

        let fanout = state
            .handle_move("A", MovementRecord::new(1.0, 0.0, 0.0))
            .unwrap();
        assert_eq!(fanout, Fanout { delivered: 1, skipped: 0 });
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerEvent::UserMoved {
                user_id: "A".to_string(),
                x: 1.0,
                y: 0.0,
                rotation: 0.0,
            }]
        );
        assert!(drain(&mut a_rx).is_empty());

        state.disconnect("A");
        assert_eq!(drain(&mut b_rx), vec![left("A")]);

        assert!(state.connections().lookup("A").is_none());
        assert!(state.room_of("A").is_none());
        assert_eq!(state.rooms().members_of("R"), ["B"]);
        assert!(!state.ledger().contains("A"));
    }

    #[test]
    fn test_late_joiner_receives_aggregate_position() {
        let speed = 2.5;
        let mut state = SessionState::new(speed, false);
        let (a_tx, _a_rx) = channel();
        let (b_tx, mut b_rx) = channel();

        state.connect("A", "R", a_tx).unwrap();
        state.handle_move("A", MovementRecord::new(1.0, 0.0, 0.4));
        state.handle_move("A", MovementRecord::new(0.0, 1.0, 1.1));

        state.connect("B", "R", b_tx).unwrap();
        let events = drain(&mut b_rx);
        assert_eq!(events.len(), 1);

        match &events[0] {
            ServerEvent::UserPosition {
                user_id,
                x,
                y,
                rotation,
            } => {
                assert_eq!(user_id, "A");
                assert_approx_eq!(*x, speed);
                assert_approx_eq!(*y, speed);
                assert_approx_eq!(*rotation, 1.1);
            }
            other => panic!("Expected user_position, got {:?}", other),
        }
    }

    #[test]
    fn test_newcomer_gets_one_snapshot_per_existing_member() {
        let mut state = SessionState::new(1.0, false);
        let mut receivers = Vec::new();

        for id in ["p1", "p2", "p3"] {
            let (tx, rx) = channel();
            state.connect(id, "R", tx).unwrap();
            receivers.push(rx);
        }
        state.handle_move("p2", MovementRecord::new(3.0, 0.0, 0.0));

        let (tx, mut rx) = channel();
        let report = state.connect("p4", "R", tx).unwrap();
        assert_eq!(report.snapshots, 3);
        assert_eq!(report.announced, 3);

        let snapshots: HashSet<String> = drain(&mut rx)
            .into_iter()
            .map(|event| {
                assert_eq!(event.name(), "user_position");
                event.user_id().to_string()
            })
            .collect();
        let expected: HashSet<String> = ["p1", "p2", "p3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(snapshots, expected);
    }

    #[test]
    fn test_sender_never_receives_own_events() {
        let mut state = SessionState::new(1.0, false);
        let (a_tx, mut a_rx) = channel();
        let (b_tx, mut b_rx) = channel();
        state.connect("A", "R", a_tx).unwrap();
        state.connect("B", "R", b_tx).unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        state.handle_move("A", MovementRecord::new(0.5, 0.5, 0.0));
        state.handle_shot("A");
        state.handle_shot("B");

        let to_a = drain(&mut a_rx);
        assert_eq!(
            to_a,
            vec![ServerEvent::UserShot {
                user_id: "B".to_string()
            }]
        );
        let to_b = drain(&mut b_rx);
        assert_eq!(to_b.len(), 2);
        assert!(to_b.iter().all(|event| event.user_id() == "A"));
    }

    #[test]
    fn test_move_and_shot_without_room_are_dropped() {
        let mut state: SessionState<Handle> = SessionState::new(1.0, false);

        assert!(state
            .handle_move("ghost", MovementRecord::new(1.0, 1.0, 1.0))
            .is_none());
        assert!(state.handle_shot("ghost").is_none());
        assert!(state.ledger().is_empty());
    }

    #[test]
    fn test_rooms_are_isolated() {
        let mut state = SessionState::new(1.0, false);
        let (a_tx, mut a_rx) = channel();
        let (b_tx, mut b_rx) = channel();
        state.connect("A", "red", a_tx).unwrap();
        state.connect("B", "blue", b_tx).unwrap();

        let fanout = state.handle_shot("A").unwrap();
        assert_eq!(fanout, Fanout::default());
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut state = SessionState::new(1.0, false);
        let (a_tx, _a_rx) = channel();
        let (b_tx, mut b_rx) = channel();
        state.connect("A", "R", a_tx).unwrap();
        state.connect("B", "R", b_tx).unwrap();
        drain(&mut b_rx);

        let first = state.disconnect("A");
        let stats_after_first = state.stats();
        let members_after_first = state.rooms().members_of("R").to_vec();

        let second = state.disconnect("A");
        assert_eq!(first, Fanout { delivered: 1, skipped: 0 });
        assert_eq!(second, Fanout::default());
        assert_eq!(state.stats(), stats_after_first);
        assert_eq!(state.rooms().members_of("R"), members_after_first.as_slice());
        assert_eq!(drain(&mut b_rx), vec![left("A")]);
    }

    #[test]
    fn test_membership_matches_connected_set() {
        let mut state = SessionState::new(1.0, false);
        let mut receivers = Vec::new();
        for id in ["a", "b", "c", "d", "e"] {
            let (tx, rx) = channel();
            state.connect(id, "R", tx).unwrap();
            receivers.push(rx);
        }
        state.disconnect("b");
        state.disconnect("e");
        state.disconnect("b");

        let members: HashSet<&str> = state
            .rooms()
            .members_of("R")
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(members, HashSet::from(["a", "c", "d"]));
    }

    #[test]
    fn test_unknown_recipient_is_skipped() {
        let mut state = SessionState::new(1.0, false);
        let (a_tx, _a_rx) = channel();
        let (b_tx, b_rx) = channel();
        let (c_tx, mut c_rx) = channel();
        state.connect("A", "R", a_tx).unwrap();
        state.connect("B", "R", b_tx).unwrap();
        state.connect("C", "R", c_tx).unwrap();
        drain(&mut c_rx);

        // B's transport went away but its disconnect has not been processed.
        drop(b_rx);

        let fanout = state
            .handle_move("A", MovementRecord::new(1.0, 0.0, 0.0))
            .unwrap();
        assert_eq!(fanout, Fanout { delivered: 1, skipped: 1 });
        assert_eq!(drain(&mut c_rx).len(), 1);
    }

    #[test]
    fn test_reconnect_supersedes_previous_handle() {
        let mut state = SessionState::new(1.0, false);
        let (old_tx, mut old_rx) = channel();
        let (new_tx, mut new_rx) = channel();
        let (b_tx, mut b_rx) = channel();

        state.connect("A", "R", old_tx).unwrap();
        state.connect("B", "R", b_tx).unwrap();
        state.handle_move("A", MovementRecord::new(2.0, 0.0, 0.0));
        drain(&mut old_rx);
        drain(&mut b_rx);

        let report = state.connect("A", "R", new_tx).unwrap();
        assert!(report.superseded);
        assert!(matches!(
            old_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // Reconnecting starts the participant from the origin again.
        assert_eq!(state.ledger().aggregate("A"), Position::ORIGIN);
        assert_eq!(state.rooms().members_of("R"), ["A", "B"]);
        assert_eq!(drain(&mut b_rx), vec![joined("A")]);
        assert_eq!(
            drain(&mut new_rx),
            vec![ServerEvent::position("B", Position::ORIGIN)]
        );
    }

    #[test]
    fn test_reconnect_into_other_room_leaves_previous_room() {
        let mut state = SessionState::new(1.0, false);
        let (a_tx, _a_rx) = channel();
        let (a2_tx, _a2_rx) = channel();
        let (b_tx, mut b_rx) = channel();

        state.connect("B", "old", b_tx).unwrap();
        state.connect("A", "old", a_tx).unwrap();
        drain(&mut b_rx);

        state.connect("A", "new", a2_tx).unwrap();

        assert_eq!(drain(&mut b_rx), vec![left("A")]);
        assert_eq!(state.rooms().members_of("old"), ["B"]);
        assert_eq!(state.rooms().members_of("new"), ["A"]);
        assert_eq!(state.room_of("A"), Some("new"));
    }

    #[test]
    fn test_reaping_drops_empty_rooms_on_disconnect() {
        let mut state = SessionState::new(1.0, true);
        let (tx, _rx) = channel();
        state.connect("A", "R", tx).unwrap();

        state.disconnect("A");
        assert!(!state.rooms().contains("R"));
        assert_eq!(state.stats().rooms, 0);
    }

    #[test]
    fn test_prune_empty_rooms() {
        let mut state = SessionState::new(1.0, false);
        let (tx, _rx) = channel();
        state.connect("A", "R", tx).unwrap();
        state.disconnect("A");

        assert!(state.rooms().contains("R"));
        assert_eq!(state.prune_empty_rooms(), 1);
        assert!(!state.rooms().contains("R"));
    }
}
