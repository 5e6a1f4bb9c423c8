//! Movement ledger
//!
//! Answers "where is this participant right now" for peers that join late.
//! Records are folded into one running position per participant as they
//! arrive: displacement is the sum of `delta * move_speed` over every record,
//! rotation is whatever the most recent record reported. Both appends and
//! reads are O(1) regardless of session length.

use shared::{MovementRecord, ParticipantId, Position};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default)]
struct RunningPosition {
    position: Position,
    records: u64,
}

#[derive(Debug)]
pub struct MovementLedger {
    move_speed: f32,
    cells: HashMap<ParticipantId, RunningPosition>,
}

impl MovementLedger {
    pub fn new(move_speed: f32) -> Self {
        Self {
            move_speed,
            cells: HashMap::new(),
        }
    }

    pub fn move_speed(&self) -> f32 {
        self.move_speed
    }

    /// Puts the participant back at the origin with no records.
    pub fn reset(&mut self, user_id: &str) {
        self.cells
            .insert(user_id.to_string(), RunningPosition::default());
    }

    /// Folds one record into the participant's position, creating the cell
    /// on first use.
    pub fn append(&mut self, user_id: &str, record: &MovementRecord) {
        let cell = self.cells.entry(user_id.to_string()).or_default();
        cell.position.advance(record, self.move_speed);
        cell.records += 1;
    }

    /// Current aggregate position; the origin for unknown participants.
    pub fn aggregate(&self, user_id: &str) -> Position {
        self.cells
            .get(user_id)
            .map(|cell| cell.position)
            .unwrap_or(Position::ORIGIN)
    }

    /// Number of records folded since the last reset.
    pub fn records_applied(&self, user_id: &str) -> u64 {
        self.cells.get(user_id).map_or(0, |cell| cell.records)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.cells.contains_key(user_id)
    }

    pub fn remove(&mut self, user_id: &str) -> bool {
        self.cells.remove(user_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
