//! Tournaments joined by the bot and the slots they keep reserved.
//!
//! A joined tournament holds one slot of the concurrency cap from the moment it is joined, so
//! that a pairing is never declined for lack of capacity. When the tournament's game starts
//! it takes that slot; when the game ends the slot goes back to being reserved. Leaving
//! releases the slot right away when no tournament game is running, or when it finishes.
//!
//! If every slot is busy at join time the membership waits without a reservation and gets
//! the next slot freed.

use std::collections::BTreeMap;

use time::OffsetDateTime;
use tracing::{debug, info};

/// One joined tournament.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TournamentMembership {
    /// Tournament id.
    pub id: String,
    /// Team the bot plays for in team battles.
    pub team: Option<String>,
    /// Entry password.
    pub password: Option<String>,
    /// Holds a slot of the concurrency cap.
    pub reserved: bool,
    /// A tournament game is running and uses the slot.
    pub in_game: bool,
    /// Leave was asked while a game was running.
    pub leaving: bool,
    /// Known end of the tournament.
    pub ends_at: Option<OffsetDateTime>,
}

/// Result of [`TournamentTracker::leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leave {
    /// Membership removed, its slot is free.
    Released,
    /// A game is running, the slot is released when it ends.
    Deferred,
    /// Not a member.
    Unknown,
}

/// All tournaments currently joined.
#[derive(Debug, Clone, Default)]
pub struct TournamentTracker {
    memberships: BTreeMap<String, TournamentMembership>,
}

impl TournamentTracker {
    /// No tournament joined.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tournament. The slot is reserved when `slot_available` is set.
    ///
    /// Returns `false` if it was already joined.
    pub fn join(
        &mut self,
        id: &str,
        team: Option<String>,
        password: Option<String>,
        ends_at: Option<OffsetDateTime>,
        slot_available: bool,
    ) -> bool {
        if self.memberships.contains_key(id) {
            return false;
        }
        info!(tournament = id, reserved = slot_available, "tournament joined");
        self.memberships.insert(
            id.to_string(),
            TournamentMembership {
                id: id.to_string(),
                team,
                password,
                reserved: slot_available,
                in_game: false,
                leaving: false,
                ends_at,
            },
        );
        true
    }

    /// Stops tracking a tournament.
    pub fn leave(&mut self, id: &str) -> Leave {
        match self.memberships.get_mut(id) {
            None => Leave::Unknown,
            Some(m) if m.in_game => {
                m.leaving = true;
                Leave::Deferred
            }
            Some(_) => {
                self.memberships.remove(id);
                info!(tournament = id, "tournament left");
                Leave::Released
            }
        }
    }

    /// Membership of a tournament.
    pub fn get(&self, id: &str) -> Option<&TournamentMembership> {
        self.memberships.get(id)
    }

    /// Joined tournaments.
    pub fn ids(&self) -> Vec<String> {
        self.memberships.keys().cloned().collect()
    }

    /// Nothing joined.
    pub fn is_empty(&self) -> bool {
        self.memberships.is_empty()
    }

    /// Reserved slots not used by a running game.
    pub fn idle_reservations(&self) -> usize {
        self.memberships
            .values()
            .filter(|m| m.reserved && !m.in_game)
            .count()
    }

    /// Tournaments whose pairing would use their reservation.
    pub fn reserved_ids(&self) -> Vec<String> {
        self.memberships
            .values()
            .filter(|m| m.reserved && !m.in_game)
            .map(|m| m.id.clone())
            .collect()
    }

    /// First membership still waiting for a slot.
    pub fn waiting_for_slot(&self) -> Option<&str> {
        self.memberships
            .values()
            .find(|m| !m.reserved && !m.leaving)
            .map(|m| m.id.as_str())
    }

    /// Gives a freed slot to a waiting membership.
    pub fn grant(&mut self, id: &str) {
        if let Some(m) = self.memberships.get_mut(id) {
            debug!(tournament = id, "reservation granted");
            m.reserved = true;
        }
    }

    /// A game of `id` starts. Returns `true` when it takes the tournament's reservation.
    pub fn game_started(&mut self, id: &str) -> bool {
        match self.memberships.get_mut(id) {
            Some(m) if !m.in_game => {
                m.in_game = true;
                let used = m.reserved;
                m.reserved = true;
                used
            }
            _ => false,
        }
    }

    /// A game of `id` ended. Returns `true` when the membership was removed.
    pub fn game_finished(&mut self, id: &str, now: OffsetDateTime) -> bool {
        let Some(m) = self.memberships.get_mut(id) else {
            return false;
        };
        m.in_game = false;
        if m.leaving || m.ends_at.is_some_and(|end| end <= now) {
            self.memberships.remove(id);
            info!(tournament = id, "tournament left");
            return true;
        }
        false
    }

    /// Removes finished tournaments without a running game.
    pub fn expire(&mut self, now: OffsetDateTime) -> Vec<String> {
        let ended = self
            .memberships
            .values()
            .filter(|m| !m.in_game && m.ends_at.is_some_and(|end| end <= now))
            .map(|m| m.id.clone())
            .collect::<Vec<_>>();
        for id in &ended {
            info!(tournament = %id, "tournament over");
            self.memberships.remove(id);
        }
        ended
    }
}
