/**
 * gamelist.rs
 *
 * Servers learnt from Coordinator listings
 */

use crate::game_info::{is_compatible_revision, GameInfo};
use serde::Serialize;
use tracing::debug;

/// One known server
#[derive(Debug, Clone, Serialize)]
pub struct GameListEntry {
    pub info: GameInfo,
    /// Seen in a listing since the entry was created
    pub online: bool,
    /// Revision matches ours
    pub compatible: bool,
    /// Added by the user rather than by a listing; never expires
    pub manually_added: bool,
    /// Listing round this entry was last refreshed in
    #[serde(skip)]
    round: u32,
}

/// Server list, keyed by join key, kept in insertion order.
#[derive(Debug, Default)]
pub struct GameList {
    entries: Vec<GameListEntry>,
    round: u32,
    revision: String,
}

impl GameList {
    /// `revision` is our own network revision, used for compatibility marking
    pub fn new(revision: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            round: 0,
            revision: revision.into(),
        }
    }

    /// Open a new listing round. Everything not refreshed before the next
    /// `remove_expired` is dropped.
    pub fn begin_refresh(&mut self) {
        self.round = self.round.wrapping_add(1);
    }

    /// Insert a listed server, or refresh the existing entry with the same join key
    pub fn add_or_refresh(&mut self, info: GameInfo) -> &GameListEntry {
        let compatible = is_compatible_revision(&self.revision, &info.server_revision);
        let round = self.round;

        let index = match self.entries.iter().position(|e| e.info.join_key == info.join_key) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.info = info;
                index
            }
            None => {
                debug!(join_key = %info.join_key, "added server to list");
                self.entries.push(GameListEntry {
                    info,
                    online: false,
                    compatible: false,
                    manually_added: false,
                    round,
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        entry.round = round;
        entry.online = true;
        entry.compatible = compatible;
        entry
    }

    /// Add a server by join key on the user's request; it survives expiry
    pub fn add_manual(&mut self, join_key: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.info.join_key == join_key) {
            entry.manually_added = true;
            return;
        }
        self.entries.push(GameListEntry {
            info: GameInfo {
                join_key: join_key.to_string(),
                ..GameInfo::default()
            },
            online: false,
            compatible: false,
            manually_added: true,
            round: self.round,
        });
    }

    /// Drop listed servers that were not refreshed in the current round.
    /// Returns how many were removed.
    pub fn remove_expired(&mut self) -> usize {
        let round = self.round;
        let before = self.entries.len();
        self.entries.retain(|e| e.manually_added || e.round == round);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "removed expired servers from list");
        }
        removed
    }

    pub fn remove(&mut self, join_key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.info.join_key != join_key);
        before != self.entries.len()
    }

    pub fn get(&self, join_key: &str) -> Option<&GameListEntry> {
        self.entries.iter().find(|e| e.info.join_key == join_key)
    }

    pub fn entries(&self) -> &[GameListEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
