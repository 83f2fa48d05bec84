//! Ephemeral awareness state.
//!
//! Awareness updates (cursor, selection, user profile) are decoded and
//! applied to an [`AwarenessState`] owned by a single relay invocation.
//! Nothing here is persisted or forwarded to other connections.
//!
//! ```text
//! ┌──────────┬─────────────────────────────────────────────────┐
//! │ count    │ count × entry                                   │
//! │ varUint  │ clientId varUint, clock varUint, state varString│
//! └──────────┴─────────────────────────────────────────────────┘
//! ```
//!
//! A state of `"null"` marks the client as gone.

use std::collections::HashMap;

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::protocol::ProtocolError;

const NULL_STATE: &str = "null";

// ───────────────────────────────────────────────────────────────────
// Wire entries
// ───────────────────────────────────────────────────────────────────

/// One client's entry in an awareness update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u32,
    /// JSON-encoded state, `"null"` when the client left
    pub state: String,
}

impl AwarenessEntry {
    pub fn is_removal(&self) -> bool {
        self.state == NULL_STATE
    }
}

fn invalid(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::InvalidAwareness(e.to_string())
}

/// Decode an awareness update payload.
pub fn decode_update(payload: &[u8]) -> Result<Vec<AwarenessEntry>, ProtocolError> {
    let mut cursor = Cursor::new(payload);

    let count: u32 = cursor.read_var().map_err(invalid)?;
    let mut entries = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let client_id: u64 = cursor.read_var().map_err(invalid)?;
        let clock: u32 = cursor.read_var().map_err(invalid)?;
        let state = cursor.read_string().map_err(invalid)?.to_string();
        entries.push(AwarenessEntry {
            client_id,
            clock,
            state,
        });
    }
    Ok(entries)
}

/// Encode entries into an awareness update payload.
pub fn encode_update(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_var(entries.len() as u32);
    for entry in entries {
        buf.write_var(entry.client_id);
        buf.write_var(entry.clock);
        buf.write_string(&entry.state);
    }
    buf
}

// ───────────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct ClientState {
    clock: u32,
    state: String,
}

/// Client ids touched by one [`AwarenessState::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// In-memory awareness of known clients.
#[derive(Debug, Default)]
pub struct AwarenessState {
    clients: HashMap<u64, ClientState>,
}

impl AwarenessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply decoded entries. A newer clock wins; at an equal clock only a
    /// removal is accepted.
    pub fn apply(&mut self, entries: Vec<AwarenessEntry>) -> AwarenessChanges {
        let mut changes = AwarenessChanges::default();

        for entry in entries {
            let current = self.clients.get(&entry.client_id);
            let existed = current.is_some();
            let accept = match current {
                None => true,
                Some(c) => c.clock < entry.clock || (c.clock == entry.clock && entry.is_removal()),
            };
            if !accept {
                log::trace!("Ignoring stale awareness for client {}", entry.client_id);
                continue;
            }

            if entry.is_removal() {
                if self.clients.remove(&entry.client_id).is_some() {
                    changes.removed.push(entry.client_id);
                }
                continue;
            }

            self.clients.insert(
                entry.client_id,
                ClientState {
                    clock: entry.clock,
                    state: entry.state,
                },
            );
            if existed {
                changes.updated.push(entry.client_id);
            } else {
                changes.added.push(entry.client_id);
            }
        }
        changes
    }

    /// Decode an awareness payload and apply it.
    pub fn apply_update(&mut self, payload: &[u8]) -> Result<AwarenessChanges, ProtocolError> {
        let changes = self.apply(decode_update(payload)?);
        log::trace!(
            "Awareness: +{} ~{} -{}",
            changes.added.len(),
            changes.updated.len(),
            changes.removed.len()
        );
        Ok(changes)
    }

    pub fn state_of(&self, client_id: u64) -> Option<&str> {
        self.clients.get(&client_id).map(|c| c.state.as_str())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
