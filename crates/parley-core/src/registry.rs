//! Session registry for the hub.
//!
//! Sessions live in an arena of slots addressed by a generation-checked
//! handle. Removing a session bumps its slot's generation, so a stale handle
//! can never reach a session that later reuses the slot.

use crate::message::UserId;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Every slot index is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Session registry is full ({limit} slots)")]
pub struct RegistryFull {
    /// Number of slots the registry may hold.
    pub limit: usize,
}

/// Opaque handle to a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    #[cfg(test)]
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}.{}", self.index, self.generation)
    }
}

/// A registered session.
///
/// The registry holds the only sender of the session's outbound queue;
/// dropping the entry closes the queue.
#[derive(Debug)]
pub struct SessionEntry {
    /// Authenticated user.
    pub user_id: UserId,
    /// Outbound frame queue drained by the session's writer.
    pub outbound: mpsc::Sender<String>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<SessionEntry>,
}

/// Arena of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
    slot_limit: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_slot_limit(u32::MAX as usize)
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry holding at most `slot_limit` slots.
    ///
    /// Limits above `u32::MAX` are clamped so every index fits a handle.
    #[must_use]
    pub fn with_slot_limit(slot_limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            slot_limit: slot_limit.min(u32::MAX as usize),
        }
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a session and return its handle.
    ///
    /// # Errors
    ///
    /// Returns `RegistryFull` when no slot is free and the arena is at its
    /// limit. The entry is dropped, which closes its outbound queue.
    pub fn insert(&mut self, entry: SessionEntry) -> Result<SessionHandle, RegistryFull> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            self.len += 1;
            return Ok(SessionHandle {
                index,
                generation: slot.generation,
            });
        }

        let index = match u32::try_from(self.slots.len()) {
            Ok(index) if self.slots.len() < self.slot_limit => index,
            _ => {
                return Err(RegistryFull {
                    limit: self.slot_limit,
                })
            }
        };
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        self.len += 1;
        Ok(SessionHandle {
            index,
            generation: 0,
        })
    }

    /// Remove a session.
    ///
    /// Returns `None` for handles that are stale or were never issued.
    pub fn remove(&mut self, handle: SessionHandle) -> Option<SessionEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }

        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(entry)
    }

    /// Iterate over live sessions.
    pub fn iter(&self) -> impl Iterator<Item = (SessionHandle, &SessionEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    SessionHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }
}
