//! Per-connection channel table and ID allocator.
//!
//! One mutex guards the ID counter, the live channels and the bindings from
//! peer-assigned channel IDs to local ones, so allocation and lookup never
//! race. IDs start at 1 (0 means "no channel" on the wire) and are never
//! reused within a connection.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::error;

use crate::error::{ConnError, Result};

/// Anything that can live in a [`ChannelRegistry`].
pub trait Identified {
    fn channel_id(&self) -> u32;
}

#[derive(Debug)]
struct Table<C> {
    last_id: u32,
    channels: HashMap<u32, C>,
    /// Peer channel ID -> local channel ID.
    remotes: HashMap<u32, u32>,
}

#[derive(Debug)]
pub struct ChannelRegistry<C> {
    table: Mutex<Table<C>>,
}

impl<C> Default for ChannelRegistry<C> {
    fn default() -> Self {
        Self {
            table: Mutex::new(Table {
                last_id: 0,
                channels: HashMap::new(),
                remotes: HashMap::new(),
            }),
        }
    }
}

impl<C: Identified + Clone> ChannelRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table<C>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh channel ID.
    pub fn next_channel_id(&self) -> Result<u32> {
        let mut table = self.table();
        let id = table
            .last_id
            .checked_add(1)
            .ok_or(ConnError::ChannelIdsExhausted)?;
        table.last_id = id;
        Ok(id)
    }

    /// Insert `channel` under its own ID.
    pub fn register(&self, channel: C) -> Result<()> {
        let id = channel.channel_id();
        let mut table = self.table();
        if table.channels.contains_key(&id) {
            error!(channel = id, "refusing duplicate channel registration");
            return Err(ConnError::DuplicateChannel(id));
        }
        table.channels.insert(id, channel);
        Ok(())
    }

    /// Insert `channel` and bind the peer's `remote` ID to it in one step.
    pub fn register_remote(&self, remote: u32, channel: C) -> Result<()> {
        let id = channel.channel_id();
        let mut table = self.table();
        if table.channels.contains_key(&id) || table.remotes.contains_key(&remote) {
            error!(channel = id, remote, "refusing duplicate channel registration");
            return Err(ConnError::DuplicateChannel(id));
        }
        table.channels.insert(id, channel);
        table.remotes.insert(remote, id);
        Ok(())
    }

    pub fn lookup(&self, id: u32) -> Option<C> {
        self.table().channels.get(&id).cloned()
    }

    /// Find the local channel bound to the peer's channel ID.
    pub fn lookup_remote(&self, remote: u32) -> Option<C> {
        let table = self.table();
        table
            .remotes
            .get(&remote)
            .and_then(|local| table.channels.get(local))
            .cloned()
    }

    /// Remove a channel and any binding that points at it.
    pub fn remove(&self, id: u32) -> Option<C> {
        let mut table = self.table();
        let removed = table.channels.remove(&id);
        if removed.is_some() {
            table.remotes.retain(|_, local| *local != id);
        }
        removed
    }

    /// Remove every channel, returning them.
    pub fn drain(&self) -> Vec<C> {
        let mut table = self.table();
        table.remotes.clear();
        table.channels.drain().map(|(_, channel)| channel).collect()
    }

    /// Live channel IDs in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.table().channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.table().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
