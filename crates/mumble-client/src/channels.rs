//! Shadow of the server's channel tree.
//!
//! Channels refer to each other by id only; the tree is walked through the
//! table rather than through owned links.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use mumble_protocol::proto;
use tracing::warn;

use crate::blobs::BlobKind;
use crate::callbacks::Callbacks;
use crate::error::ClientError;
use crate::users::BlobAction;

/// The root channel always exists and always has id 0.
pub const ROOT_CHANNEL: u32 = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub channel_id: u32,
    /// Parent channel id; `None` for the root (and for channels whose
    /// parent was removed ahead of them).
    pub parent: Option<u32>,
    pub name: String,
    pub description: String,
    pub description_hash: Option<Vec<u8>>,
    pub temporary: bool,
    pub position: i32,
    /// Member cap; `None` means the server default applies.
    pub max_users: Option<u32>,
}

impl Channel {
    fn new(channel_id: u32) -> Self {
        Channel {
            channel_id,
            parent: None,
            name: String::new(),
            description: String::new(),
            description_hash: None,
            temporary: false,
            position: 0,
            max_users: None,
        }
    }
}

/// Attribute tags used in update diffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelField {
    Parent,
    Name,
    Description,
    DescriptionHash,
    Temporary,
    Position,
    MaxUsers,
}

/// The channel table. Holds its own lock; create/update/remove callbacks
/// run while that lock is held.
#[derive(Default)]
pub struct Channels {
    table: Mutex<HashMap<u32, Channel>>,
}

impl Channels {
    pub fn get(&self, channel_id: u32) -> Option<Channel> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.get(&channel_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Channel> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.len()
    }

    /// Walk the tree from the root, matching child names level by level.
    pub fn find_by_tree<I, S>(&self, path: I) -> Result<Channel, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut current = table
            .get(&ROOT_CHANNEL)
            .ok_or_else(|| ClientError::UnknownChannel("root".into()))?
            .channel_id;

        for name in path {
            let name = name.as_ref();
            current = table
                .values()
                .find(|channel| channel.parent == Some(current) && channel.name == name)
                .ok_or_else(|| ClientError::UnknownChannel(name.to_string()))?
                .channel_id;
        }

        Ok(table[&current].clone())
    }

    /// First channel with the given name, anywhere in the tree. An empty
    /// name returns the root.
    pub fn find_by_name(&self, name: &str) -> Result<Channel, ClientError> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if name.is_empty() {
            return table
                .get(&ROOT_CHANNEL)
                .cloned()
                .ok_or_else(|| ClientError::UnknownChannel("root".into()));
        }
        table
            .values()
            .find(|channel| channel.name == name)
            .cloned()
            .ok_or_else(|| ClientError::UnknownChannel(name.to_string()))
    }

    /// Direct children of a channel.
    pub fn children(&self, channel_id: u32) -> Vec<Channel> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .values()
            .filter(|channel| channel.parent == Some(channel_id))
            .cloned()
            .collect()
    }

    /// Ancestry of a channel, root first, the channel itself last.
    pub fn get_tree(&self, channel_id: u32) -> Result<Vec<Channel>, ClientError> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut current = table
            .get(&channel_id)
            .ok_or_else(|| ClientError::UnknownChannel(channel_id.to_string()))?;

        let mut chain = vec![current.clone()];
        // bounded by the table size, so a corrupt parent link cannot loop
        for _ in 0..table.len() {
            let Some(parent) = current.parent else {
                break;
            };
            match table.get(&parent) {
                Some(channel) => {
                    chain.push(channel.clone());
                    current = channel;
                }
                None => {
                    warn!(channel_id, parent, "channel has a dangling parent link");
                    break;
                }
            }
        }

        chain.reverse();
        Ok(chain)
    }

    /// Apply a `ChannelState`, firing the create/update callback under the
    /// table lock. Returns the blob work the message implies.
    pub(crate) fn apply_state(
        &self,
        msg: &proto::ChannelState,
        callbacks: &Callbacks,
    ) -> Vec<BlobAction> {
        let Some(channel_id) = msg.channel_id else {
            warn!("ChannelState without a channel id");
            return Vec::new();
        };

        let mut actions = Vec::new();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let created = !table.contains_key(&channel_id);
        let channel = table
            .entry(channel_id)
            .or_insert_with(|| Channel::new(channel_id));

        let mut diff = Vec::new();
        if let Some(parent) = msg.parent {
            if channel.parent != Some(parent) {
                channel.parent = Some(parent);
                diff.push(ChannelField::Parent);
            }
        }
        if let Some(name) = &msg.name {
            if channel.name != *name {
                channel.name = name.clone();
                diff.push(ChannelField::Name);
            }
        }
        if let Some(description) = &msg.description {
            if channel.description != *description {
                channel.description = description.clone();
                diff.push(ChannelField::Description);
            }
        }
        if let Some(temporary) = msg.temporary {
            if channel.temporary != temporary {
                channel.temporary = temporary;
                diff.push(ChannelField::Temporary);
            }
        }
        if let Some(position) = msg.position {
            if channel.position != position {
                channel.position = position;
                diff.push(ChannelField::Position);
            }
        }
        if let Some(max_users) = msg.max_users {
            if channel.max_users != Some(max_users) {
                channel.max_users = Some(max_users);
                diff.push(ChannelField::MaxUsers);
            }
        }
        if let Some(hash) = &msg.description_hash {
            let inline = msg
                .description
                .as_ref()
                .map(|d| Bytes::from(d.clone().into_bytes()));
            if channel.description_hash.as_ref() != Some(hash) {
                channel.description_hash = Some(hash.clone());
                if inline.is_none() {
                    diff.push(ChannelField::DescriptionHash);
                }
            }
            actions.push(BlobAction {
                hash: hash.clone(),
                kind: BlobKind::ChannelDescription,
                inline,
            });
        }

        if created {
            callbacks.fire_channel_created(channel);
        } else if !diff.is_empty() {
            callbacks.fire_channel_updated(channel, &diff);
        }

        actions
    }

    /// Remove a channel, firing the removal callback under the table lock.
    /// Children lose their parent link; the server sends their removes
    /// separately.
    pub(crate) fn remove(&self, channel_id: u32, callbacks: &Callbacks) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = table.remove(&channel_id) {
            for child in table.values_mut() {
                if child.parent == Some(channel_id) {
                    child.parent = None;
                }
            }
            callbacks.fire_channel_removed(&channel);
        }
    }

    pub(crate) fn clear(&self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.clear();
    }
}

impl std::fmt::Debug for Channels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channels").field("count", &self.count()).finish()
    }
}
