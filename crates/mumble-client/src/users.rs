//! Shadow of the server's user table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use mumble_audio::SoundQueue;
use mumble_protocol::proto;
use mumble_protocol::voice::AudioData;
use tracing::{debug, warn};

use crate::blobs::BlobKind;
use crate::callbacks::Callbacks;

/// Sentinel for "local session id not assigned yet".
const NO_SESSION: u32 = u32::MAX;

/// Server-known state of one connected user.
#[derive(Debug, Clone)]
pub struct User {
    pub session: u32,
    pub name: String,
    pub channel_id: u32,
    /// Registered user id, when the user has a server account.
    pub user_id: Option<u32>,
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub priority_speaker: bool,
    pub recording: bool,
    /// Certificate hash.
    pub hash: Option<String>,
    pub comment_hash: Option<Vec<u8>>,
    pub texture_hash: Option<Vec<u8>>,
    /// This user's inbound audio queue.
    pub sound: Arc<SoundQueue>,
}

impl User {
    fn new(session: u32, receive_sound: bool) -> Self {
        let sound = Arc::new(SoundQueue::new());
        sound.set_receive_sound(receive_sound);
        User {
            session,
            name: String::new(),
            channel_id: 0,
            user_id: None,
            mute: false,
            deaf: false,
            suppress: false,
            self_mute: false,
            self_deaf: false,
            priority_speaker: false,
            recording: false,
            hash: None,
            comment_hash: None,
            texture_hash: None,
            sound,
        }
    }
}

/// Attribute tags used in update diffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserField {
    Name,
    ChannelId,
    UserId,
    Mute,
    Deaf,
    Suppress,
    SelfMute,
    SelfDeaf,
    PrioritySpeaker,
    Recording,
    Hash,
    CommentHash,
    TextureHash,
}

/// A blob referenced by a state message: either the bytes came inline, or
/// they need to be fetched by hash.
#[derive(Debug)]
pub(crate) struct BlobAction {
    pub hash: Vec<u8>,
    pub kind: BlobKind,
    pub inline: Option<Bytes>,
}

/// The user table. Holds its own lock; create/update/remove callbacks run
/// while that lock is held.
pub struct Users {
    table: Mutex<HashMap<u32, User>>,
    local_session: AtomicU32,
    receive_sound: AtomicBool,
}

impl Users {
    pub(crate) fn new(receive_sound: bool) -> Self {
        Users {
            table: Mutex::new(HashMap::new()),
            local_session: AtomicU32::new(NO_SESSION),
            receive_sound: AtomicBool::new(receive_sound),
        }
    }

    /// Session id of the local connection, once `ServerSync` arrived.
    pub fn local_session(&self) -> Option<u32> {
        match self.local_session.load(Ordering::Acquire) {
            NO_SESSION => None,
            session => Some(session),
        }
    }

    pub(crate) fn set_local_session(&self, session: u32) {
        self.local_session.store(session, Ordering::Release);
    }

    /// Snapshot of the local user, if it is known yet.
    pub fn myself(&self) -> Option<User> {
        self.get(self.local_session()?)
    }

    pub fn get(&self, session: u32) -> Option<User> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.get(&session).cloned()
    }

    pub fn snapshot(&self) -> Vec<User> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.len()
    }

    /// Users currently in the given channel.
    pub fn in_channel(&self, channel_id: u32) -> Vec<User> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .values()
            .filter(|user| user.channel_id == channel_id)
            .cloned()
            .collect()
    }

    /// Toggle keeping received audio, for every user's queue and for users
    /// created later.
    pub fn set_receive_sound(&self, value: bool) {
        self.receive_sound.store(value, Ordering::Relaxed);
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        for user in table.values() {
            user.sound.set_receive_sound(value);
        }
    }

    /// Apply a `UserState`, firing the create/update callback under the
    /// table lock. Returns the blob work the message implies.
    pub(crate) fn apply_state(
        &self,
        msg: &proto::UserState,
        callbacks: &Callbacks,
    ) -> Vec<BlobAction> {
        let Some(session) = msg.session else {
            warn!("UserState without a session id");
            return Vec::new();
        };

        let mut actions = Vec::new();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let created = !table.contains_key(&session);
        let user = table
            .entry(session)
            .or_insert_with(|| User::new(session, self.receive_sound.load(Ordering::Relaxed)));

        let mut diff = Vec::new();
        apply_field(&mut user.name, msg.name.clone(), UserField::Name, &mut diff);
        apply_field(
            &mut user.channel_id,
            msg.channel_id,
            UserField::ChannelId,
            &mut diff,
        );
        apply_opt_field(&mut user.user_id, msg.user_id, UserField::UserId, &mut diff);
        apply_field(&mut user.mute, msg.mute, UserField::Mute, &mut diff);
        apply_field(&mut user.deaf, msg.deaf, UserField::Deaf, &mut diff);
        apply_field(&mut user.suppress, msg.suppress, UserField::Suppress, &mut diff);
        apply_field(&mut user.self_mute, msg.self_mute, UserField::SelfMute, &mut diff);
        apply_field(&mut user.self_deaf, msg.self_deaf, UserField::SelfDeaf, &mut diff);
        apply_field(
            &mut user.priority_speaker,
            msg.priority_speaker,
            UserField::PrioritySpeaker,
            &mut diff,
        );
        apply_field(&mut user.recording, msg.recording, UserField::Recording, &mut diff);
        apply_opt_field(&mut user.hash, msg.hash.clone(), UserField::Hash, &mut diff);

        if let Some(hash) = &msg.comment_hash {
            let inline = msg.comment.as_ref().map(|c| Bytes::from(c.clone().into_bytes()));
            if user.comment_hash.as_ref() != Some(hash) {
                user.comment_hash = Some(hash.clone());
                if inline.is_none() {
                    diff.push(UserField::CommentHash);
                }
            }
            actions.push(BlobAction {
                hash: hash.clone(),
                kind: BlobKind::UserComment,
                inline,
            });
        }
        if let Some(hash) = &msg.texture_hash {
            let inline = msg.texture.as_ref().map(|t| Bytes::from(t.clone()));
            if user.texture_hash.as_ref() != Some(hash) {
                user.texture_hash = Some(hash.clone());
                if inline.is_none() {
                    diff.push(UserField::TextureHash);
                }
            }
            actions.push(BlobAction {
                hash: hash.clone(),
                kind: BlobKind::UserTexture,
                inline,
            });
        }

        if created {
            callbacks.fire_user_created(user);
        } else if !diff.is_empty() {
            callbacks.fire_user_updated(user, &diff);
        }

        actions
    }

    /// Remove a user, firing the removal callback under the table lock.
    pub(crate) fn remove(&self, msg: &proto::UserRemove, callbacks: &Callbacks) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(user) = table.remove(&msg.session) {
            callbacks.fire_user_removed(&user);
        }
    }

    /// Route one decoded voice packet to the sender's queue, firing the
    /// sound callback per stored frame.
    pub(crate) fn dispatch_voice(&self, audio: &AudioData, callbacks: &Callbacks) {
        let Some(session) = audio.session else {
            return;
        };

        let user = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            match table.get(&session) {
                Some(user) => user.clone(),
                None => {
                    debug!(session, "voice packet from unknown session");
                    return;
                }
            }
        };

        for (i, frame) in audio.frames.iter().enumerate() {
            let sequence = audio.sequence + i as i64;
            if let Some(chunk) = user.sound.add(frame, sequence, audio.codec, audio.target) {
                callbacks.fire_sound_received(&user, &chunk);
            }
        }
    }

    pub(crate) fn clear(&self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.clear();
        self.local_session.store(NO_SESSION, Ordering::Release);
    }
}

impl std::fmt::Debug for Users {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Users").field("count", &self.count()).finish()
    }
}

fn apply_field<T: PartialEq>(slot: &mut T, value: Option<T>, field: UserField, diff: &mut Vec<UserField>) {
    if let Some(value) = value {
        if *slot != value {
            *slot = value;
            diff.push(field);
        }
    }
}

fn apply_opt_field<T: PartialEq>(
    slot: &mut Option<T>,
    value: Option<T>,
    field: UserField,
    diff: &mut Vec<UserField>,
) {
    if let Some(value) = value {
        if slot.as_ref() != Some(&value) {
            *slot = Some(value);
            diff.push(field);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn state(session: u32) -> proto::UserState {
        proto::UserState {
            session: Some(session),
            ..Default::default()
        }
    }

    #[test]
    fn first_sight_fires_created() {
        let users = Users::new(false);
        let callbacks = Callbacks::default();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        callbacks.on_user_created(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut msg = state(7);
        msg.name = Some("alice".into());
        users.apply_state(&msg, &callbacks);

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(users.get(7).unwrap().name, "alice");
        assert_eq!(users.count(), 1);
    }

    #[test]
    fn identical_update_yields_no_diff() {
        let users = Users::new(false);
        let callbacks = Callbacks::default();
        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        callbacks.on_user_updated(move |_, diff| {
            assert!(!diff.is_empty());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut msg = state(7);
        msg.self_mute = Some(true);
        users.apply_state(&msg, &callbacks); // created
        users.apply_state(&msg, &callbacks); // identical, no diff
        assert_eq!(updates.load(Ordering::SeqCst), 0);

        msg.self_mute = Some(false);
        users.apply_state(&msg, &callbacks);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn diff_excludes_hash_when_bytes_are_inline() {
        let users = Users::new(false);
        let callbacks = Callbacks::default();
        let fields: Arc<Mutex<Vec<UserField>>> = Arc::default();
        let sink = fields.clone();
        callbacks.on_user_updated(move |_, diff| {
            sink.lock().unwrap().extend_from_slice(diff);
        });

        users.apply_state(&state(1), &callbacks);

        // comment with inline bytes: blob action yes, diff entry no
        let mut msg = state(1);
        msg.comment_hash = Some(vec![0xAA; 20]);
        msg.comment = Some("hello".into());
        let actions = users.apply_state(&msg, &callbacks);
        assert_eq!(actions.len(), 1);
        assert!(actions[0].inline.is_some());
        assert!(fields.lock().unwrap().is_empty());

        // a new hash without inline bytes lands in the diff
        let mut msg = state(1);
        msg.comment_hash = Some(vec![0xBB; 20]);
        let actions = users.apply_state(&msg, &callbacks);
        assert!(actions[0].inline.is_none());
        assert_eq!(fields.lock().unwrap().as_slice(), &[UserField::CommentHash]);
    }

    #[test]
    fn remove_fires_callback_and_drops_user() {
        let users = Users::new(false);
        let callbacks = Callbacks::default();
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = removed.clone();
        callbacks.on_user_removed(move |user| {
            assert_eq!(user.session, 3);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        users.apply_state(&state(3), &callbacks);
        users.remove(
            &proto::UserRemove {
                session: 3,
                ..Default::default()
            },
            &callbacks,
        );

        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(users.get(3).is_none());
        // removing an unknown session is a no-op
        users.remove(
            &proto::UserRemove {
                session: 3,
                ..Default::default()
            },
            &callbacks,
        );
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn myself_follows_local_session() {
        let users = Users::new(false);
        let callbacks = Callbacks::default();
        assert!(users.myself().is_none());

        users.set_local_session(9);
        assert!(users.myself().is_none()); // no UserState for it yet

        users.apply_state(&state(9), &callbacks);
        assert_eq!(users.myself().unwrap().session, 9);
    }

    #[test]
    fn in_channel_filters_by_channel() {
        let users = Users::new(false);
        let callbacks = Callbacks::default();
        for (session, channel) in [(1, 0), (2, 5), (3, 5)] {
            let mut msg = state(session);
            msg.channel_id = Some(channel);
            users.apply_state(&msg, &callbacks);
        }

        let mut sessions: Vec<u32> = users.in_channel(5).iter().map(|u| u.session).collect();
        sessions.sort_unstable();
        assert_eq!(sessions, vec![2, 3]);
    }

    #[test]
    fn receive_sound_flag_reaches_queues() {
        let users = Users::new(false);
        let callbacks = Callbacks::default();
        users.apply_state(&state(1), &callbacks);
        assert!(!users.get(1).unwrap().sound.receive_sound());

        users.set_receive_sound(true);
        assert!(users.get(1).unwrap().sound.receive_sound());

        // users created afterwards inherit the flag
        users.apply_state(&state(2), &callbacks);
        assert!(users.get(2).unwrap().sound.receive_sound());
    }
}
