//! Host-registered observers for session lifecycle events.
//!
//! One optional handler per event kind. Handlers registered for shadow
//! events (`user_*`, `channel_*`) run while the originating component's lock
//! is held: they may enqueue commands freely but must not call back into
//! that component's mutating operations.

use std::sync::Mutex;

use mumble_audio::SoundChunk;
use mumble_protocol::proto;
use mumble_protocol::MessageKind;

use crate::channels::{Channel, ChannelField};
use crate::users::{User, UserField};

type Slot<F> = Mutex<Option<Box<F>>>;

#[derive(Default)]
pub struct Callbacks {
    connected: Slot<dyn Fn() + Send + Sync>,
    disconnected: Slot<dyn Fn() + Send + Sync>,
    channel_created: Slot<dyn Fn(&Channel) + Send + Sync>,
    channel_updated: Slot<dyn Fn(&Channel, &[ChannelField]) + Send + Sync>,
    channel_removed: Slot<dyn Fn(&Channel) + Send + Sync>,
    user_created: Slot<dyn Fn(&User) + Send + Sync>,
    user_updated: Slot<dyn Fn(&User, &[UserField]) + Send + Sync>,
    user_removed: Slot<dyn Fn(&User) + Send + Sync>,
    sound_received: Slot<dyn Fn(&User, &SoundChunk) + Send + Sync>,
    text_message: Slot<dyn Fn(&proto::TextMessage) + Send + Sync>,
    permission_denied: Slot<dyn Fn(&proto::PermissionDenied) + Send + Sync>,
    acl_received: Slot<dyn Fn(&[u8]) + Send + Sync>,
    context_action: Slot<dyn Fn(&[u8]) + Send + Sync>,
    raw_control: Slot<dyn Fn(MessageKind, &[u8]) + Send + Sync>,
}

fn set<F: ?Sized>(slot: &Slot<F>, callback: Box<F>) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
}

fn fire<F: ?Sized>(slot: &Slot<F>, call: impl FnOnce(&F)) {
    let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(callback) = guard.as_deref() {
        call(callback);
    }
}

impl Callbacks {
    pub fn on_connected(&self, f: impl Fn() + Send + Sync + 'static) {
        set(&self.connected, Box::new(f));
    }

    pub fn on_disconnected(&self, f: impl Fn() + Send + Sync + 'static) {
        set(&self.disconnected, Box::new(f));
    }

    pub fn on_channel_created(&self, f: impl Fn(&Channel) + Send + Sync + 'static) {
        set(&self.channel_created, Box::new(f));
    }

    pub fn on_channel_updated(&self, f: impl Fn(&Channel, &[ChannelField]) + Send + Sync + 'static) {
        set(&self.channel_updated, Box::new(f));
    }

    pub fn on_channel_removed(&self, f: impl Fn(&Channel) + Send + Sync + 'static) {
        set(&self.channel_removed, Box::new(f));
    }

    pub fn on_user_created(&self, f: impl Fn(&User) + Send + Sync + 'static) {
        set(&self.user_created, Box::new(f));
    }

    pub fn on_user_updated(&self, f: impl Fn(&User, &[UserField]) + Send + Sync + 'static) {
        set(&self.user_updated, Box::new(f));
    }

    pub fn on_user_removed(&self, f: impl Fn(&User) + Send + Sync + 'static) {
        set(&self.user_removed, Box::new(f));
    }

    pub fn on_sound_received(&self, f: impl Fn(&User, &SoundChunk) + Send + Sync + 'static) {
        set(&self.sound_received, Box::new(f));
    }

    pub fn on_text_message(&self, f: impl Fn(&proto::TextMessage) + Send + Sync + 'static) {
        set(&self.text_message, Box::new(f));
    }

    pub fn on_permission_denied(&self, f: impl Fn(&proto::PermissionDenied) + Send + Sync + 'static) {
        set(&self.permission_denied, Box::new(f));
    }

    /// ACL answers, raw payload (the client does not interpret them).
    pub fn on_acl_received(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) {
        set(&self.acl_received, Box::new(f));
    }

    /// Context actions, raw payload (the client does not interpret them).
    pub fn on_context_action(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) {
        set(&self.context_action, Box::new(f));
    }

    /// Every control message the client does not interpret (ACL, QueryUsers,
    /// ContextActionModify, ContextAction, UserStats, ...), raw payload.
    pub fn on_raw_control(&self, f: impl Fn(MessageKind, &[u8]) + Send + Sync + 'static) {
        set(&self.raw_control, Box::new(f));
    }

    pub(crate) fn fire_connected(&self) {
        fire(&self.connected, |f| f());
    }

    pub(crate) fn fire_disconnected(&self) {
        fire(&self.disconnected, |f| f());
    }

    pub(crate) fn fire_channel_created(&self, channel: &Channel) {
        fire(&self.channel_created, |f| f(channel));
    }

    pub(crate) fn fire_channel_updated(&self, channel: &Channel, diff: &[ChannelField]) {
        fire(&self.channel_updated, |f| f(channel, diff));
    }

    pub(crate) fn fire_channel_removed(&self, channel: &Channel) {
        fire(&self.channel_removed, |f| f(channel));
    }

    pub(crate) fn fire_user_created(&self, user: &User) {
        fire(&self.user_created, |f| f(user));
    }

    pub(crate) fn fire_user_updated(&self, user: &User, diff: &[UserField]) {
        fire(&self.user_updated, |f| f(user, diff));
    }

    pub(crate) fn fire_user_removed(&self, user: &User) {
        fire(&self.user_removed, |f| f(user));
    }

    pub(crate) fn fire_sound_received(&self, user: &User, chunk: &SoundChunk) {
        fire(&self.sound_received, |f| f(user, chunk));
    }

    pub(crate) fn fire_text_message(&self, message: &proto::TextMessage) {
        fire(&self.text_message, |f| f(message));
    }

    pub(crate) fn fire_permission_denied(&self, denied: &proto::PermissionDenied) {
        fire(&self.permission_denied, |f| f(denied));
    }

    pub(crate) fn fire_acl_received(&self, payload: &[u8]) {
        fire(&self.acl_received, |f| f(payload));
    }

    pub(crate) fn fire_context_action(&self, payload: &[u8]) {
        fire(&self.context_action, |f| f(payload));
    }

    pub(crate) fn fire_raw_control(&self, kind: MessageKind, payload: &[u8]) {
        fire(&self.raw_control, |f| f(kind, payload));
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}
