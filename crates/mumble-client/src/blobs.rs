//! Cache of on-demand blobs: user comments, user textures, channel
//! descriptions, keyed by their 20-byte SHA-1 hash.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use bytes::Bytes;
use mumble_protocol::proto;
use tracing::warn;

/// Which field of `RequestBlob` a hash belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    UserComment,
    UserTexture,
    ChannelDescription,
}

#[derive(Default)]
struct CacheState {
    blobs: HashMap<Vec<u8>, Bytes>,
    /// Hashes requested from the server but not yet answered. Keeps a hash
    /// from being fetched more than once.
    pending: HashSet<Vec<u8>>,
}

/// Append-only blob store. Once a hash resolves its bytes never change.
#[derive(Default)]
pub struct BlobCache {
    state: Mutex<CacheState>,
}

impl BlobCache {
    pub fn get(&self, hash: &[u8]) -> Option<Bytes> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.blobs.get(hash).cloned()
    }

    pub fn contains(&self, hash: &[u8]) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.blobs.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store resolved bytes for a hash. The first write wins; the cache is
    /// append-only per hash.
    pub(crate) fn store(&self, hash: &[u8], bytes: Bytes) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.remove(hash);
        state.blobs.entry(hash.to_vec()).or_insert(bytes);
    }

    /// Build a `RequestBlob` for an unresolved hash, or `None` when the
    /// bytes are cached or already on the wire.
    pub(crate) fn request(&self, hash: &[u8], kind: BlobKind) -> Option<proto::RequestBlob> {
        if hash.len() != 20 {
            warn!(len = hash.len(), "ignoring blob hash of unexpected length");
            return None;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.blobs.contains_key(hash) || !state.pending.insert(hash.to_vec()) {
            return None;
        }

        // The wire carries SHA-1 hashes as five big-endian u32 words.
        let words: Vec<u32> = hash
            .chunks_exact(4)
            .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
            .collect();

        let mut request = proto::RequestBlob::default();
        match kind {
            BlobKind::UserComment => request.session_comment = words,
            BlobKind::UserTexture => request.session_texture = words,
            BlobKind::ChannelDescription => request.channel_description = words,
        }
        Some(request)
    }

    pub(crate) fn clear_pending(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.clear();
    }
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache").field("len", &self.len()).finish()
    }
}
