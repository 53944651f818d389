//! Cross-thread command rendezvous.
//!
//! Host threads enqueue commands; the I/O worker drains them FIFO, writes
//! the corresponding control message, and releases the completion handle.
//! Completion means *dispatched to the wire*, not acknowledged; Mumble
//! sends no correlated reply for most mutations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use mumble_protocol::control::{encode_message, MessageKind};
use mumble_protocol::proto;
use tokio::sync::{mpsc, oneshot};

use crate::error::ClientError;

/// Commands queued ahead of this are back-pressured onto the submitter.
const COMMAND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub(crate) enum CommandKind {
    /// Move a user (the local one included) to a channel.
    MoveUser { session: u32, channel_id: u32 },
    /// Any user-state mutation: mute/deafen/suppress/recording, comment,
    /// texture, registration.
    ModUserState(proto::UserState),
    SendTextMessage(proto::TextMessage),
    CreateChannel {
        parent: u32,
        name: String,
        temporary: bool,
    },
    RemoveChannel { channel_id: u32 },
    SetVoiceTarget { id: u32, sessions: Vec<u32> },
    RequestBlob(proto::RequestBlob),
}

impl CommandKind {
    /// Serialise to a complete control frame.
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            CommandKind::MoveUser { session, channel_id } => {
                let msg = proto::UserState {
                    session: Some(*session),
                    channel_id: Some(*channel_id),
                    ..Default::default()
                };
                encode_message(MessageKind::UserState, &msg)
            }
            CommandKind::ModUserState(msg) => encode_message(MessageKind::UserState, msg),
            CommandKind::SendTextMessage(msg) => encode_message(MessageKind::TextMessage, msg),
            CommandKind::CreateChannel {
                parent,
                name,
                temporary,
            } => {
                let msg = proto::ChannelState {
                    parent: Some(*parent),
                    name: Some(name.clone()),
                    temporary: Some(*temporary),
                    ..Default::default()
                };
                encode_message(MessageKind::ChannelState, &msg)
            }
            CommandKind::RemoveChannel { channel_id } => {
                let msg = proto::ChannelRemove {
                    channel_id: *channel_id,
                };
                encode_message(MessageKind::ChannelRemove, &msg)
            }
            CommandKind::SetVoiceTarget { id, sessions } => {
                let msg = proto::VoiceTarget {
                    id: Some(*id),
                    targets: vec![proto::voice_target::Target {
                        session: sessions.clone(),
                        ..Default::default()
                    }],
                };
                encode_message(MessageKind::VoiceTarget, &msg)
            }
            CommandKind::RequestBlob(msg) => encode_message(MessageKind::RequestBlob, msg),
        }
    }
}

#[derive(Debug)]
pub(crate) struct QueuedCommand {
    pub id: u64,
    pub kind: CommandKind,
    pub done: oneshot::Sender<Result<(), ClientError>>,
}

impl QueuedCommand {
    pub(crate) fn complete(self, result: Result<(), ClientError>) {
        // the submitter may have dropped its handle; that is fine
        let _ = self.done.send(result);
    }
}

/// Waitable completion signal for one submitted command.
#[derive(Debug)]
pub struct CommandHandle {
    id: u64,
    done: oneshot::Receiver<Result<(), ClientError>>,
}

impl CommandHandle {
    /// Session-wide monotonically increasing command id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the command was written to the wire (or failed).
    pub async fn wait(self) -> Result<(), ClientError> {
        self.done.await.unwrap_or(Err(ClientError::Disconnected))
    }

    /// Like [`wait`](Self::wait), bounded by a timeout.
    pub async fn wait_timeout(self, timeout: std::time::Duration) -> Result<(), ClientError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

pub(crate) struct CommandQueue {
    tx: mpsc::Sender<QueuedCommand>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl CommandQueue {
    pub(crate) fn new() -> (Self, mpsc::Receiver<QueuedCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        (
            CommandQueue {
                tx,
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    fn next(&self, kind: CommandKind) -> Result<(QueuedCommand, CommandHandle), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::NotConnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (done_tx, done_rx) = oneshot::channel();
        Ok((
            QueuedCommand {
                id,
                kind,
                done: done_tx,
            },
            CommandHandle { id, done: done_rx },
        ))
    }

    /// Enqueue, waiting for queue space.
    pub(crate) async fn submit(&self, kind: CommandKind) -> Result<CommandHandle, ClientError> {
        let (cmd, handle) = self.next(kind)?;
        self.tx
            .send(cmd)
            .await
            .map_err(|_| ClientError::NotConnected)?;
        Ok(handle)
    }

    /// Enqueue without blocking; used from code that holds a shadow lock.
    pub(crate) fn try_submit(&self, kind: CommandKind) -> Result<CommandHandle, ClientError> {
        let (cmd, handle) = self.next(kind)?;
        self.tx
            .try_send(cmd)
            .map_err(|_| ClientError::NotConnected)?;
        Ok(handle)
    }

    /// Refuse all future submissions.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
