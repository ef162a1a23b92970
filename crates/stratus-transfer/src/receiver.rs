//! Chunk receiver -- reassembles chunk sessions into sinks.
//!
//! Chunks of a session arrive in send order on one channel, so a session only
//! tracks the next expected index. Anything unexpected discards the session.

use std::collections::HashMap;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use stratus_protocol::{ChannelId, ChunkHeader, TransferHeader};
use uuid::Uuid;

use crate::sink::{ResourceSink, SinkFactory};
use crate::TransferError;

/// A session whose terminal chunk arrived and whose sink was finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTransfer {
    pub session_id: Uuid,
    pub channel_id: ChannelId,
    pub transfer: TransferHeader,
    pub chunks: u32,
    pub total_bytes: u64,
}

struct OpenSession {
    channel_id: ChannelId,
    transfer: TransferHeader,
    sink: Box<dyn ResourceSink>,
    next_index: u32,
    received: u64,
    hasher: Sha256,
}

impl OpenSession {
    fn resource(&self) -> String {
        self.transfer.template.to_string()
    }
}

pub struct ChunkReceiver<F: SinkFactory> {
    factory: F,
    sessions: HashMap<Uuid, OpenSession>,
}

impl<F: SinkFactory> ChunkReceiver<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
        }
    }

    /// Number of sessions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.sessions.len()
    }

    /// Feed one chunk. Returns the completed transfer on the terminal chunk.
    pub async fn handle_chunk(
        &mut self,
        channel_id: ChannelId,
        header: ChunkHeader,
        body: Bytes,
    ) -> Result<Option<CompletedTransfer>, TransferError> {
        let session_id = header.session_id;

        if header.aborted {
            if let Some(session) = self.sessions.remove(&session_id) {
                tracing::warn!(
                    %session_id,
                    resource = %session.resource(),
                    "transfer: sender aborted session, discarding"
                );
                session.sink.discard().await;
            }
            return Err(TransferError::Aborted(session_id));
        }

        if header.index == 0 {
            if let Some(existing) = self.sessions.remove(&session_id) {
                existing.sink.discard().await;
                return Err(TransferError::DuplicateSession(session_id));
            }
            let transfer = header
                .transfer
                .clone()
                .ok_or(TransferError::MissingTransferHeader(session_id))?;
            let sink = self
                .factory
                .open(&transfer)
                .await
                .map_err(|source| TransferError::Sink {
                    resource: transfer.template.to_string(),
                    source,
                })?;
            tracing::debug!(
                %session_id,
                channel_id,
                resource = %transfer.template,
                pre_clear = transfer.pre_clear,
                "transfer: session opened"
            );
            self.sessions.insert(
                session_id,
                OpenSession {
                    channel_id,
                    transfer,
                    sink,
                    next_index: 0,
                    received: 0,
                    hasher: Sha256::new(),
                },
            );
        }

        let mut session =
            self.sessions
                .remove(&session_id)
                .ok_or(TransferError::UnknownSession {
                    session_id,
                    index: header.index,
                })?;

        if header.index != session.next_index {
            let expected = session.next_index;
            session.sink.discard().await;
            return Err(TransferError::OutOfOrder {
                session_id,
                expected,
                got: header.index,
            });
        }

        if !body.is_empty() {
            if let Err(source) = session.sink.write(&body).await {
                let resource = session.resource();
                session.sink.discard().await;
                return Err(TransferError::Sink { resource, source });
            }
            session.hasher.update(&body);
            session.received += body.len() as u64;
        }
        session.next_index += 1;

        if !header.terminal {
            self.sessions.insert(session_id, session);
            return Ok(None);
        }

        Self::finish(session_id, session, &header).await.map(Some)
    }

    async fn finish(
        session_id: Uuid,
        session: OpenSession,
        header: &ChunkHeader,
    ) -> Result<CompletedTransfer, TransferError> {
        let OpenSession {
            channel_id,
            transfer,
            sink,
            next_index,
            received,
            hasher,
        } = session;

        let digest = hex::encode(hasher.finalize());
        let mismatch = match (header.total_bytes, header.sha256.as_deref()) {
            (Some(total), _) if total != received => {
                Some(format!("expected {total} bytes, received {received}"))
            }
            (_, Some(expected)) if expected != digest => {
                Some(format!("sha256 mismatch: expected {expected}, got {digest}"))
            }
            _ => None,
        };
        if let Some(reason) = mismatch {
            sink.discard().await;
            return Err(TransferError::Integrity { session_id, reason });
        }

        sink.finalize().await.map_err(|source| TransferError::Sink {
            resource: transfer.template.to_string(),
            source,
        })?;

        tracing::info!(
            %session_id,
            resource = %transfer.template,
            chunks = next_index,
            bytes = received,
            "transfer: resource installed"
        );

        Ok(CompletedTransfer {
            session_id,
            channel_id,
            transfer,
            chunks: next_index,
            total_bytes: received,
        })
    }

    /// Discard every session that arrived on `channel_id`. Used when the
    /// channel went away mid-transfer.
    pub async fn abort_channel(&mut self, channel_id: ChannelId) -> usize {
        let doomed: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.channel_id == channel_id)
            .map(|(id, _)| *id)
            .collect();

        for session_id in &doomed {
            if let Some(session) = self.sessions.remove(session_id) {
                tracing::warn!(
                    %session_id,
                    channel_id,
                    resource = %session.resource(),
                    "transfer: channel lost mid-session, discarding"
                );
                session.sink.discard().await;
            }
        }
        doomed.len()
    }

    /// Discard every session in flight.
    pub async fn abort_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.sink.discard().await;
        }
    }
}
