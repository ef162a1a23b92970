//! Chunk sender -- splits a byte stream into one chunk session.

use std::future::Future;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use stratus_protocol::{ChannelError, ChunkHeader, Packet, PacketHeader, TransferHeader, CHUNK_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::{Pacing, TransferError};

/// Outcome of a completed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub session_id: Uuid,
    /// Chunks emitted, terminal chunk included.
    pub chunks: u32,
    pub total_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ChunkSender {
    chunk_size: usize,
    pacing: Pacing,
}

impl Default for ChunkSender {
    fn default() -> Self {
        Self::new(CHUNK_SIZE, Pacing::default())
    }
}

impl ChunkSender {
    pub fn new(chunk_size: usize, pacing: Pacing) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pacing,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    /// Stream `source` as one chunk session.
    ///
    /// `wrap` selects the routing tag, `emit` hands each packet to the
    /// transport. A read or emit failure aborts the session: an aborted chunk
    /// is emitted best-effort and the failure is returned.
    pub async fn send<R, E, Fut>(
        &self,
        mut source: R,
        transfer: TransferHeader,
        wrap: fn(ChunkHeader) -> PacketHeader,
        mut emit: E,
    ) -> Result<TransferSummary, TransferError>
    where
        R: AsyncRead + Unpin,
        E: FnMut(Packet) -> Fut,
        Fut: Future<Output = Result<(), ChannelError>>,
    {
        let session_id = Uuid::new_v4();
        let mut transfer = Some(transfer);
        let mut hasher = Sha256::new();
        let mut total_bytes = 0u64;
        let mut index = 0u32;
        let mut buf = vec![0u8; self.chunk_size];

        tracing::debug!(
            %session_id,
            chunk_size = self.chunk_size,
            "transfer: session started"
        );

        loop {
            let read = match read_full(&mut source, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(%session_id, index, "transfer: source read failed: {e}");
                    emit_abort(session_id, index, wrap, &mut emit).await;
                    return Err(TransferError::Source(e));
                }
            };
            if read == 0 {
                break;
            }

            hasher.update(&buf[..read]);
            total_bytes += read as u64;

            let mut header = ChunkHeader::data(session_id, index);
            header.transfer = transfer.take();
            let packet = Packet::new(wrap(header), Bytes::copy_from_slice(&buf[..read]));

            if let Err(e) = emit(packet).await {
                tracing::warn!(%session_id, index, "transfer: emit failed: {e}");
                emit_abort(session_id, index, wrap, &mut emit).await;
                return Err(TransferError::Emit(e));
            }
            index += 1;

            if self.pacing.should_pause(index) {
                tokio::time::sleep(self.pacing.delay).await;
            }
        }

        let sha256 = hex::encode(hasher.finalize());
        let mut terminal = ChunkHeader::data(session_id, index);
        terminal.terminal = true;
        // Only still present when the source was empty.
        terminal.transfer = transfer.take();
        terminal.total_bytes = Some(total_bytes);
        terminal.sha256 = Some(sha256.clone());

        if let Err(e) = emit(Packet::header_only(wrap(terminal))).await {
            tracing::warn!(%session_id, index, "transfer: terminal emit failed: {e}");
            emit_abort(session_id, index, wrap, &mut emit).await;
            return Err(TransferError::Emit(e));
        }

        let summary = TransferSummary {
            session_id,
            chunks: index + 1,
            total_bytes,
            sha256,
        };
        tracing::debug!(
            %session_id,
            chunks = summary.chunks,
            total_bytes,
            "transfer: session complete"
        );
        Ok(summary)
    }
}

/// Fill `buf` from `source`; short only at end of stream.
async fn read_full<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn emit_abort<E, Fut>(
    session_id: Uuid,
    index: u32,
    wrap: fn(ChunkHeader) -> PacketHeader,
    emit: &mut E,
) where
    E: FnMut(Packet) -> Fut,
    Fut: Future<Output = Result<(), ChannelError>>,
{
    let mut header = ChunkHeader::data(session_id, index);
    header.aborted = true;
    if let Err(e) = emit(Packet::header_only(wrap(header))).await {
        tracing::debug!(%session_id, "transfer: abort notice not delivered: {e}");
    }
}
