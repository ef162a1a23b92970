//! Driver API correlator.
//!
//! Each call registers a pending entry under a fresh correlation id, writes
//! a `DriverRequest` packet and waits for the matching `DriverResponse`.
//! The entry is removed exactly once: by the response or by the timeout,
//! whichever comes first. Responses arriving afterwards are dropped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use stratus_protocol::{
    DriverRequestHeader, DriverRequestType, DriverResponse, Packet, PacketChannel, PacketHeader,
    ProtocolError, TargetSelector, CURRENT_PARAMS,
};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::DriverError;

struct PendingCall {
    request_type: DriverRequestType,
    tx: oneshot::Sender<Bytes>,
}

/// Correlated request/response calls over one channel to the owning node.
#[derive(Clone)]
pub struct DriverClient {
    channel: Arc<dyn PacketChannel>,
    pending: Arc<Mutex<HashMap<Uuid, PendingCall>>>,
    timeout: Duration,
}

impl DriverClient {
    pub fn new(channel: Arc<dyn PacketChannel>) -> Self {
        Self::with_timeout(channel, CURRENT_PARAMS.driver_call_timeout())
    }

    pub fn with_timeout(channel: Arc<dyn PacketChannel>, timeout: Duration) -> Self {
        Self {
            channel,
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn channel(&self) -> &Arc<dyn PacketChannel> {
        &self.channel
    }

    /// Start a call. The request is sent even if the returned task is never
    /// awaited.
    ///
    /// `decode` only sees the payload after a success status byte.
    pub fn call<T, D>(
        &self,
        request_type: DriverRequestType,
        target: TargetSelector,
        body: Bytes,
        decode: D,
    ) -> DriverTask<T>
    where
        T: Send + 'static,
        D: FnOnce(Bytes) -> Result<T, ProtocolError> + Send + 'static,
    {
        let client = self.clone();
        DriverTask::spawn(async move {
            let payload = client.round_trip(request_type, target, body).await?;
            decode(payload).map_err(DriverError::Decode)
        })
    }

    async fn round_trip(
        &self,
        request_type: DriverRequestType,
        target: TargetSelector,
        body: Bytes,
    ) -> Result<Bytes, DriverError> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(correlation_id, PendingCall { request_type, tx });

        let packet = Packet::new(
            PacketHeader::DriverRequest(DriverRequestHeader {
                request_type,
                correlation_id,
                target,
            }),
            body,
        );

        let exchange = async {
            self.channel.send_sync(packet).await?;
            rx.await.map_err(|_| DriverError::Closed)
        };
        let outcome = tokio::time::timeout(self.timeout, exchange).await;

        // No-op when the response already claimed the entry.
        self.pending.lock().await.remove(&correlation_id);

        let body = match outcome {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!(
                    %correlation_id,
                    ?request_type,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "driver: call timed out"
                );
                return Err(DriverError::TimedOut);
            }
        };

        match DriverResponse::decode(body)? {
            DriverResponse::Success(payload) => Ok(payload),
            DriverResponse::ServiceNotFound => Err(DriverError::TargetNotFound),
        }
    }

    /// Hand a `DriverResponse` packet to its pending call.
    ///
    /// Returns false for non-response packets, late or unknown correlation
    /// ids and request type mismatches; those are dropped.
    pub async fn handle_response(&self, packet: Packet) -> bool {
        let PacketHeader::DriverResponse(header) = &packet.header else {
            return false;
        };
        let correlation_id = header.correlation_id;

        let call = {
            let mut pending = self.pending.lock().await;
            match pending.get(&correlation_id) {
                Some(call) if call.request_type == header.request_type => {
                    pending.remove(&correlation_id)
                }
                Some(call) => {
                    tracing::warn!(
                        %correlation_id,
                        expected = ?call.request_type,
                        got = ?header.request_type,
                        "driver: response type mismatch, dropped"
                    );
                    None
                }
                None => {
                    tracing::debug!(%correlation_id, "driver: late or unknown response, dropped");
                    None
                }
            }
        };

        match call {
            Some(call) => call.tx.send(packet.body).is_ok(),
            None => false,
        }
    }

    /// Fail every call still waiting for a response with `Closed`. Used
    /// when the channel to the owning node went away.
    pub async fn fail_pending(&self) -> usize {
        // dropping each sender wakes its caller
        let failed = self.pending.lock().await.drain().count();
        if failed > 0 {
            tracing::debug!(calls = failed, "driver: channel lost, failing pending calls");
        }
        failed
    }

    /// Number of calls still waiting for a response.
    pub async fn pending_calls(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Handle to an in-flight driver call.
///
/// Await it for the full outcome, or use `get_or` to substitute a default
/// when the call times out.
pub struct DriverTask<T> {
    inner: TaskInner<T>,
}

enum TaskInner<T> {
    Ready(Option<Result<T, DriverError>>),
    Running(JoinHandle<Result<T, DriverError>>),
}

// T is never pinned in place.
impl<T> Unpin for DriverTask<T> {}

impl<T: Send + 'static> DriverTask<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, DriverError>> + Send + 'static,
    {
        Self {
            inner: TaskInner::Running(tokio::spawn(future)),
        }
    }
}

impl<T> DriverTask<T> {
    /// A task that is already resolved.
    pub fn ready(result: Result<T, DriverError>) -> Self {
        Self {
            inner: TaskInner::Ready(Some(result)),
        }
    }

    /// Wait at most the call timeout; a timeout yields `default`.
    pub async fn get_or(self, default: T) -> Result<T, DriverError> {
        match self.await {
            Err(DriverError::TimedOut) => Ok(default),
            other => other,
        }
    }

    pub async fn get_or_default(self) -> Result<T, DriverError>
    where
        T: Default,
    {
        self.get_or(T::default()).await
    }
}

impl<T> Future for DriverTask<T> {
    type Output = Result<T, DriverError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            TaskInner::Ready(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Ready(Err(DriverError::Closed)),
            },
            TaskInner::Running(handle) => match Pin::new(handle).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(e)) => {
                    tracing::warn!("driver: call task failed: {e}");
                    Poll::Ready(Err(DriverError::Closed))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
