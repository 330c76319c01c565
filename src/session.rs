//! Per-connection session state machine.
//!
//! A session moves strictly forward:
//!
//! ```text
//! AwaitingHandshake -> AwaitingPayload -> Computing -> Responding -> Closed
//!          \                  \               \            \
//!           +------------------+---------------+------------+--> Failed
//! ```
//!
//! Every failure is terminal. Before closing a failed session the handler
//! tries once to send an `ERROR` line, unless the stream itself broke.

use crate::adder;
use crate::codec::{self, Request, RequestDecoder};
use crate::error::{ComputeError, ProtocolError, SessionError};
use crate::matrix::Matrix;
use crate::planner::{self, ChunkAssignment};
use bytes::{Buf, BytesMut};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// After a failure reply, unread input is discarded for at most this long
/// so closing the socket does not reset the connection under the reply.
const LINGER: Duration = Duration::from_millis(250);

/// Upper bound on bytes discarded while lingering.
const LINGER_BYTES: usize = 1024 * 1024;

/// Limits applied to each session.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Deadline for receiving the handshake, and again for the payload.
    pub read_timeout: Duration,
    /// Deadline for the parallel addition.
    pub compute_timeout: Duration,
    pub max_dimension: usize,
    pub max_payload: usize,
    /// Requested worker counts above this are lowered to it.
    pub max_workers: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            compute_timeout: Duration::from_secs(30),
            max_dimension: 1024,
            max_payload: 64 * 1024 * 1024,
            max_workers: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    AwaitingPayload,
    Computing,
    Responding,
    Closed,
    Failed,
}

/// One client session over any byte stream.
pub struct Session<S> {
    stream: S,
    limits: SessionLimits,
    buffer: BytesMut,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, limits: SessionLimits) -> Self {
        Session {
            stream,
            limits,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            state: SessionState::AwaitingHandshake,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion and close the stream.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let outcome = self.drive().await;

        match outcome {
            Ok(()) => {
                self.transition(SessionState::Closed);
                let _ = self.stream.shutdown().await;
            }
            Err(ref e) => {
                self.transition(SessionState::Failed);
                if self.reply_error(e).await {
                    let _ = self.stream.shutdown().await;
                    self.linger().await;
                }
            }
        }
        outcome
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        self.await_handshake().await?;
        let request = self.await_payload().await?;
        let result = self.compute(request).await?;
        self.respond(&result).await
    }

    async fn await_handshake(&mut self) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.limits.read_timeout;
        loop {
            if let Some(consumed) = codec::parse_handshake(&self.buffer)? {
                self.buffer.advance(consumed);
                break;
            }
            self.fill(deadline).await?;
        }

        self.write(&codec::encode_token(codec::ACK)).await?;
        self.transition(SessionState::AwaitingPayload);
        Ok(())
    }

    async fn await_payload(&mut self) -> Result<Request, SessionError> {
        let deadline = Instant::now() + self.limits.read_timeout;
        let mut decoder = RequestDecoder::new(self.limits.max_dimension);
        loop {
            if let Some(request) = decoder.decode(&self.buffer)? {
                return Ok(request);
            }
            self.fill(deadline).await?;
        }
    }

    async fn compute(&mut self, request: Request) -> Result<Matrix, SessionError> {
        self.transition(SessionState::Computing);

        let cap = i64::try_from(self.limits.max_workers).unwrap_or(i64::MAX);
        let plan = planner::plan(request.a.dim(), request.workers.min(cap))?;
        debug!(
            dim = request.a.dim(),
            requested = request.workers,
            workers = plan.len(),
            "Computing sum"
        );

        let result = add_with_deadline(request, plan, self.limits.compute_timeout).await?;

        self.transition(SessionState::Responding);
        Ok(result)
    }

    async fn respond(&mut self, result: &Matrix) -> Result<(), SessionError> {
        self.write(&codec::encode_result(result)).await
    }

    /// Read more bytes into the buffer, bounded by `deadline` and the payload limit.
    async fn fill(&mut self, deadline: Instant) -> Result<(), SessionError> {
        if self.buffer.len() >= self.limits.max_payload {
            return Err(ProtocolError::PayloadTooLarge(self.limits.max_payload).into());
        }
        self.buffer.reserve(BUFFER_SIZE);

        let n = timeout_at(deadline, self.stream.read_buf(&mut self.buffer))
            .await
            .map_err(|_| ProtocolError::Timeout(self.limits.read_timeout))??;
        if n == 0 {
            return Err(ProtocolError::UnexpectedEof.into());
        }
        trace!(bytes = n, buffered = self.buffer.len(), "Read");

        if self.buffer.len() > self.limits.max_payload {
            return Err(ProtocolError::PayloadTooLarge(self.limits.max_payload).into());
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let limit = self.limits.read_timeout;
        let stream = &mut self.stream;
        let write = async {
            stream.write_all(data).await?;
            stream.flush().await
        };
        match timeout(limit, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out").into()),
        }
    }

    /// Best-effort `ERROR` line; skipped when the stream itself failed.
    /// Returns whether the reply was written.
    async fn reply_error(&mut self, error: &SessionError) -> bool {
        let reason = match error {
            SessionError::Io(_) => return false,
            SessionError::Protocol(e) => e.to_string(),
            SessionError::Config(e) => e.to_string(),
            SessionError::Compute(e) => e.to_string(),
        };
        let reply = codec::encode_error(error.kind(), &reason);
        match self.write(&reply).await {
            Ok(()) => true,
            Err(e) => {
                trace!(error = %e, "Error reply not delivered");
                false
            }
        }
    }

    /// Discard whatever the peer is still sending, until EOF or a bound.
    async fn linger(&mut self) {
        let deadline = Instant::now() + LINGER;
        let mut discarded = 0;
        while discarded < LINGER_BYTES {
            self.buffer.clear();
            self.buffer.reserve(BUFFER_SIZE);
            match timeout_at(deadline, self.stream.read_buf(&mut self.buffer)).await {
                Ok(Ok(n)) if n > 0 => discarded += n,
                _ => break,
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        trace!(from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }
}

/// Run the addition on the blocking pool, bounded by `limit`.
///
/// The blocking task owns the operands and its result buffer, so a timed-out
/// computation can only ever write into memory nobody reads. On timeout the
/// workers are told to stop at their next row.
async fn add_with_deadline(
    request: Request,
    plan: Vec<ChunkAssignment>,
    limit: Duration,
) -> Result<Matrix, ComputeError> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    let task = tokio::task::spawn_blocking(move || {
        adder::add_cancellable(&request.a, &request.b, &plan, &flag)
    });
    match timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_panic() => Err(ComputeError::WorkerPanicked),
        Ok(Err(_)) => Err(ComputeError::Aborted),
        Err(_) => {
            cancel.store(true, Ordering::Relaxed);
            Err(ComputeError::Timeout(limit))
        }
    }
}

/// Handle a single client connection
pub async fn handle_connection<S>(stream: S, limits: SessionLimits) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Session::new(stream, limits).run().await
}
