//! Reference client: random operand generation and a one-shot session.

use crate::codec::{self, ResultDecoder};
use crate::error::{ProtocolError, SessionError};
use crate::matrix::Matrix;
use bytes::{Buf, BytesMut};
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::debug;

/// Values produced by `generate_matrix` fall in this range.
pub const VALUE_RANGE: std::ops::Range<i64> = 1..10;

/// Random `n x n` matrix with values in `VALUE_RANGE`.
pub fn generate_matrix(n: usize) -> Matrix {
    let mut rng = rand::thread_rng();
    Matrix::from_fn(n, |_, _| rng.gen_range(VALUE_RANGE))
}

/// A connected, handshaken client. Each connection carries one request.
pub struct Client {
    stream: TcpStream,
    buffer: BytesMut,
    read_timeout: Duration,
}

impl Client {
    /// Connect and complete the `HELLO` / `CONNECTED` handshake.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        read_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = Client {
            stream,
            buffer: BytesMut::with_capacity(4096),
            read_timeout,
        };

        client
            .stream
            .write_all(&codec::encode_token(codec::HANDSHAKE))
            .await?;
        loop {
            if let Some(consumed) = codec::parse_ack(&client.buffer)? {
                client.buffer.advance(consumed);
                break;
            }
            client.fill().await?;
        }
        debug!("Handshake complete");

        Ok(client)
    }

    /// Send both operands and wait for their sum.
    pub async fn add(mut self, a: &Matrix, b: &Matrix, workers: i64) -> Result<Matrix, SessionError> {
        let payload = codec::encode_request(a, b, workers);
        self.stream.write_all(&payload).await?;
        self.stream.flush().await?;
        debug!(bytes = payload.len(), "Payload sent");

        let mut decoder = ResultDecoder::new(a.dim().max(1));
        loop {
            if let Some(result) = decoder.decode(&self.buffer)? {
                return Ok(result);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), SessionError> {
        self.buffer.reserve(4096);
        let n = timeout(self.read_timeout, self.stream.read_buf(&mut self.buffer))
            .await
            .map_err(|_| ProtocolError::Timeout(self.read_timeout))??;
        if n == 0 {
            return Err(ProtocolError::UnexpectedEof.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_matrix_range() {
        let m = generate_matrix(12);
        assert_eq!(m.dim(), 12);
        assert!(m.as_slice().iter().all(|v| VALUE_RANGE.contains(v)));
    }

    #[test]
    fn test_generate_empty() {
        assert_eq!(generate_matrix(0), Matrix::zeros(0));
    }
}
