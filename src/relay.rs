//! One-directional byte pump between two halves of a forwarded connection.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::Teardown;

/// Which way a relay moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client->upstream"),
            Direction::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Why a relay stopped pumping.
#[derive(Debug)]
pub enum ExitReason {
    /// The source reached end of stream.
    Eof,
    /// A read or write on either side failed.
    Failed(io::Error),
    /// The connection was torn down by the opposite relay.
    TornDown,
}

/// Summary handed back when a relay finishes.
#[derive(Debug)]
pub struct RelayExit {
    pub direction: Direction,
    pub bytes: u64,
    pub reason: ExitReason,
}

pub struct Relay<R, W> {
    direction: Direction,
    source: R,
    sink: W,
    teardown: Teardown,
    buffer_size: usize,
}

impl<R, W> Relay<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        direction: Direction,
        source: R,
        sink: W,
        teardown: Teardown,
        buffer_size: usize,
    ) -> Self {
        Self {
            direction,
            source,
            sink,
            teardown,
            buffer_size,
        }
    }

    /// Copy `source` into `sink` until EOF, an I/O failure, or teardown.
    ///
    /// Whatever ends the loop, the owning connection is torn down before
    /// returning, and both halves held by this relay are dropped with it.
    pub async fn run(mut self) -> RelayExit {
        let mut buf = vec![0u8; self.buffer_size];
        let mut closed = self.teardown.subscribe();
        let mut bytes: u64 = 0;

        let reason = loop {
            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => break ExitReason::TornDown,
                step = pump(&mut self.source, &mut self.sink, &mut buf) => match step {
                    Ok(0) => break ExitReason::Eof,
                    Ok(n) => bytes += n as u64,
                    Err(e) => break ExitReason::Failed(e),
                },
            }
        };

        self.teardown.close();

        RelayExit {
            direction: self.direction,
            bytes,
            reason,
        }
    }
}

/// One read followed by a full write and flush of exactly what was read.
async fn pump<R, W>(source: &mut R, sink: &mut W, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let n = source.read(buf).await?;
    if n == 0 {
        return Ok(0);
    }
    sink.write_all(&buf[..n]).await?;
    sink.flush().await?;
    Ok(n)
}
