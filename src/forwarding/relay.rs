//! Stream Pairs
//!
//! One accepted local connection bridged to one remote channel. Bytes are
//! copied in both directions until both sides have finished, one side
//! fails, or the pair is cancelled. EOF on either side is forwarded as a
//! write shutdown on the other.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::error::ForwardError;
use super::session::ForwardStats;
use crate::cluster::{BoxedChannel, ChannelTarget, ClusterSession};

const BUFFER_SIZE: usize = 32 * 1024;

/// How a stream pair ended
#[derive(Debug)]
pub(crate) enum PairExit {
    /// Both directions reached EOF
    Closed,
    /// The local client went away
    LocalFailed,
    /// No channel could be opened for this connection
    OpenFailed(ForwardError),
    /// The remote channel broke mid-stream
    RemoteFailed(ForwardError),
    /// The owning session tore the pair down
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// local -> remote
    Upstream,
    /// remote -> local
    Downstream,
}

enum PumpError {
    Local(io::Error),
    /// Reading from the channel failed, the channel is gone
    RemoteRead(io::Error),
    RemoteWrite(io::Error),
}

impl Direction {
    fn read_error(self, e: io::Error) -> PumpError {
        match self {
            Direction::Upstream => PumpError::Local(e),
            Direction::Downstream => PumpError::RemoteRead(e),
        }
    }

    fn write_error(self, e: io::Error) -> PumpError {
        match self {
            Direction::Upstream => PumpError::RemoteWrite(e),
            Direction::Downstream => PumpError::Local(e),
        }
    }

    fn record(self, stats: &parking_lot::RwLock<ForwardStats>, n: usize) {
        let mut s = stats.write();
        match self {
            Direction::Upstream => s.bytes_sent += n as u64,
            Direction::Downstream => s.bytes_received += n as u64,
        }
    }
}

/// A local connection waiting to be bridged
pub(crate) struct StreamPair {
    id: Uuid,
    local: TcpStream,
    peer: SocketAddr,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
    opened: Option<Arc<watch::Sender<u64>>>,
}

impl StreamPair {
    /// Wrap an accepted connection, counting it as active
    pub(crate) fn new(
        local: TcpStream,
        peer: SocketAddr,
        stats: Arc<parking_lot::RwLock<ForwardStats>>,
    ) -> Self {
        {
            let mut s = stats.write();
            s.connection_count += 1;
            s.active_connections += 1;
        }
        Self {
            id: Uuid::new_v4(),
            local,
            peer,
            stats,
            opened: None,
        }
    }

    /// Bump `opened` every time this pair opens a fresh channel
    pub(crate) fn notify_opens(mut self, opened: Arc<watch::Sender<u64>>) -> Self {
        self.opened = Some(opened);
        self
    }

    /// Bridge the connection until it ends
    ///
    /// Uses `channel` when given, otherwise opens a fresh one on `cluster`.
    pub(crate) async fn run(
        self,
        cluster: Arc<dyn ClusterSession>,
        target: ChannelTarget,
        channel: Option<BoxedChannel>,
        cancel: CancellationToken,
    ) -> PairExit {
        let id = self.id;
        let stats = self.stats.clone();
        debug!("Stream pair {} accepted from {} for {}", id, self.peer, target);

        let exit = self.bridge(cluster, &target, channel, &cancel).await;

        {
            let mut s = stats.write();
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        debug!("Stream pair {} finished: {:?}", id, exit);
        exit
    }

    async fn bridge(
        self,
        cluster: Arc<dyn ClusterSession>,
        target: &ChannelTarget,
        channel: Option<BoxedChannel>,
        cancel: &CancellationToken,
    ) -> PairExit {
        let remote = match channel {
            Some(channel) => channel,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return PairExit::Cancelled,
                    result = cluster.open_channel(target) => match result {
                        Ok(channel) => {
                            if let Some(opened) = &self.opened {
                                opened.send_modify(|count| *count += 1);
                            }
                            channel
                        }
                        Err(e) => return PairExit::OpenFailed(e),
                    },
                }
            }
        };

        let (local_read, local_write) = self.local.into_split();
        let (remote_read, remote_write) = tokio::io::split(remote);
        let stats = &*self.stats;

        let upstream = pump(local_read, remote_write, Direction::Upstream, stats);
        let downstream = pump(remote_read, local_write, Direction::Downstream, stats);

        tokio::select! {
            _ = cancel.cancelled() => PairExit::Cancelled,
            result = async { tokio::try_join!(upstream, downstream) } => match result {
                Ok((sent, received)) => {
                    debug!(
                        "Stream pair {} closed after {} bytes sent, {} bytes received",
                        self.id, sent, received
                    );
                    PairExit::Closed
                }
                Err(PumpError::Local(e)) => {
                    debug!("Stream pair {} local side failed: {}", self.id, e);
                    PairExit::LocalFailed
                }
                Err(PumpError::RemoteWrite(e)) => {
                    // The read side reports a broken channel; a failed write
                    // alone just ends this connection.
                    debug!("Stream pair {} remote write failed: {}", self.id, e);
                    PairExit::Closed
                }
                Err(PumpError::RemoteRead(e)) => PairExit::RemoteFailed(ForwardError::ConnectFailed(
                    format!("channel to {} lost: {}", target, e),
                )),
            },
        }
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    stats: &parking_lot::RwLock<ForwardStats>,
) -> Result<u64, PumpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| direction.read_error(e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| direction.write_error(e))?;
        total += n as u64;
        direction.record(stats, n);
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown after EOF ({:?}) failed: {}", direction, e);
    }
    Ok(total)
}
