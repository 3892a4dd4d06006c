//! In-process cluster doubles for session and supervisor tests.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::{BoxedChannel, ChannelTarget, ClusterSession, ClusterSessionFactory};
use crate::forwarding::ForwardError;

/// A port nobody listens on right now
pub(crate) fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `check` until it holds or `timeout` passes
pub(crate) async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct EchoInner {
    addr: std::net::SocketAddr,
    opened: AtomicUsize,
    available: AtomicBool,
    severed: parking_lot::Mutex<CancellationToken>,
}

/// Cluster whose channels lead to a local echo server
#[derive(Clone)]
pub(crate) struct EchoCluster {
    inner: Arc<EchoInner>,
}

impl EchoCluster {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        Self {
            inner: Arc::new(EchoInner {
                addr,
                opened: AtomicUsize::new(0),
                available: AtomicBool::new(true),
                severed: parking_lot::Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Channels opened so far
    pub(crate) fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Make new channel requests fail (or succeed again)
    pub(crate) fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Break every open channel with a connection reset
    pub(crate) fn sever(&self) {
        let mut token = self.inner.severed.lock();
        token.cancel();
        *token = CancellationToken::new();
    }
}

#[async_trait]
impl ClusterSession for EchoCluster {
    async fn open_channel(&self, _target: &ChannelTarget) -> Result<BoxedChannel, ForwardError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(ForwardError::ConnectFailed("cluster unavailable".into()));
        }
        let stream = TcpStream::connect(self.inner.addr)
            .await
            .map_err(|e| ForwardError::ConnectFailed(e.to_string()))?;
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        let token = self.inner.severed.lock().clone();
        Ok(Box::new(SeverableStream::new(stream, token)))
    }
}

/// Cluster that refuses every channel
#[derive(Clone, Default)]
pub(crate) struct FailingCluster {
    attempts: Arc<AtomicUsize>,
}

impl FailingCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterSession for FailingCluster {
    async fn open_channel(&self, target: &ChannelTarget) -> Result<BoxedChannel, ForwardError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ForwardError::ConnectFailed(format!("{} refused", target)))
    }
}

/// Factory handing out one fixed session, counting creations
pub(crate) struct CountingFactory {
    session: Arc<dyn ClusterSession>,
    calls: AtomicUsize,
    created: AtomicUsize,
    fail_first: usize,
    shared: bool,
}

impl CountingFactory {
    pub(crate) fn new(session: impl ClusterSession + 'static) -> Self {
        Self {
            session: Arc::new(session),
            calls: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            fail_first: 0,
            shared: true,
        }
    }

    /// Fail the first `n` creations
    pub(crate) fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Ask the supervisor for one session per forward
    pub(crate) fn not_shared(mut self) -> Self {
        self.shared = false;
        self
    }

    /// Successful creations
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterSessionFactory for CountingFactory {
    async fn session(&self, context: &str) -> Result<Arc<dyn ClusterSession>, ForwardError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(ForwardError::ConnectFailed(format!(
                "no credentials for context {}",
                context
            )));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.session.clone())
    }

    fn shares_sessions(&self) -> bool {
        self.shared
    }
}

/// TCP stream that fails with a reset once its token is cancelled
struct SeverableStream {
    inner: TcpStream,
    token: CancellationToken,
    severed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl SeverableStream {
    fn new(inner: TcpStream, token: CancellationToken) -> Self {
        let severed = Box::pin(token.clone().cancelled_owned());
        Self {
            inner,
            token,
            severed,
        }
    }

    fn poll_severed(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.severed.as_mut().poll(cx).is_ready()
    }
}

fn severed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "channel severed")
}

impl AsyncRead for SeverableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_severed(cx) {
            return Poll::Ready(Err(severed_error()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SeverableStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_severed(cx) {
            return Poll::Ready(Err(severed_error()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
