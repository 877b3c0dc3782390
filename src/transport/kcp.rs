//! Connection-aware transport over KCP.
//!
//! KCP gives us a reliable byte stream over UDP but no connection state, so
//! every byte on the wire is part of a frame: a one-byte kind, then for Data
//! frames a big-endian u32 length and the payload. Close frames signal
//! end-of-stream in-band; KeepAlive frames are transparent to the byte
//! stream delivered upward.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::bail;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};
use tokio_util::sync::{CancellationToken, PollSender, WaitForCancellationFutureOwned};
use tracing::{error, warn};

use crate::config::KcpSettings;
use crate::pool::{self, PooledBuf};
use crate::transport::{dial_cancelled, Transport, TransportConn, TransportListener};

const FRAME_DATA: u8 = 0;
const FRAME_CLOSE: u8 = 1;
const FRAME_KEEP_ALIVE: u8 = 2;

#[derive(Debug, Error)]
enum FrameError {
    #[error("invalid KCP frame header {0:#04x}")]
    InvalidHeader(u8),
    #[error("send buffer size exceeds limitation")]
    OversizedPayload,
}

/// How long a Close frame write may take, and how long the session lingers
/// afterwards so the frame has time to flush.
#[derive(Debug, Clone, Copy)]
struct CloseTunables {
    send_timeout: Duration,
    linger: Duration,
}

impl Default for CloseTunables {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            linger: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KeepAliveSettings {
    interval: Duration,
    timeout: Duration,
}

pub struct KcpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    kcp_config: KcpConfig,
    keep_alive: Option<KeepAliveSettings>,
    /// Live connections scanned by the keep-alive manager. Entries whose
    /// `last_send` is 0 are dropped on the next tick.
    conns: Mutex<Vec<Weak<ConnEntry>>>,
    tunables: CloseTunables,
    epoch: Instant,
}

impl KcpTransport {
    pub fn new(settings: &KcpSettings) -> anyhow::Result<Self> {
        Self::with_tunables(settings, CloseTunables::default())
    }

    fn with_tunables(settings: &KcpSettings, tunables: CloseTunables) -> anyhow::Result<Self> {
        let (nodelay, interval, resend, nc) = match settings.mode.as_str() {
            "" | "normal" => (false, 25, 0, false),
            "fast" => (false, 25, 2, true),
            "fast2" => (true, 10, 2, true),
            other => bail!("invalid KCP mode: {other}"),
        };
        let (snd_wnd, rcv_wnd) = match settings.optimize.as_str() {
            "" | "balance" => (256u16, 256u16),
            "receive" => (128, 512),
            "send" => (512, 128),
            "server" => (1024, 1024),
            "_test_small" => (32, 32),
            other => bail!("invalid optimization: {other}"),
        };

        if settings.fec {
            let (data_shards, parity_shards) = match settings.fec_dist.as_deref() {
                None => (10usize, 2usize),
                Some(dist) => {
                    let parsed = dist
                        .split_once(',')
                        .and_then(|(d, p)| Some((d.trim().parse().ok()?, p.trim().parse().ok()?)));
                    match parsed {
                        Some((d, p)) if d > 0 && p > 0 => (d, p),
                        _ => bail!("invalid FEC distribution: {dist}"),
                    }
                }
            };
            // The tokio_kcp backend carries no Reed-Solomon implementation.
            warn!(
                data_shards,
                parity_shards, "FEC is configured but not applied by the KCP backend"
            );
        }

        let keep_alive = match (settings.keep_alive_interval, settings.keep_alive_timeout) {
            (None, None) => None,
            (Some(interval), Some(timeout)) => {
                if interval.is_zero() {
                    bail!("invalid 'keep_alive_interval'");
                }
                if timeout.is_zero() {
                    bail!("invalid 'keep_alive_timeout'");
                }
                Some(KeepAliveSettings { interval, timeout })
            }
            _ => bail!("'keep_alive_interval' must be used with 'keep_alive_timeout'"),
        };

        let mut kcp_config = KcpConfig::default();
        kcp_config.nodelay = KcpNoDelayConfig {
            nodelay,
            interval,
            resend,
            nc,
        };
        kcp_config.wnd_size = (snd_wnd, rcv_wnd);
        kcp_config.stream = true;

        let inner = Arc::new(Inner {
            kcp_config,
            keep_alive,
            conns: Mutex::new(Vec::new()),
            tunables,
            epoch: Instant::now(),
        });

        if let Some(ka) = keep_alive {
            // The manager must never die silently: a dead manager would leave
            // zombie sessions around forever, so a panic takes the process
            // down with it.
            let handle = tokio::spawn(keep_alive_manager(Arc::downgrade(&inner), ka));
            tokio::spawn(async move {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!("KCP keep-alive manager crashed: {e}");
                        std::process::exit(1);
                    }
                }
            });
        }

        Ok(Self { inner })
    }

    #[cfg(test)]
    fn live_conns(&self) -> usize {
        self.inner.conns.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for KcpTransport {
    async fn dial(&self, ctx: &CancellationToken, addr: &str) -> io::Result<TransportConn> {
        if ctx.is_cancelled() {
            return Err(dial_cancelled());
        }
        let target = resolve(addr).await?;
        let stream = tokio::select! {
            r = KcpStream::connect(&self.inner.kcp_config, target) => r.map_err(io::Error::from)?,
            _ = ctx.cancelled() => return Err(dial_cancelled()),
        };
        let conn = self.inner.wrap_stream(stream);
        Ok(TransportConn {
            stream: Box::new(conn),
            local_addr: None,
        })
    }

    async fn listen(&self, addr: &str) -> io::Result<Box<dyn TransportListener>> {
        let bind = resolve(addr).await?;
        let listener = KcpListener::bind(self.inner.kcp_config.clone(), bind)
            .await
            .map_err(io::Error::from)?;
        Ok(Box::new(KcpListenerWrapper {
            listener,
            inner: self.inner.clone(),
        }))
    }
}

async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {addr}")))
}

struct KcpListenerWrapper {
    listener: KcpListener,
    inner: Arc<Inner>,
}

#[async_trait]
impl TransportListener for KcpListenerWrapper {
    async fn accept(&mut self) -> io::Result<(TransportConn, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await.map_err(io::Error::from)?;
        let conn = self.inner.wrap_stream(stream);
        Ok((
            TransportConn {
                stream: Box::new(conn),
                local_addr: None,
            },
            peer,
        ))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr().map_err(io::Error::from)
    }
}

impl Inner {
    /// Wraps a raw session with the framing layer, spawns its writer task and
    /// registers it with the keep-alive manager.
    fn wrap_stream<S>(&self, io: S) -> FramedConn
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(io);
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::new(ConnState::new(self.epoch));
        let entry = Arc::new(ConnEntry {
            state: state.clone(),
            jobs: tx.clone(),
        });
        if self.keep_alive.is_some() {
            self.conns.lock().unwrap().push(Arc::downgrade(&entry));
        }
        tokio::spawn(run_writer(Box::new(wr), rx, state, self.tunables));
        let closed_wait = Box::pin(entry.state.closed.clone().cancelled_owned());
        FramedConn {
            rd: Box::new(rd),
            sender: PollSender::new(tx),
            entry,
            closed_wait,
            rd_phase: RdPhase::Kind,
            rd_len: [0u8; 4],
            rd_len_got: 0,
            rd_data_left: 0,
            rd_eof: false,
            read_waiting: false,
        }
    }
}

struct ConnState {
    epoch: Instant,
    /// Nanoseconds of the last outbound frame; 0 marks the connection closed.
    last_send: AtomicI64,
    /// Start of the read currently blocked on the session, or 0.
    last_read_start: AtomicI64,
    /// Start of the write currently blocked on the session, or 0.
    last_write_start: AtomicI64,
    /// Cancelled when the connection is closed. The writer task observes it
    /// to run the close sequence, and pending reads observe it to unblock:
    /// the session is split, so shutting the write half down would otherwise
    /// leave a reader parked forever.
    closed: CancellationToken,
    write_err: Mutex<Option<io::Error>>,
}

impl ConnState {
    fn new(epoch: Instant) -> Self {
        let state = Self {
            epoch,
            last_send: AtomicI64::new(0),
            last_read_start: AtomicI64::new(0),
            last_write_start: AtomicI64::new(0),
            closed: CancellationToken::new(),
            write_err: Mutex::new(None),
        };
        state.last_send.store(state.now_ns(), Ordering::Relaxed);
        state
    }

    fn now_ns(&self) -> i64 {
        (self.epoch.elapsed().as_nanos() as i64).max(1)
    }

    fn mark_closed(&self) {
        self.last_send.store(0, Ordering::Relaxed);
    }

    fn is_closed(&self) -> bool {
        self.last_send.load(Ordering::Relaxed) == 0
    }

    fn set_write_error(&self, err: io::Error) {
        *self.write_err.lock().unwrap() = Some(err);
    }

    fn take_write_error(&self) -> Option<io::Error> {
        self.write_err.lock().unwrap().take()
    }
}

struct ConnEntry {
    state: Arc<ConnState>,
    jobs: mpsc::Sender<WriteJob>,
}

impl ConnEntry {
    fn begin_close(&self) {
        self.state.mark_closed();
        self.state.closed.cancel();
    }
}

enum WriteJob {
    Data(PooledBuf),
    KeepAlive,
}

/// Owns the session's write half. All frames funnel through here, which is
/// what lets the keep-alive manager inject frames into connections it does
/// not own.
async fn run_writer(
    mut wr: Box<dyn AsyncWrite + Send + Unpin>,
    mut jobs: mpsc::Receiver<WriteJob>,
    state: Arc<ConnState>,
    tunables: CloseTunables,
) {
    loop {
        let job = tokio::select! {
            _ = state.closed.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        match job {
            WriteJob::Data(frame) => {
                state.last_send.store(state.now_ns(), Ordering::Relaxed);
                state.last_write_start.store(state.now_ns(), Ordering::Relaxed);
                let res = write_frame(&mut wr, &frame, &state, tunables.send_timeout).await;
                state.last_write_start.store(0, Ordering::Relaxed);
                if let Err(e) = res {
                    state.set_write_error(e);
                    break;
                }
                if state.closed.is_cancelled() {
                    break;
                }
            }
            WriteJob::KeepAlive => {
                state.last_send.store(state.now_ns(), Ordering::Relaxed);
                let res = tokio::select! {
                    r = wr.write_all(&[FRAME_KEEP_ALIVE]) => r,
                    _ = state.closed.cancelled() => break,
                };
                if res.is_err() {
                    break;
                }
            }
        }
    }

    // Best-effort orderly shutdown: one Close frame under a deadline, then a
    // linger so it has a chance to flush before the session goes away.
    state.mark_closed();
    let _ = tokio::time::timeout(tunables.send_timeout, wr.write_all(&[FRAME_CLOSE])).await;
    tokio::time::sleep(tunables.linger).await;
    let _ = wr.shutdown().await;
}

/// Writes one frame, switching from "wait for close" to "grace deadline"
/// when the connection is closed mid-write. A frame is never truncated: the
/// close sequence may only begin on a frame boundary, or once the session is
/// declared stuck and abandoned entirely.
async fn write_frame(
    wr: &mut (impl AsyncWrite + Send + Unpin),
    frame: &[u8],
    state: &ConnState,
    grace: Duration,
) -> io::Result<()> {
    let mut off = 0;
    let mut deadline = None;
    while off < frame.len() {
        // A dropped `write` future has consumed nothing, so restarting the
        // call with the same offset is sound.
        let n = match deadline {
            None => tokio::select! {
                r = wr.write(&frame[off..]) => r?,
                _ = state.closed.cancelled() => {
                    deadline = Some(tokio::time::Instant::now() + grace);
                    continue;
                }
            },
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, wr.write(&frame[off..])).await {
                    Ok(r) => r?,
                    Err(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "session write stalled during close",
                        ))
                    }
                }
            }
        };
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "session closed"));
        }
        off += n;
    }
    Ok(())
}

async fn keep_alive_manager(inner: Weak<Inner>, ka: KeepAliveSettings) {
    let mut ticker = tokio::time::interval(ka.interval / 4);
    let interval_ns = ka.interval.as_nanos() as i64;
    let timeout_ns = ka.timeout.as_nanos() as i64;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut conns = inner.conns.lock().unwrap();
        conns.retain(|weak| {
            let Some(entry) = weak.upgrade() else {
                return false;
            };
            let state = &entry.state;
            let last_send = state.last_send.load(Ordering::Relaxed);
            if last_send == 0 {
                return false;
            }
            let now = state.now_ns();
            let last_read_start = state.last_read_start.load(Ordering::Relaxed);
            let last_write_start = state.last_write_start.load(Ordering::Relaxed);
            if last_read_start > 0 && now - last_read_start > timeout_ns {
                // Read stalled past the limit: the peer is gone.
                entry.begin_close();
                return false;
            }
            if last_write_start > 0 && now - last_write_start > timeout_ns {
                entry.begin_close();
                return false;
            }
            if now - last_send > interval_ns {
                // Non-blocking by design: a full job queue means the
                // connection is busy and needs no probe.
                let _ = entry.jobs.try_send(WriteJob::KeepAlive);
            }
            true
        });
    }
}

enum RdPhase {
    /// Expecting a frame kind byte.
    Kind,
    /// Accumulating the 4-byte Data length.
    Len,
}

/// A framed KCP connection presented as a plain duplex byte stream.
pub struct FramedConn {
    rd: Box<dyn AsyncRead + Send + Unpin>,
    sender: PollSender<WriteJob>,
    entry: Arc<ConnEntry>,
    /// Wakes a pending read when the connection closes underneath it.
    closed_wait: Pin<Box<WaitForCancellationFutureOwned>>,
    rd_phase: RdPhase,
    rd_len: [u8; 4],
    rd_len_got: usize,
    /// Bytes still owed from the Data frame being consumed.
    rd_data_left: u32,
    rd_eof: bool,
    read_waiting: bool,
}

impl FramedConn {
    /// One read against the session with stall bookkeeping: `last_read_start`
    /// stays set for as long as the read is pending.
    fn poll_session_read(
        rd: &mut Box<dyn AsyncRead + Send + Unpin>,
        state: &ConnState,
        waiting: &mut bool,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<usize>> {
        if !*waiting {
            state
                .last_read_start
                .store(state.now_ns(), Ordering::Relaxed);
            *waiting = true;
        }
        match Pin::new(rd).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(res) => {
                state.last_read_start.store(0, Ordering::Relaxed);
                *waiting = false;
                Poll::Ready(res.map(|()| buf.filled().len()))
            }
        }
    }
}

impl AsyncRead for FramedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.rd_eof {
            return Poll::Ready(Ok(()));
        }
        // A close (local shutdown, or the keep-alive manager reaping a
        // stalled connection) must unblock a read parked on the session.
        // The is_cancelled short-circuit keeps the completed future from
        // being polled again.
        if this.entry.state.closed.is_cancelled() || this.closed_wait.as_mut().poll(cx).is_ready()
        {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            )));
        }
        loop {
            if this.rd_data_left > 0 {
                let want = (this.rd_data_left as usize).min(buf.remaining());
                let n = {
                    let mut limited = buf.take(want);
                    match Self::poll_session_read(
                        &mut this.rd,
                        &this.entry.state,
                        &mut this.read_waiting,
                        cx,
                        &mut limited,
                    ) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(n)) => n,
                    }
                };
                if n == 0 {
                    // Session ended under us; treat like end-of-stream.
                    this.rd_eof = true;
                    return Poll::Ready(Ok(()));
                }
                unsafe { buf.assume_init(n) };
                buf.advance(n);
                this.rd_data_left -= n as u32;
                return Poll::Ready(Ok(()));
            }

            match this.rd_phase {
                RdPhase::Kind => {
                    let mut tmp = [0u8; 1];
                    let mut kind_buf = ReadBuf::new(&mut tmp);
                    let n = match Self::poll_session_read(
                        &mut this.rd,
                        &this.entry.state,
                        &mut this.read_waiting,
                        cx,
                        &mut kind_buf,
                    ) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(n)) => n,
                    };
                    if n == 0 {
                        this.rd_eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    match tmp[0] {
                        FRAME_DATA => {
                            this.rd_phase = RdPhase::Len;
                            this.rd_len_got = 0;
                        }
                        FRAME_CLOSE => {
                            this.entry.state.mark_closed();
                            this.rd_eof = true;
                            return Poll::Ready(Ok(()));
                        }
                        FRAME_KEEP_ALIVE => {}
                        other => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                FrameError::InvalidHeader(other),
                            )));
                        }
                    }
                }
                RdPhase::Len => {
                    let n = {
                        let mut len_buf = ReadBuf::new(&mut this.rd_len[this.rd_len_got..]);
                        match Self::poll_session_read(
                            &mut this.rd,
                            &this.entry.state,
                            &mut this.read_waiting,
                            cx,
                            &mut len_buf,
                        ) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Ready(Ok(n)) => n,
                        }
                    };
                    if n == 0 {
                        this.rd_eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    this.rd_len_got += n;
                    if this.rd_len_got == 4 {
                        this.rd_data_left = u32::from_be_bytes(this.rd_len);
                        this.rd_phase = RdPhase::Kind;
                    }
                }
            }
        }
    }
}

impl AsyncWrite for FramedConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Some(e) = this.entry.state.take_write_error() {
            return Poll::Ready(Err(e));
        }
        if data.len() as u64 > u32::MAX as u64 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                FrameError::OversizedPayload,
            )));
        }
        match this.sender.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed_pipe())),
            Poll::Ready(Ok(())) => {
                let mut frame = pool::get(data.len() + 5);
                frame[0] = FRAME_DATA;
                frame[1..5].copy_from_slice(&(data.len() as u32).to_be_bytes());
                frame[5..].copy_from_slice(data);
                if this.sender.send_item(WriteJob::Data(frame)).is_err() {
                    return Poll::Ready(Err(closed_pipe()));
                }
                Poll::Ready(Ok(data.len()))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Some(e) = this.entry.state.take_write_error() {
            return Poll::Ready(Err(e));
        }
        // Drained job queue is as flushed as this transport gets; KCP does
        // its own pacing below us.
        match this.sender.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Ready(Ok(())) => {
                this.sender.abort_send();
                Poll::Ready(Ok(()))
            }
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.entry.state.closed.is_cancelled() {
            // Let queued frames reach the writer before signalling close.
            match this.sender.poll_reserve(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(_) => {
                    this.sender.abort_send();
                }
            }
            this.entry.begin_close();
        }
        Poll::Ready(Ok(()))
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "KCP connection closed")
}
