use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::monitor::TunnelMonitor;
use crate::pool;
use crate::transport::IoStream;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Clone, Copy)]
enum Direction {
    /// downstream -> upstream, counted as uploaded bytes.
    Up,
    /// upstream -> downstream, counted as downloaded bytes.
    Down,
}

impl Direction {
    fn source_name(self) -> &'static str {
        match self {
            Direction::Up => "downstream",
            Direction::Down => "upstream",
        }
    }
}

/// Pumps bytes between the two ends of a tunnel until both directions stop.
///
/// The first half to finish, for any reason, cancels `relay_ctx`; once both
/// have returned, each endpoint is shut down exactly once and the tunnel
/// monitor is closed exactly once.
pub async fn relay(relay_ctx: CancellationToken, monitor: TunnelMonitor, down: IoStream, up: IoStream) {
    let (mut down_rd, mut down_wr) = tokio::io::split(down);
    let (mut up_rd, mut up_wr) = tokio::io::split(up);

    tokio::join!(
        run_half(
            &relay_ctx,
            &mut down_rd,
            &mut up_wr,
            Direction::Up,
            &monitor
        ),
        run_half(
            &relay_ctx,
            &mut up_rd,
            &mut down_wr,
            Direction::Down,
            &monitor
        ),
    );

    if let Err(e) = up_wr.shutdown().await {
        warn!(error = %e, "error occurred when closing upstream");
    }
    if let Err(e) = down_wr.shutdown().await {
        warn!(error = %e, "error occurred when closing downstream");
    }
    monitor.close();
}

async fn run_half<R, W>(
    ctx: &CancellationToken,
    src: &mut R,
    dst: &mut W,
    dir: Direction,
    monitor: &TunnelMonitor,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let result = tokio::select! {
        r = copy_half(src, dst, dir, monitor, &mut transferred) => Some(r),
        _ = ctx.cancelled() => None,
    };
    let src_name = dir.source_name();
    match result {
        // Source reached end-of-stream.
        Some(Ok(())) => info!(src = src_name, bytes = transferred, "connection closed"),
        // The sibling half finished first and tore the tunnel down.
        None => info!(src = src_name, bytes = transferred, "relay ended"),
        Some(Err(e)) if ctx.is_cancelled() => {
            info!(src = src_name, bytes = transferred, error = %e, "relay ended")
        }
        Some(Err(e)) => {
            warn!(src = src_name, bytes = transferred, error = %e, "error occurred")
        }
    }
    ctx.cancel();
}

async fn copy_half<R, W>(
    src: &mut R,
    dst: &mut W,
    dir: Direction,
    monitor: &TunnelMonitor,
    transferred: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool::get(RELAY_BUFFER_SIZE);
    loop {
        let nr = src.read(&mut buf).await?;
        if nr == 0 {
            return Ok(());
        }
        let mut written = 0;
        while written < nr {
            let nw = dst.write(&buf[written..nr]).await?;
            if nw == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
            }
            written += nw;
            *transferred += nw as u64;
            match dir {
                Direction::Up => monitor.inc_bytes_uploaded(nw as u64),
                Direction::Down => monitor.inc_bytes_downloaded(nw as u64),
            }
        }
        dst.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::AppMonitor;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn tunnel_monitor(monitor: &AppMonitor, cancel: CancellationToken) -> TunnelMonitor {
        monitor.open_tunnel_monitor(
            "",
            "ds",
            "us",
            "127.0.0.1:1".to_owned(),
            Vec::new(),
            "0.0.0.0:0".to_owned(),
            Duration::from_millis(1),
            cancel,
        )
    }

    #[tokio::test]
    async fn clean_peer_close_accounts_bytes_and_closes_both_ends() {
        let (down_local, mut down_peer) = tokio::io::duplex(1024);
        let (up_local, mut up_peer) = tokio::io::duplex(1024);

        let app_monitor = AppMonitor::new(true);
        let ctx = CancellationToken::new();
        let tm = tunnel_monitor(&app_monitor, ctx.clone());

        let relay_task = tokio::spawn(relay(
            ctx,
            tm,
            Box::new(down_local),
            Box::new(up_local),
        ));

        // Downstream peer sends five bytes, then closes.
        down_peer.write_all(b"hello").await.unwrap();
        down_peer.shutdown().await.unwrap();

        let mut got = [0u8; 5];
        up_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        // Both endpoints are closed by the relay: both peers observe EOF.
        let mut buf = [0u8; 1];
        assert_eq!(up_peer.read(&mut buf).await.unwrap(), 0);
        assert_eq!(down_peer.read(&mut buf).await.unwrap(), 0);

        relay_task.await.unwrap();
        assert_eq!(app_monitor.active_tunnels(), 0);
    }

    #[tokio::test]
    async fn bytes_flow_both_directions() {
        let (down_local, mut down_peer) = tokio::io::duplex(1024);
        let (up_local, mut up_peer) = tokio::io::duplex(1024);

        let app_monitor = AppMonitor::new(true);
        let ctx = CancellationToken::new();
        let tm = tunnel_monitor(&app_monitor, ctx.clone());
        let relay_task = tokio::spawn(relay(
            ctx,
            tm,
            Box::new(down_local),
            Box::new(up_local),
        ));

        down_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        up_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        up_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        down_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(down_peer);
        drop(up_peer);
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn external_cancel_tears_the_tunnel_down() {
        let (down_local, mut down_peer) = tokio::io::duplex(1024);
        let (up_local, mut up_peer) = tokio::io::duplex(1024);

        let app_monitor = AppMonitor::new(true);
        let ctx = CancellationToken::new();
        let tm = tunnel_monitor(&app_monitor, ctx.clone());
        let relay_task = tokio::spawn(relay(
            ctx.clone(),
            tm,
            Box::new(down_local),
            Box::new(up_local),
        ));
        assert_eq!(app_monitor.active_tunnels(), 1);

        // Nothing is flowing; tearing the tunnel down through the monitor's
        // cancel handle must still end the relay.
        app_monitor.tunnels()[0].cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), relay_task)
            .await
            .expect("relay did not stop on cancel")
            .unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(down_peer.read(&mut buf).await.unwrap(), 0);
        assert_eq!(up_peer.read(&mut buf).await.unwrap(), 0);
        assert_eq!(app_monitor.active_tunnels(), 0);
    }

    #[tokio::test]
    async fn counters_record_five_up_zero_down() {
        let (down_local, mut down_peer) = tokio::io::duplex(1024);
        let (up_local, mut up_peer) = tokio::io::duplex(1024);

        let app_monitor = AppMonitor::new(true);
        let ctx = CancellationToken::new();
        let tm = tunnel_monitor(&app_monitor, ctx.clone());
        let relay_task = tokio::spawn(relay(
            ctx,
            tm,
            Box::new(down_local),
            Box::new(up_local),
        ));

        down_peer.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        up_peer.read_exact(&mut got).await.unwrap();
        down_peer.shutdown().await.unwrap();

        relay_task.await.unwrap();
        assert_eq!(app_monitor.total_bytes_uploaded(), 5);
        assert_eq!(app_monitor.total_bytes_downloaded(), 0);
    }
}
