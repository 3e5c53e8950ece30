//! Bidirectional byte relay between a source and a target stream

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ForwardError;
use crate::registry::ByteCounters;

const RELAY_BUFFER_SIZE: usize = 8192;

/// Totals reported when a relay ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_target: u64,
    pub bytes_to_source: u64,
}

/// Which event ended the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEnd {
    SourceClosed,
    TargetClosed,
    Cancelled,
}

/// Copy from `reader` to `writer` until end-of-stream
async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Relay bytes between `source` and `target` until either direction ends
///
/// Both directions run concurrently. As soon as one of them reaches
/// end-of-stream or fails, or `cancel` fires, both streams are dropped,
/// which closes the underlying sockets and unblocks the other direction.
/// Mid-stream I/O failures are reported as [`ForwardError::Stream`].
pub async fn relay<S, T>(
    source: S,
    target: T,
    cancel: CancellationToken,
    counters: ByteCounters,
) -> Result<RelayStats, ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut source_read, mut source_write) = tokio::io::split(source);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let outcome = {
        let source_to_target = pump(&mut source_read, &mut target_write, &counters.to_target);
        let target_to_source = pump(&mut target_read, &mut source_write, &counters.to_source);

        tokio::select! {
            _ = cancel.cancelled() => Ok(RelayEnd::Cancelled),
            result = source_to_target => result.map(|_| RelayEnd::SourceClosed),
            result = target_to_source => result.map(|_| RelayEnd::TargetClosed),
        }
    };

    // Dropping the halves closes both sockets
    drop((source_read, source_write, target_read, target_write));

    let stats = RelayStats {
        bytes_to_target: counters.to_target.load(Ordering::Relaxed),
        bytes_to_source: counters.to_source.load(Ordering::Relaxed),
    };

    match outcome {
        Ok(end) => {
            debug!(
                ?end,
                bytes_to_target = stats.bytes_to_target,
                bytes_to_source = stats.bytes_to_source,
                "Relay finished"
            );
            Ok(stats)
        }
        Err(e) => Err(ForwardError::Stream(e)),
    }
}
