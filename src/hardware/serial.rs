//! Serial port helpers shared by both links.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: type-erased boxed serial port
//!
//! Anything implementing the async I/O traits can stand in for a port, which is how
//! the simulated boards plug in through `tokio::io::duplex`.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::hardware::LinkId;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Example
///
/// ```rust,ignore
/// use lickport_rig::hardware::{open_serial_async, LinkId};
///
/// let port = open_serial_async(LinkId::Motor, &config.motor).await?;
/// ```
pub async fn open_serial_async(
    link: LinkId,
    config: &LinkConfig,
) -> Result<tokio_serial::SerialStream, LinkError> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path = config.port.clone();
    let baud_rate = config.baud_rate;

    let opened = spawn_blocking(move || {
        tokio_serial::new(&port_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| LinkError::Disconnected {
        link,
        reason: format!("spawn_blocking for serial port opening failed: {e}"),
    })?;

    let port = opened.map_err(|source| LinkError::Open {
        link,
        port: config.port.clone(),
        source,
    })?;
    tracing::info!(%link, port = %config.port, baud = baud_rate, "Opened serial port");
    Ok(port)
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives within `timeout_ms`. Boards print a banner
/// on reset; this clears it before the reader starts.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn drain_discards_banner() {
        let (mut board, mut host) = tokio::io::duplex(64);
        board.write_all(b"motor v2.1 ready\n").await.unwrap();

        let discarded = drain_serial_buffer(&mut host, 20).await;
        assert_eq!(discarded, 17);

        let mut buf = [0u8; 1];
        let next = tokio::time::timeout(Duration::from_millis(10), host.read(&mut buf)).await;
        assert!(next.is_err(), "buffer should be empty after drain");
    }

    #[tokio::test]
    async fn duplex_is_a_serial_port() {
        let (_board, host) = tokio::io::duplex(8);
        let port: DynSerial = Box::new(host);
        drop(port);
    }
}
