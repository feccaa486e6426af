//! Trait abstraction for serial port reads to enable testing

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Trait for serial port I/O operations
#[async_trait]
pub trait SerialPortIO: Send {
    /// Read available bytes into `buf`.
    ///
    /// Returns the number of bytes read; `0` means the device reached end of
    /// stream (for a serial port: it was unplugged).
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Adapter implementing [`SerialPortIO`] for any async reader
pub struct AsyncReadPort<R> {
    inner: R,
}

/// A tokio-serial stream behind [`SerialPortIO`]
pub type TokioSerialPort = AsyncReadPort<tokio_serial::SerialStream>;

impl<R> AsyncReadPort<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Unwrap the underlying reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[async_trait]
impl<R> SerialPortIO for AsyncReadPort<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }
}


#[cfg(test)]
mod tests {
    use super::mocks::MockSerialPort;
    use super::*;

    #[tokio::test]
    async fn test_async_read_port_reads_through() {
        let reader = tokio_test::io::Builder::new()
            .read(b"12,34\n")
            .read(b"56")
            .build();
        let mut port = AsyncReadPort::new(reader);

        let mut buf = [0u8; 16];
        let n = port.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"12,34\n");
        let n = port.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"56");
        assert_eq!(port.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_async_read_port_surfaces_errors() {
        let reader = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
            .build();
        let mut port = AsyncReadPort::new(reader);

        let mut buf = [0u8; 4];
        let err = port.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_mock_splits_large_chunks() {
        let (mut port, handle) = MockSerialPort::with_chunks(&[b"abcdef"]);

        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(port.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(handle.read_count(), 2);
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn test_mock_reports_release() {
        let (port, handle) = MockSerialPort::new();
        assert!(!handle.is_released());
        drop(port);
        assert!(handle.is_released());
    }
}
