//! Transport adapters
//!
//! The protocol engine only ever uses the verbs of [`ModbusTransport`]:
//! send, recv, readable (select), flush, close, reconnect. Everything about
//! descriptor types, socket options or serial line disciplines stays behind
//! this trait.
//!
//! [`StreamTransport`] adapts any `AsyncRead + AsyncWrite` stream and backs
//! both the TCP transports and the in-memory duplex pairs used by the tests.
//! The `readable`/`recv` split is implemented with a small receive buffer:
//! `readable` pulls whatever the stream has into the buffer, `recv` drains
//! it. Serial ports are adapted the same way through tokio-serial when the
//! `serial` feature is enabled.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{ModbusError, ModbusResult};

/// Size of the staging buffer used by `readable`
const RX_CHUNK: usize = 512;

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames successfully written
    pub frames_sent: u64,
    /// Frames handed to the receive engine
    pub frames_received: u64,
    /// Raw bytes written
    pub bytes_sent: u64,
    /// Raw bytes read
    pub bytes_received: u64,
    /// I/O errors observed
    pub errors: u64,
}

/// Adapter verbs the protocol engine is written against
pub trait ModbusTransport: Send {
    /// Write all of `buf`; partial writes are retried until complete
    fn send(&mut self, buf: &[u8]) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Read up to `buf.len()` bytes; may return short. Returning 0 means the
    /// peer closed the transport.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = ModbusResult<usize>> + Send;

    /// Block until at least one byte is readable or the timeout elapses.
    /// Returns `true` when data is pending, `false` on timeout.
    fn readable(&mut self, timeout: Duration) -> impl Future<Output = ModbusResult<bool>> + Send;

    /// Discard buffered and pending inbound bytes; returns how many were
    /// thrown away
    fn flush(&mut self) -> impl Future<Output = ModbusResult<usize>> + Send;

    /// Close the transport
    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Re-establish the transport after a link failure. Transports without a
    /// dial-again notion report a connection error.
    fn reconnect(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Whether the transport is currently usable
    fn is_connected(&self) -> bool;

    /// Counters accumulated since creation
    fn get_stats(&self) -> TransportStats;

    /// Called by the receive engine when a complete frame has been assembled
    fn note_frame(&mut self) {}
}

/// Transport over any byte stream
pub struct StreamTransport<S> {
    stream: Option<S>,
    rx_buf: BytesMut,
    stats: TransportStats,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> StreamTransport<S> {
    /// Wrap a connected stream
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            rx_buf: BytesMut::with_capacity(RX_CHUNK),
            stats: TransportStats::default(),
        }
    }

    fn stream_mut(&mut self) -> ModbusResult<&mut S> {
        self.stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Transport is closed"))
    }

    /// Pull whatever the stream currently has into the staging buffer,
    /// waiting at most `timeout` for the first byte
    async fn fill_buffer(&mut self, timeout: Duration) -> ModbusResult<bool> {
        if !self.rx_buf.is_empty() {
            return Ok(true);
        }

        let mut chunk = [0u8; RX_CHUNK];
        let stream = self.stream_mut()?;
        match tokio::time::timeout(timeout, stream.read(&mut chunk)).await {
            Err(_) => Ok(false),
            Ok(Ok(0)) => Err(ModbusError::connection("Transport closed by peer")),
            Ok(Ok(n)) => {
                self.stats.bytes_received += n as u64;
                self.rx_buf.extend_from_slice(&chunk[..n]);
                trace!("buffered {} inbound bytes", n);
                Ok(true)
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                Err(e.into())
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ModbusTransport for StreamTransport<S> {
    async fn send(&mut self, buf: &[u8]) -> ModbusResult<()> {
        let stream = self.stream_mut()?;
        if let Err(e) = stream.write_all(buf).await {
            self.stats.errors += 1;
            return Err(e.into());
        }
        if let Err(e) = stream.flush().await {
            self.stats.errors += 1;
            return Err(e.into());
        }
        self.stats.bytes_sent += buf.len() as u64;
        self.stats.frames_sent += 1;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        if !self.rx_buf.is_empty() {
            let n = self.rx_buf.len().min(buf.len());
            buf[..n].copy_from_slice(&self.rx_buf.split_to(n));
            return Ok(n);
        }

        let stream = self.stream_mut()?;
        match stream.read(buf).await {
            Ok(n) => {
                self.stats.bytes_received += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.stats.errors += 1;
                Err(e.into())
            }
        }
    }

    async fn readable(&mut self, timeout: Duration) -> ModbusResult<bool> {
        self.fill_buffer(timeout).await
    }

    async fn flush(&mut self) -> ModbusResult<usize> {
        let mut discarded = self.rx_buf.len();
        self.rx_buf.clear();

        // Drain whatever else is already queued without blocking for more
        let mut chunk = [0u8; RX_CHUNK];
        loop {
            let stream = match self.stream_mut() {
                Ok(s) => s,
                Err(_) => break,
            };
            match tokio::time::timeout(Duration::from_millis(1), stream.read(&mut chunk)).await {
                Ok(Ok(n)) if n > 0 => {
                    self.stats.bytes_received += n as u64;
                    discarded += n;
                }
                _ => break,
            }
        }

        if discarded > 0 {
            debug!("flushed {} inbound bytes", discarded);
        }
        Ok(discarded)
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.rx_buf.clear();
        Ok(())
    }

    async fn reconnect(&mut self) -> ModbusResult<()> {
        Err(ModbusError::connection(
            "This transport cannot reconnect; dial a new stream",
        ))
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn get_stats(&self) -> TransportStats {
        self.stats
    }

    fn note_frame(&mut self) {
        self.stats.frames_received += 1;
    }
}

/// TCP transport: a [`StreamTransport`] that remembers its peer so the link
/// recovery mode can dial again
pub struct TcpTransport {
    inner: StreamTransport<TcpStream>,
    /// Peer address
    pub address: SocketAddr,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Connect to a Modbus TCP server
    pub async fn new(address: SocketAddr, connect_timeout: Duration) -> ModbusResult<Self> {
        let stream = Self::dial(address, connect_timeout).await?;
        Ok(Self {
            inner: StreamTransport::new(stream),
            address,
            connect_timeout,
        })
    }

    /// Protocol-independent connect: resolve `node` (hostname, IPv4 or IPv6
    /// literal) and `service` (port number or name) and take the first
    /// address that accepts
    pub async fn resolve(
        node: &str,
        service: &str,
        connect_timeout: Duration,
    ) -> ModbusResult<Self> {
        let target = format!("{}:{}", node, service);
        let mut last_err = None;
        for address in tokio::net::lookup_host(&target).await? {
            match Self::dial(address, connect_timeout).await {
                Ok(stream) => {
                    return Ok(Self {
                        inner: StreamTransport::new(stream),
                        address,
                        connect_timeout,
                    })
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| ModbusError::connection(format!("{} did not resolve", target))))
    }

    async fn dial(address: SocketAddr, connect_timeout: Duration) -> ModbusResult<TcpStream> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                ModbusError::timeout(
                    format!("Connecting to {}", address),
                    connect_timeout.as_millis() as u64,
                )
            })??;
        stream.set_nodelay(true)?;
        debug!("connected to {}", address);
        Ok(stream)
    }
}

impl ModbusTransport for TcpTransport {
    async fn send(&mut self, buf: &[u8]) -> ModbusResult<()> {
        self.inner.send(buf).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        self.inner.recv(buf).await
    }

    async fn readable(&mut self, timeout: Duration) -> ModbusResult<bool> {
        self.inner.readable(timeout).await
    }

    async fn flush(&mut self) -> ModbusResult<usize> {
        self.inner.flush().await
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.inner.close().await
    }

    async fn reconnect(&mut self) -> ModbusResult<()> {
        let _ = self.inner.close().await;
        let stream = Self::dial(self.address, self.connect_timeout).await?;
        let stats = self.inner.stats;
        self.inner = StreamTransport::new(stream);
        self.inner.stats = stats;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn get_stats(&self) -> TransportStats {
        self.inner.get_stats()
    }

    fn note_frame(&mut self) {
        self.inner.note_frame();
    }
}

#[cfg(feature = "serial")]
pub use serial::{RtsMode, SerialConfig, SerialTransport};

#[cfg(feature = "serial")]
mod serial {
    use super::*;
    use tokio_serial::{DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

    /// Request-to-send handling around each write on half-duplex RS485 links
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum RtsMode {
        /// Leave RTS alone
        #[default]
        None,
        /// Assert RTS for the duration of the write
        Up,
        /// Deassert RTS for the duration of the write
        Down,
    }

    /// Serial line parameters
    #[derive(Debug, Clone)]
    pub struct SerialConfig {
        /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
        pub port: String,
        /// Baud rate
        pub baud_rate: u32,
        /// Data bits
        pub data_bits: DataBits,
        /// Stop bits
        pub stop_bits: StopBits,
        /// Parity
        pub parity: Parity,
        /// RTS toggling around writes
        pub rts_mode: RtsMode,
        /// Settle delay after toggling RTS, microseconds
        pub rts_delay_us: u64,
    }

    impl SerialConfig {
        /// 8N1 defaults at the given baud rate
        pub fn new<S: Into<String>>(port: S, baud_rate: u32) -> Self {
            Self {
                port: port.into(),
                baud_rate,
                data_bits: DataBits::Eight,
                stop_bits: StopBits::One,
                parity: Parity::None,
                rts_mode: RtsMode::None,
                rts_delay_us: 0,
            }
        }
    }

    /// Serial transport for the RTU and ASCII framings
    pub struct SerialTransport {
        inner: StreamTransport<SerialStream>,
        config: SerialConfig,
    }

    impl SerialTransport {
        /// Open the serial port described by `config`
        pub fn new(config: SerialConfig) -> ModbusResult<Self> {
            let stream = Self::open(&config)?;
            Ok(Self {
                inner: StreamTransport::new(stream),
                config,
            })
        }

        fn open(config: &SerialConfig) -> ModbusResult<SerialStream> {
            let stream = tokio_serial::new(&config.port, config.baud_rate)
                .data_bits(config.data_bits)
                .stop_bits(config.stop_bits)
                .parity(config.parity)
                .open_native_async()
                .map_err(|e| {
                    ModbusError::connection(format!("Opening {}: {}", config.port, e))
                })?;
            debug!("opened {} at {} baud", config.port, config.baud_rate);
            Ok(stream)
        }

        async fn set_rts(&mut self, level: bool) -> ModbusResult<()> {
            if let Some(stream) = self.inner.stream.as_mut() {
                stream
                    .write_request_to_send(level)
                    .map_err(|e| ModbusError::connection(format!("RTS toggle failed: {}", e)))?;
                if self.config.rts_delay_us > 0 {
                    tokio::time::sleep(Duration::from_micros(self.config.rts_delay_us)).await;
                }
            }
            Ok(())
        }
    }

    impl ModbusTransport for SerialTransport {
        async fn send(&mut self, buf: &[u8]) -> ModbusResult<()> {
            match self.config.rts_mode {
                RtsMode::None => self.inner.send(buf).await,
                RtsMode::Up | RtsMode::Down => {
                    let drive = self.config.rts_mode == RtsMode::Up;
                    self.set_rts(drive).await?;
                    let result = self.inner.send(buf).await;
                    self.set_rts(!drive).await?;
                    result
                }
            }
        }

        async fn recv(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
            self.inner.recv(buf).await
        }

        async fn readable(&mut self, timeout: Duration) -> ModbusResult<bool> {
            self.inner.readable(timeout).await
        }

        async fn flush(&mut self) -> ModbusResult<usize> {
            self.inner.flush().await
        }

        async fn close(&mut self) -> ModbusResult<()> {
            self.inner.close().await
        }

        async fn reconnect(&mut self) -> ModbusResult<()> {
            let _ = self.inner.close().await;
            let stream = Self::open(&self.config)?;
            let stats = self.inner.stats;
            self.inner = StreamTransport::new(stream);
            self.inner.stats = stats;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn get_stats(&self) -> TransportStats {
            self.inner.get_stats()
        }

        fn note_frame(&mut self) {
            self.inner.note_frame();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_transport_send_recv() {
        let (client, server) = tokio::io::duplex(256);
        let mut a = StreamTransport::new(client);
        let mut b = StreamTransport::new(server);

        a.send(&[1, 2, 3, 4]).await.unwrap();

        assert!(b.readable(Duration::from_millis(50)).await.unwrap());
        let mut buf = [0u8; 8];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);

        let stats = a.get_stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_sent, 4);
    }

    #[tokio::test]
    async fn test_readable_timeout_without_data() {
        let (client, _server) = tokio::io::duplex(64);
        let mut t = StreamTransport::new(client);
        assert!(!t.readable(Duration::from_millis(20)).await.unwrap());
    }

    #[tokio::test]
    async fn test_recv_drains_staged_bytes_incrementally() {
        let (client, server) = tokio::io::duplex(64);
        let mut a = StreamTransport::new(client);
        let mut b = StreamTransport::new(server);

        a.send(&[0xAA, 0xBB, 0xCC]).await.unwrap();
        assert!(b.readable(Duration::from_millis(50)).await.unwrap());

        let mut one = [0u8; 1];
        assert_eq!(b.recv(&mut one).await.unwrap(), 1);
        assert_eq!(one[0], 0xAA);
        assert_eq!(b.recv(&mut one).await.unwrap(), 1);
        assert_eq!(one[0], 0xBB);
    }

    #[tokio::test]
    async fn test_flush_discards_pending_input() {
        let (client, server) = tokio::io::duplex(64);
        let mut a = StreamTransport::new(client);
        let mut b = StreamTransport::new(server);

        a.send(&[1, 2, 3, 4, 5]).await.unwrap();
        assert!(b.readable(Duration::from_millis(50)).await.unwrap());

        let discarded = b.flush().await.unwrap();
        assert_eq!(discarded, 5);
        assert!(!b.readable(Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_peer_reported_as_connection_error() {
        let (client, server) = tokio::io::duplex(64);
        let mut t = StreamTransport::new(client);
        drop(server);

        let result = t.readable(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ModbusError::Connection { .. })));
    }
}
