//! Byte-stream transports the engine talks through.
//!
//! The engine only needs `write_all`, a non-blocking `bytes_available` and `read`.
//! The handle is shared between the transmit and receive loops as
//! [`SharedTransport`]; the lock is held for one call at a time and never across an
//! `.await`. All errors are plain `std::io::Error` and are treated as transient.
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

pub trait Transport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Number of bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub fn shared(transport: impl Transport + 'static) -> SharedTransport {
    Arc::new(Mutex::new(Box::new(transport)))
}

/// Run one call against the shared transport.
pub(crate) fn with_transport<R>(
    transport: &SharedTransport,
    f: impl FnOnce(&mut dyn Transport) -> io::Result<R>,
) -> io::Result<R> {
    let mut guard = transport.lock().unwrap_or_else(PoisonError::into_inner);
    f(guard.as_mut())
}

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

#[cfg(feature = "serial")]
mod serial {
    use super::Transport;
    use anyhow::{anyhow, Result};
    use log::debug;
    use serialport::{ClearBuffer, SerialPort};
    use std::io::{self, Read, Write};
    use std::time::Duration;

    /// UART link to the radio module.
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport {
        pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
            let mut builder =
                serialport::new(port_name, baud_rate).timeout(Duration::from_millis(200));
            #[cfg(unix)]
            {
                builder = builder
                    .data_bits(serialport::DataBits::Eight)
                    .stop_bits(serialport::StopBits::One)
                    .parity(serialport::Parity::None);
            }
            let mut port = builder
                .open()
                .map_err(|e| anyhow!("Failed to open serial port {}: {}", port_name, e))?;

            // The radio modules reset on DTR/RTS, keep both deasserted
            let _ = port.write_data_terminal_ready(false);
            let _ = port.write_request_to_send(false);
            // Drop whatever the module printed before we attached
            let _ = port.clear(ClearBuffer::All);

            debug!("Serial port {} opened at {} baud", port_name, baud_rate);
            Ok(Self { port })
        }
    }

    impl Transport for SerialTransport {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.port.write_all(bytes)?;
            self.port.flush()
        }

        fn bytes_available(&mut self) -> io::Result<usize> {
            self.port
                .bytes_to_read()
                .map(|n| n as usize)
                .map_err(io::Error::from)
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.port.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                other => other,
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    inbound: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    fail_writes: usize,
    fail_reads: usize,
}

/// In-process transport for tests and offline runs.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

/// Test-side end of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryLink {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryLink) {
        let inner = Arc::new(Mutex::new(MemoryInner::default()));
        (
            Self {
                inner: inner.clone(),
            },
            MemoryLink { inner },
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut inner = self.lock();
        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure"));
        }
        inner.written.push(bytes.to_vec());
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let mut inner = self.lock();
        if inner.fail_reads > 0 {
            inner.fail_reads -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "simulated read failure"));
        }
        Ok(inner.inbound.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        let n = buf.len().min(inner.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inner.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl MemoryLink {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make bytes available to the engine's next read.
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().inbound.extend(bytes.iter().copied());
    }

    /// Every write the engine made, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.lock().fail_writes = n;
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.lock().fail_reads = n;
    }

    pub fn unread(&self) -> usize {
        self.lock().inbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_transport_moves_bytes_both_ways() {
        let (mut transport, link) = MemoryTransport::pair();
        link.inject(b"S002;1;2E");
        assert_eq!(transport.bytes_available().unwrap(), 9);
        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"S002");
        assert_eq!(link.unread(), 5);

        transport.write_all(b"S001;0;0E").unwrap();
        assert_eq!(link.written(), vec![b"S001;0;0E".to_vec()]);
    }

    #[test]
    fn simulated_failures_are_consumed() {
        let (mut transport, link) = MemoryTransport::pair();
        link.fail_next_writes(1);
        link.fail_next_reads(1);
        assert!(transport.write_all(b"x").is_err());
        assert!(transport.write_all(b"x").is_ok());
        assert!(transport.bytes_available().is_err());
        assert_eq!(transport.bytes_available().unwrap(), 0);
    }
}
