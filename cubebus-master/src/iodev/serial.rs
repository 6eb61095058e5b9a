//! RS-485 adapter access through a serial port.

use std::collections::VecDeque;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

use super::{IoDevice, IoDirection, IoEvent};

/// A bus device backed by a serial port.
///
/// Writes queue locally and are flushed by the event pump; the completed
/// flush is reported as [`IoEvent::TransferComplete`], which on a half-duplex
/// bus is the point where the adapter releases the line.
pub struct SerialIoDevice {
    port: SerialStream,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl SerialIoDevice {
    /// Opens the serial port at `path` with the given baud rate.
    pub fn open(path: &str, baud: u32) -> tokio_serial::Result<Self> {
        let port = tokio_serial::new(path, baud).open_native_async()?;
        Ok(Self {
            port,
            rx: VecDeque::new(),
            tx: Vec::new(),
        })
    }
}

#[async_trait]
impl IoDevice for SerialIoDevice {
    async fn event(&mut self) -> io::Result<IoEvent> {
        if !self.tx.is_empty() {
            let pending = std::mem::take(&mut self.tx);
            self.port.write_all(&pending).await?;
            self.port.flush().await?;
            return Ok(IoEvent::TransferComplete);
        }

        let mut buf = [0u8; 64];
        loop {
            let n = self.port.read(&mut buf).await?;
            if n > 0 {
                self.rx.extend(&buf[..n]);
                return Ok(IoEvent::ReadyRead);
            }
        }
    }

    fn bytes_to_read(&self) -> usize {
        self.rx.len()
    }

    fn write_room(&self) -> usize {
        usize::MAX - self.tx.len()
    }

    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = dst.len().min(self.rx.len());
        for slot in dst[..n].iter_mut() {
            *slot = self.rx.pop_front().expect("length checked above");
        }
        Ok(n)
    }

    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        self.tx.extend_from_slice(src);
        Ok(src.len())
    }

    fn clear(&mut self, direction: IoDirection) {
        match direction {
            IoDirection::Input => {
                self.rx.clear();
                let _ = self.port.clear(ClearBuffer::Input);
            }
            IoDirection::Output => {
                self.tx.clear();
                let _ = self.port.clear(ClearBuffer::Output);
            }
            IoDirection::All => {
                self.rx.clear();
                self.tx.clear();
                let _ = self.port.clear(ClearBuffer::All);
            }
        }
    }
}
