use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serialport::SerialPort;

/// Byte transport under a [`crate::DeviceChannel`].
pub trait SerialLink: Send {
    fn name(&self) -> &str;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Bytes already buffered on the receive side.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Reads at most `buf.len()` bytes. Only called with `buf` no larger
    /// than [`SerialLink::bytes_available`], so it never waits.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

pub struct SerialPortLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialPortLink {
    pub fn new(name: impl Into<String>, port: Box<dyn SerialPort>) -> Self { Self { name: name.into(), port } }
}

impl SerialLink for SerialPortLink {
    fn name(&self) -> &str { &self.name }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read().map_err(io::Error::from)? as usize)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> { self.port.read(buf) }
}

#[derive(Default)]
struct LoopbackState {
    written: Vec<u8>,
    incoming: VecDeque<u8>,
    fail_writes: bool,
    echo: bool,
}

/// In-process emulated device. Records every written byte and, when echo is
/// on, answers each complete line with the same line. Clones share state.
#[derive(Clone)]
pub struct LoopbackLink {
    name: String,
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), state: Arc::new(Mutex::new(LoopbackState { echo: true, ..Default::default() })) }
    }

    pub fn silent(name: impl Into<String>) -> Self {
        let link = Self::new(name);
        link.state.lock().echo = false;
        link
    }

    pub fn set_fail_writes(&self, fail: bool) { self.state.lock().fail_writes = fail; }

    pub fn push_incoming(&self, text: &str) { self.state.lock().incoming.extend(text.as_bytes()); }

    pub fn written(&self) -> Vec<u8> { self.state.lock().written.clone() }

    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.state.lock().written).lines().map(str::to_string).collect()
    }
}

impl SerialLink for LoopbackLink {
    fn name(&self) -> &str { &self.name }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut st = self.state.lock();
        if st.fail_writes { return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected")); }
        st.written.extend_from_slice(bytes);
        if st.echo { st.incoming.extend(bytes.iter().copied()); }
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> { Ok(self.state.lock().incoming.len()) }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.state.lock();
        let n = buf.len().min(st.incoming.len());
        for (slot, b) in buf.iter_mut().zip(st.incoming.drain(..n)) { *slot = b; }
        Ok(n)
    }
}
