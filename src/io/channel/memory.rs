// src/io/channel/memory.rs
//
// In-process byte channel.
//
// `MemoryChannel` is handed to the link; the paired `MemoryDevice` plays the
// device side: it injects inbound bytes, records everything the host wrote and
// can answer writes through a responder closure. Used for simulation and tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::ByteChannel;

/// Closure called for every host write; returned bytes are queued as inbound data.
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct DeviceState {
    open: bool,
    open_count: usize,
    fail_open: bool,
    fail_read: bool,
    inbound: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    max_read: Option<usize>,
    responder: Option<Responder>,
}

struct Shared {
    state: Mutex<DeviceState>,
    readable: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread must not wedge the other side
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Host side of an in-process channel
pub struct MemoryChannel {
    name: String,
    timeout: Duration,
    shared: Arc<Shared>,
}

/// Device side of an in-process channel
#[derive(Clone)]
pub struct MemoryDevice {
    shared: Arc<Shared>,
}

impl MemoryChannel {
    /// Create a channel and its device-side handle.
    pub fn pair(name: impl Into<String>) -> (MemoryChannel, MemoryDevice) {
        let shared = Arc::new(Shared {
            state: Mutex::new(DeviceState::default()),
            readable: Condvar::new(),
        });
        (
            MemoryChannel {
                name: name.into(),
                timeout: Duration::from_millis(20),
                shared: shared.clone(),
            },
            MemoryDevice { shared },
        )
    }
}

impl ByteChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn open(&mut self) -> io::Result<()> {
        let mut state = self.shared.lock();
        if state.fail_open {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("no such device: {}", self.name)));
        }
        if !state.open {
            state.open = true;
            state.open_count += 1;
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.shared.lock();
        state.open = false;
        drop(state);
        self.shared.readable.notify_all();
    }

    fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.shared.lock();

        loop {
            if state.fail_read {
                return Err(unplugged());
            }
            if !state.open {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "channel is closed"));
            }
            if !state.inbound.is_empty() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
            }
            state = self
                .shared
                .readable
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }

        let limit = state.max_read.unwrap_or(usize::MAX).max(1);
        let n = buf.len().min(state.inbound.len()).min(limit);
        for slot in buf.iter_mut().take(n) {
            // Length checked above
            *slot = state.inbound.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.shared.lock();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel is closed"));
        }
        state.written.push(bytes.to_vec());

        let reply = state.responder.as_mut().and_then(|respond| respond(bytes));
        if let Some(reply) = reply {
            state.inbound.extend(reply);
            drop(state);
            self.shared.readable.notify_all();
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "channel is closed"))
        }
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let state = self.shared.lock();
        if state.fail_read {
            return Err(unplugged());
        }
        Ok(state.inbound.len())
    }
}

fn unplugged() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
}

impl MemoryDevice {
    /// Queue bytes for the host to read.
    pub fn push(&self, bytes: &[u8]) {
        self.shared.lock().inbound.extend(bytes.iter().copied());
        self.shared.readable.notify_all();
    }

    /// Every write the host performed, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.shared.lock().written.clone()
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    /// How many times the host opened the channel.
    pub fn open_count(&self) -> usize {
        self.shared.lock().open_count
    }

    /// Make subsequent opens fail, as an unplugged device would.
    pub fn set_fail_open(&self, fail: bool) {
        self.shared.lock().fail_open = fail;
    }

    /// Cap the number of bytes returned per read, to exercise partial reads.
    pub fn set_max_read(&self, max: Option<usize>) {
        self.shared.lock().max_read = max;
    }

    /// Answer host writes. The closure runs with the device state locked and
    /// must not call back into this handle.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.shared.lock().responder = Some(Box::new(responder));
    }

    /// Make reads fail as if the cable was pulled.
    pub fn set_fail_read(&self, fail: bool) {
        self.shared.lock().fail_read = fail;
    }

    /// Drop the connection from the device side without telling the host.
    pub fn hang_up(&self) {
        self.shared.lock().open = false;
        self.shared.readable.notify_all();
    }
}
