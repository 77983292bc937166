//! Body buffer: bytes received for an operation but not yet consumed by the application.
//! One producer (the frame loop) and one consumer (the application) share a handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::ObexError;

const INITIAL_CAPACITY: usize = 100;

/// Wake interval of blocking reads; `closed` is re-checked on every wake.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Inner {
    buffer: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    /// Producer is done; readers drain what is left, then see end of stream.
    finished: bool,
    /// Stream torn down; readers fail.
    closed: bool,
}

impl Inner {
    fn available(&self) -> usize {
        self.write_pos - self.read_pos
    }

    fn push(&mut self, data: &[u8]) {
        while self.write_pos + data.len() > self.buffer.len() {
            let mut grown = vec![0u8; (self.buffer.len() * 2).max(INITIAL_CAPACITY)];
            let live = self.available();
            grown[..live].copy_from_slice(&self.buffer[self.read_pos..self.write_pos]);
            self.buffer = grown;
            self.write_pos = live;
            self.read_pos = 0;
        }
        self.buffer[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    fn take(&mut self, out: &mut [u8]) -> usize {
        let n = self.available().min(out.len());
        out[..n].copy_from_slice(&self.buffer[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
        n
    }
}

#[derive(Clone)]
pub struct BodyBuffer {
    shared: Arc<(Mutex<Inner>, Condvar)>,
}

impl std::fmt::Debug for BodyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.0.lock();
        f.debug_struct("BodyBuffer")
            .field("available", &inner.available())
            .field("finished", &inner.finished)
            .field("closed", &inner.closed)
            .finish()
    }
}

impl Default for BodyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyBuffer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(Inner {
                    buffer: vec![0u8; INITIAL_CAPACITY],
                    read_pos: 0,
                    write_pos: 0,
                    finished: false,
                    closed: false,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Append bytes, growing the buffer as needed. Ignored once closed.
    pub fn push(&self, data: &[u8]) {
        let (lock, cvar) = &*self.shared;
        let mut inner = lock.lock();
        if inner.closed {
            return;
        }
        inner.push(data);
        cvar.notify_all();
    }

    /// Mark the end of the body.
    pub fn finish(&self) {
        let (lock, cvar) = &*self.shared;
        lock.lock().finished = true;
        cvar.notify_all();
    }

    /// Tear down: pending and future reads fail with `ConnectionClosed`.
    pub fn close(&self) {
        let (lock, cvar) = &*self.shared;
        let mut inner = lock.lock();
        inner.closed = true;
        inner.read_pos = 0;
        inner.write_pos = 0;
        cvar.notify_all();
    }

    /// Bytes ready to read (0 once closed).
    pub fn available(&self) -> usize {
        let inner = self.shared.0.lock();
        if inner.closed {
            0
        } else {
            inner.available()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared.0.lock().finished
    }

    pub fn is_closed(&self) -> bool {
        self.shared.0.lock().closed
    }

    /// Copy what is available without waiting. `Ok(0)` means nothing buffered right now.
    pub fn try_read(&self, out: &mut [u8]) -> Result<usize, ObexError> {
        let mut inner = self.shared.0.lock();
        if inner.closed {
            return Err(ObexError::ConnectionClosed);
        }
        Ok(inner.take(out))
    }

    /// Wait until data arrives, the body finishes (returns 0), the buffer is closed
    /// (`ConnectionClosed`) or `timeout` elapses (`Cancelled`).
    pub fn read_blocking(&self, out: &mut [u8], timeout: Option<Duration>) -> Result<usize, ObexError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let (lock, cvar) = &*self.shared;
        let mut inner = lock.lock();
        loop {
            if inner.closed {
                return Err(ObexError::ConnectionClosed);
            }
            if inner.available() > 0 || out.is_empty() {
                return Ok(inner.take(out));
            }
            if inner.finished {
                return Ok(0);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ObexError::Cancelled);
            }
            cvar.wait_for(&mut inner, POLL_INTERVAL);
        }
    }

    /// Take every buffered byte.
    pub fn drain(&self) -> Result<Vec<u8>, ObexError> {
        let mut inner = self.shared.0.lock();
        if inner.closed {
            return Err(ObexError::ConnectionClosed);
        }
        let mut out = vec![0u8; inner.available()];
        inner.take(&mut out);
        Ok(out)
    }
}
