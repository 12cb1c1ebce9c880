//! Serial link to the flight controller
//!
//! # Threads
//!
//! ```text
//! serial-reader   owns a cloned transport handle, hands every chunk to the
//!                 session's byte handler
//! (callers)       write through the one writer lock
//! ```
//!
//! # Failure policy
//!
//! Read errors back off linearly (100 ms per consecutive failure, at most
//! 1 s). After `max_consecutive_errors` in a row the link is declared dead
//! and the reader exits; the owner sees `is_alive() == false`.

use crate::error::{Error, Result};
use crate::output::join_bounded;
use crate::params::FrameSink;
use crate::protocol::encoder::GCS_SYSTEM_ID;
use crate::protocol::{FrameExtractor, LinkIdentity, MessageDecoder};
use crate::transport::{SerialTransport, Transport, write_all};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Sleep between empty handshake polls
const HANDSHAKE_POLL: Duration = Duration::from_millis(10);
const BACKOFF_STEP: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(1);
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub handshake_timeout: Duration,
    pub max_consecutive_errors: u32,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_consecutive_errors: 10,
        }
    }
}

/// Result of a successful handshake
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Identity reported by the first vehicle heartbeat
    pub vehicle: LinkIdentity,
    /// Every frame read while waiting (the heartbeat included), followed by
    /// any partial frame after it. Line noise between frames is dropped.
    pub replay: Vec<u8>,
}

/// Wait for a vehicle heartbeat on `transport`.
///
/// Heartbeats from other ground stations sharing the link are ignored.
/// Frames consumed here are handed back in `Handshake::replay` so the
/// session still forwards and interprets them.
pub fn handshake(
    transport: &mut dyn Transport,
    decoder: &mut dyn MessageDecoder,
    timeout: Duration,
) -> Result<Handshake> {
    let deadline = Instant::now() + timeout;
    let mut extractor = FrameExtractor::new();
    let mut replay = Vec::new();
    let mut buf = [0u8; 1024];

    while Instant::now() < deadline {
        let n = match transport.available()? {
            0 => 0,
            avail => {
                let len = avail.min(buf.len());
                transport.read(&mut buf[..len])?
            }
        };
        if n == 0 {
            thread::sleep(HANDSHAKE_POLL);
            continue;
        }

        extractor.push(&buf[..n]);
        while let Some(frame) = extractor.next_frame() {
            replay.extend_from_slice(&frame);
            let Some(msg) = decoder.feed_frame(&frame) else {
                continue;
            };
            if msg.is_heartbeat() && msg.system_id != GCS_SYSTEM_ID {
                let vehicle = LinkIdentity::new(msg.system_id, msg.component_id);
                replay.extend(extractor.take_buffered());
                return Ok(Handshake { vehicle, replay });
            }
        }
    }
    Err(Error::HandshakeTimeout(timeout))
}

/// Backoff before retrying after `failures` consecutive errors
pub fn backoff(failures: u32) -> Duration {
    (BACKOFF_STEP * failures).min(BACKOFF_MAX)
}

/// Open serial link with a running (or startable) reader
pub struct SerialLink {
    port: String,
    vehicle: LinkIdentity,
    writer: Mutex<Option<Box<dyn Transport>>>,
    reader: Mutex<Option<Box<dyn Transport>>>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
    replay: Mutex<Vec<u8>>,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    bytes_written: AtomicU64,
    options: LinkOptions,
}

impl SerialLink {
    /// Open a serial device and wait for the vehicle heartbeat
    pub fn open(
        port: &str,
        baudrate: u32,
        decoder: &mut dyn MessageDecoder,
        options: LinkOptions,
    ) -> Result<Self> {
        let transport = SerialTransport::open(port, baudrate)?;
        Self::attach(port, Box::new(transport), decoder, options)
    }

    /// Handshake over an already-open transport.
    ///
    /// On failure the transport is dropped, which closes the device.
    pub fn attach(
        name: &str,
        mut transport: Box<dyn Transport>,
        decoder: &mut dyn MessageDecoder,
        options: LinkOptions,
    ) -> Result<Self> {
        let hs = match handshake(transport.as_mut(), decoder, options.handshake_timeout) {
            Ok(hs) => hs,
            Err(e) => {
                warn!("Handshake on {} failed: {}", name, e);
                return Err(e);
            }
        };
        info!(
            "Heartbeat from system {} component {} on {}",
            hs.vehicle.system_id, hs.vehicle.component_id, name
        );

        let reader = transport.try_clone()?;
        Ok(Self {
            port: name.to_string(),
            vehicle: hs.vehicle,
            writer: Mutex::new(Some(transport)),
            reader: Mutex::new(Some(reader)),
            reader_thread: Mutex::new(None),
            replay: Mutex::new(hs.replay),
            running: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(true)),
            bytes_written: AtomicU64::new(0),
            options,
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Identity learned during the handshake
    pub fn vehicle(&self) -> LinkIdentity {
        self.vehicle
    }

    /// False once the retry budget is exhausted or the link is closed
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Serialized write shared by every producer
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let transport = writer.as_mut().ok_or(Error::NotConnected)?;
        write_all(transport.as_mut(), data)?;
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Spawn the reader thread. Frames read during the handshake are
    /// delivered first.
    pub fn start_reader<F>(&self, mut on_bytes: F) -> Result<()>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let mut transport = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| Error::AlreadyRunning(format!("{} reader", self.port)))?;

        let replay = std::mem::take(&mut *self.replay.lock());
        let running = Arc::clone(&self.running);
        let alive = Arc::clone(&self.alive);
        let max_errors = self.options.max_consecutive_errors.max(1);
        let port = self.port.clone();

        running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || {
                if !replay.is_empty() {
                    on_bytes(&replay);
                }
                read_loop(transport.as_mut(), &mut on_bytes, &running, max_errors);
                if running.load(Ordering::SeqCst) {
                    error!("Serial link {} declared dead", port);
                    alive.store(false, Ordering::SeqCst);
                }
                debug!("Serial reader for {} exiting", port);
            });
        match handle {
            Ok(handle) => {
                *self.reader_thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stop the reader (bounded join) and release the device
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_thread.lock().take() {
            join_bounded(vec![handle], READER_JOIN_TIMEOUT, "serial-reader");
        }
        self.writer.lock().take();
        self.reader.lock().take();
        self.alive.store(false, Ordering::SeqCst);
        info!("Serial link {} closed", self.port);
    }
}

impl FrameSink for SerialLink {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.write(frame)
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.close();
        }
    }
}

/// Reader body; returns when `running` clears or the retry budget is spent
fn read_loop(
    transport: &mut dyn Transport,
    on_bytes: &mut dyn FnMut(&[u8]),
    running: &AtomicBool,
    max_errors: u32,
) {
    let mut buf = [0u8; 4096];
    let mut failures = 0u32;

    while running.load(Ordering::Relaxed) {
        // Bulk-read what is already buffered, otherwise block for at most
        // the port timeout
        let result = match transport.available() {
            Ok(0) => transport.read(&mut buf),
            Ok(n) => {
                let len = n.min(buf.len());
                transport.read(&mut buf[..len])
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(n) => {
                failures = 0;
                if n > 0 {
                    on_bytes(&buf[..n]);
                }
            }
            Err(e) => {
                failures += 1;
                if failures >= max_errors {
                    error!(
                        "Serial read failed {} times in a row, giving up: {}",
                        failures, e
                    );
                    return;
                }
                let delay = backoff(failures);
                warn!(
                    "Serial read error ({}/{}), retrying in {:?}: {}",
                    failures, max_errors, delay, e
                );
                sleep_while(running, delay);
            }
        }
    }
}

/// Sleep in short slices so a stop request is noticed
fn sleep_while(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}
