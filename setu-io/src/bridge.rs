//! Top-level orchestration: serial session, frame pipeline, parameters
//!
//! # Data flow
//!
//! ```text
//! serial-reader ──► FrameExtractor ──► decoder ──► TelemetryStore / ParameterExchange
//!                                  └─────────────► Router.forward_to_outputs
//!                                  └─────────────► legacy listener (optional)
//!
//! outputs / legacy clients ──► relay ──► bounded egress queue ──► serial-egress ──► SerialLink.write
//! ```
//!
//! Every complete frame is forwarded whether or not it decoded, including
//! the ones read while the link waited for the vehicle heartbeat.
//!
//! # States
//!
//! `Disconnected --connect()--> Connected --disconnect() | link dead--> Disconnected`

use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::link::{LinkOptions, SerialLink};
use crate::output::{ChannelContext, JOIN_TIMEOUT, OutputChannel, TcpServerOutput, join_bounded};
use crate::params::{BatchReport, ParamType, ParamValue, ParameterExchange, WriteResult};
use crate::protocol::decoder::MessageBody;
use crate::protocol::{
    DialectLookup, FrameExtractor, LinkIdentity, MavDecoder, MessageDecoder,
};
use crate::router::{Router, RouterHooks};
use crate::telemetry::{TelemetrySnapshot, TelemetryStore};
use crate::transport::Transport;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Inbound chunks waiting for the serial writer
const EGRESS_QUEUE_DEPTH: usize = 256;
const EGRESS_POLL: Duration = Duration::from_millis(100);

/// Builds a fresh decoder for each session
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn MessageDecoder> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub handshake_timeout: Duration,
    pub max_consecutive_errors: u32,
    pub param_timeout: Duration,
    /// Bind address for the inline listener; `None` keeps it off
    pub legacy_listener: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_consecutive_errors: 10,
            param_timeout: Duration::from_secs(3),
            legacy_listener: None,
        }
    }
}

impl BridgeConfig {
    fn link_options(&self) -> LinkOptions {
        LinkOptions {
            handshake_timeout: self.handshake_timeout,
            max_consecutive_errors: self.max_consecutive_errors,
        }
    }
}

/// Per-session traffic counters
#[derive(Debug, Default)]
struct Counters {
    bytes_in: AtomicU64,
    frames_in: AtomicU64,
    decode_failures: AtomicU64,
    relay_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub bytes_in: u64,
    pub frames_in: u64,
    pub decode_failures: u64,
    pub bytes_out: u64,
    pub relay_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStatus {
    pub connected: bool,
    pub port: Option<String>,
    pub baudrate: Option<u32>,
    pub vehicle: Option<LinkIdentity>,
    pub uptime_secs: f64,
    pub counters: CounterSnapshot,
    pub legacy_clients: usize,
}

/// Everything owned by one connection
struct Session {
    link: Arc<SerialLink>,
    baudrate: u32,
    started: Instant,
    telemetry: Arc<TelemetryStore>,
    params: Arc<ParameterExchange>,
    counters: Arc<Counters>,
    legacy: Option<Arc<TcpServerOutput>>,
    egress: Sender<Vec<u8>>,
    egress_running: Arc<AtomicBool>,
    egress_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            bytes_out: self.link.bytes_written(),
            relay_dropped: self.counters.relay_dropped.load(Ordering::Relaxed),
        }
    }

    /// Queue inbound bytes for the serial writer without blocking the reader
    fn relay(&self, bytes: &[u8]) {
        match self.egress.try_send(bytes.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.relay_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    warn!("Serial egress queue full, {} chunk(s) dropped", dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn shutdown(&self) {
        self.link.close();
        self.egress_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.egress_thread.lock().take() {
            join_bounded(vec![handle], JOIN_TIMEOUT, "serial-egress");
        }
        if let Some(legacy) = &self.legacy {
            legacy.stop();
        }
    }
}

/// Per-session frame processing, owned by the serial reader thread
struct FramePipeline {
    extractor: FrameExtractor,
    decoder: Box<dyn MessageDecoder>,
    telemetry: Arc<TelemetryStore>,
    params: Arc<ParameterExchange>,
    router: Arc<Router>,
    legacy: Option<Arc<TcpServerOutput>>,
    counters: Arc<Counters>,
}

impl FramePipeline {
    fn on_bytes(&mut self, chunk: &[u8]) {
        self.counters
            .bytes_in
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        self.extractor.push(chunk);

        while let Some(frame) = self.extractor.next_frame() {
            self.counters.frames_in.fetch_add(1, Ordering::Relaxed);

            match self.decoder.feed_frame(&frame) {
                Some(msg) => match &msg.body {
                    MessageBody::ParamValue(pv) => {
                        if !self.params.resolve(pv) {
                            debug!("Unsolicited PARAM_VALUE {}", pv.name);
                        }
                    }
                    _ => {
                        self.telemetry.apply(&msg);
                    }
                },
                None => {
                    self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                }
            }

            self.router.forward_to_outputs(&frame);
            if let Some(legacy) = &self.legacy
                && legacy.is_running()
                && let Err(e) = legacy.send(&frame)
            {
                debug!("Legacy listener send failed: {}", e);
            }
        }
    }
}

struct BridgeInner {
    router: Arc<Router>,
    sink: Arc<dyn EventSink>,
    dialect: Arc<dyn DialectLookup>,
    decoder_factory: DecoderFactory,
    config: BridgeConfig,
    /// Serializes connect/disconnect; held across the handshake
    lifecycle: Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
}

impl BridgeInner {
    fn relay_to_serial(&self, bytes: &[u8]) {
        let session = self.session.read().clone();
        match session {
            Some(session) if session.link.is_alive() => session.relay(bytes),
            _ => debug!("Not connected, dropping {} relayed bytes", bytes.len()),
        }
    }
}

/// Protocol bridge; owned by the composition root
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new(
        router: Arc<Router>,
        sink: Arc<dyn EventSink>,
        dialect: Arc<dyn DialectLookup>,
        config: BridgeConfig,
    ) -> Self {
        Self::with_decoder(
            router,
            sink,
            dialect,
            Arc::new(|| Box::new(MavDecoder::new()) as Box<dyn MessageDecoder>),
            config,
        )
    }

    pub fn with_decoder(
        router: Arc<Router>,
        sink: Arc<dyn EventSink>,
        dialect: Arc<dyn DialectLookup>,
        decoder_factory: DecoderFactory,
        config: BridgeConfig,
    ) -> Self {
        let inner = Arc::new(BridgeInner {
            router: Arc::clone(&router),
            sink: Arc::clone(&sink),
            dialect,
            decoder_factory,
            config,
            lifecycle: Mutex::new(()),
            session: RwLock::new(None),
        });

        let weak: Weak<BridgeInner> = Arc::downgrade(&inner);
        router.set_relay(Arc::new(move |bytes: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.relay_to_serial(bytes);
            }
        }));

        let weak_router = Arc::downgrade(&router);
        router.set_change_callback(Arc::new(move || {
            let Some(router) = weak_router.upgrade() else {
                return;
            };
            match serde_json::to_value(router.get_status()) {
                Ok(payload) => sink.notify("router_status", payload),
                Err(e) => warn!("Router status serialization failed: {}", e),
            }
        }));

        Self { inner }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Open a serial port and start the session
    pub fn connect(&self, port: &str, baudrate: u32) -> Result<String> {
        let _lifecycle = self.inner.lifecycle.lock();
        self.ensure_disconnected()?;

        let mut decoder = (self.inner.decoder_factory)();
        let link = SerialLink::open(
            port,
            baudrate,
            decoder.as_mut(),
            self.inner.config.link_options(),
        )?;
        self.start_session(link, baudrate, decoder)
    }

    /// Start a session over an already-open transport
    pub fn connect_transport(&self, name: &str, transport: Box<dyn Transport>) -> Result<String> {
        let _lifecycle = self.inner.lifecycle.lock();
        self.ensure_disconnected()?;

        let mut decoder = (self.inner.decoder_factory)();
        let link = SerialLink::attach(
            name,
            transport,
            decoder.as_mut(),
            self.inner.config.link_options(),
        )?;
        self.start_session(link, 0, decoder)
    }

    /// Reject a live session; tear down one whose link died
    fn ensure_disconnected(&self) -> Result<()> {
        let stale = {
            let session = self.inner.session.read();
            match session.as_ref() {
                Some(s) if s.link.is_alive() => {
                    return Err(Error::AlreadyConnected(s.link.port().to_string()));
                }
                Some(_) => true,
                None => false,
            }
        };
        if stale && let Some(session) = self.inner.session.write().take() {
            info!("Cleaning up dead session on {}", session.link.port());
            session.shutdown();
        }
        Ok(())
    }

    fn start_session(
        &self,
        link: SerialLink,
        baudrate: u32,
        decoder: Box<dyn MessageDecoder>,
    ) -> Result<String> {
        let link = Arc::new(link);
        let vehicle = link.vehicle();
        let counters = Arc::new(Counters::default());
        let telemetry = Arc::new(TelemetryStore::new(
            Arc::clone(&self.inner.dialect),
            Arc::clone(&self.inner.sink),
        ));
        let params = Arc::new(ParameterExchange::new(self.inner.config.param_timeout));

        let legacy = match &self.inner.config.legacy_listener {
            Some(addr) => Some(self.start_legacy(addr)?),
            None => None,
        };

        let (egress_tx, egress_rx) = bounded(EGRESS_QUEUE_DEPTH);
        let egress_running = Arc::new(AtomicBool::new(true));
        let egress_thread = {
            let link = Arc::clone(&link);
            let running = Arc::clone(&egress_running);
            thread::Builder::new()
                .name("serial-egress".to_string())
                .spawn(move || egress_loop(&link, &egress_rx, &running))?
        };

        let session = Arc::new(Session {
            link: Arc::clone(&link),
            baudrate,
            started: Instant::now(),
            telemetry: Arc::clone(&telemetry),
            params: Arc::clone(&params),
            counters: Arc::clone(&counters),
            legacy: legacy.clone(),
            egress: egress_tx,
            egress_running,
            egress_thread: Mutex::new(Some(egress_thread)),
        });

        let mut pipeline = FramePipeline {
            extractor: FrameExtractor::new(),
            decoder,
            telemetry,
            params,
            router: Arc::clone(&self.inner.router),
            legacy,
            counters,
        };

        *self.inner.session.write() = Some(Arc::clone(&session));
        if let Err(e) = link.start_reader(move |chunk| pipeline.on_bytes(chunk)) {
            if let Some(session) = self.inner.session.write().take() {
                session.shutdown();
            }
            return Err(e);
        }

        info!(
            "Connected to {} (system {}, component {})",
            link.port(),
            vehicle.system_id,
            vehicle.component_id
        );
        Ok(format!(
            "Connected to {} (system {}, component {})",
            link.port(),
            vehicle.system_id,
            vehicle.component_id
        ))
    }

    /// Inline TCP listener wired straight to the serial link
    fn start_legacy(&self, addr: &str) -> Result<Arc<TcpServerOutput>> {
        let hooks = Arc::new(RouterHooks::default());
        let weak = Arc::downgrade(&self.inner);
        hooks.set_relay(Arc::new(move |bytes: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.relay_to_serial(bytes);
            }
        }));
        let ctx = ChannelContext::new("legacy", Arc::default(), hooks);
        let listener = Arc::new(TcpServerOutput::new(addr.to_string(), ctx));
        listener.start()?;
        Ok(listener)
    }

    /// Close the session and report its counters
    pub fn disconnect(&self) -> Result<CounterSnapshot> {
        let _lifecycle = self.inner.lifecycle.lock();
        let session = self
            .inner
            .session
            .write()
            .take()
            .ok_or(Error::NotConnected)?;
        session.shutdown();
        let counters = session.counters();
        info!(
            "Disconnected from {}: {} bytes / {} frames in, {} decode failures, {} bytes out",
            session.link.port(),
            counters.bytes_in,
            counters.frames_in,
            counters.decode_failures,
            counters.bytes_out
        );
        Ok(counters)
    }

    /// Live session, if any and not dead
    fn live_session(&self) -> Result<Arc<Session>> {
        match self.inner.session.read().as_ref() {
            Some(s) if s.link.is_alive() => Ok(Arc::clone(s)),
            _ => Err(Error::NotConnected),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.live_session().is_ok()
    }

    pub fn get_status(&self) -> BridgeStatus {
        let session = self.inner.session.read().clone();
        match session {
            Some(s) => BridgeStatus {
                connected: s.link.is_alive(),
                port: Some(s.link.port().to_string()),
                baudrate: Some(s.baudrate),
                vehicle: Some(s.link.vehicle()),
                uptime_secs: s.started.elapsed().as_secs_f64(),
                counters: s.counters(),
                legacy_clients: s.legacy.as_ref().map_or(0, |l| l.peers()),
            },
            None => BridgeStatus {
                connected: false,
                port: None,
                baudrate: None,
                vehicle: None,
                uptime_secs: 0.0,
                counters: CounterSnapshot::default(),
                legacy_clients: 0,
            },
        }
    }

    /// Telemetry snapshot; `NotConnected` without touching the store otherwise
    pub fn get_telemetry(&self) -> Result<TelemetrySnapshot> {
        Ok(self.live_session()?.telemetry.snapshot())
    }

    pub fn get_parameter(&self, name: &str) -> Result<ParamValue> {
        let s = self.live_session()?;
        s.params
            .read(&*s.link, s.link.vehicle(), name, s.params.timeout())
    }

    /// Write a parameter; the type defaults to REAL32
    pub fn set_parameter(
        &self,
        name: &str,
        value: f64,
        param_type: Option<ParamType>,
    ) -> Result<WriteResult> {
        let s = self.live_session()?;
        s.params.write(
            &*s.link,
            s.link.vehicle(),
            name,
            value,
            param_type.unwrap_or(ParamType::Real32),
            s.params.timeout(),
        )
    }

    pub fn get_parameters_batch(&self, names: &[String]) -> Result<BatchReport<ParamValue>> {
        let s = self.live_session()?;
        Ok(s.params
            .read_batch(&*s.link, s.link.vehicle(), names, s.params.timeout()))
    }

    pub fn set_parameters_batch(
        &self,
        entries: &[(String, f64, Option<ParamType>)],
    ) -> Result<BatchReport<WriteResult>> {
        let s = self.live_session()?;
        let typed: Vec<(String, f64, ParamType)> = entries
            .iter()
            .map(|(n, v, t)| (n.clone(), *v, t.unwrap_or(ParamType::Real32)))
            .collect();
        Ok(s.params
            .write_batch(&*s.link, s.link.vehicle(), &typed, s.params.timeout()))
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(session) = self.inner.session.write().take() {
            session.shutdown();
        }
    }
}

/// Drain relayed chunks into the serial writer
fn egress_loop(link: &SerialLink, rx: &Receiver<Vec<u8>>, running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        match rx.recv_timeout(EGRESS_POLL) {
            Ok(chunk) => {
                if let Err(e) = link.write(&chunk) {
                    warn!("Serial write of {} relayed bytes failed: {}", chunk.len(), e);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}
