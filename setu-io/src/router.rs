//! Output registry with fan-out, fan-in and persistence
//!
//! # Locking
//!
//! - `ops` serializes mutating operations (add/remove/update/start/stop/restart)
//!   and is held across socket setup and bounded thread joins.
//! - `registry` guards the entry list and is only held for short
//!   lookups and copies. Fan-out clones the running channels out of it and
//!   sends with no lock held.
//! - Hooks are invoked with neither lock held, so a change callback may call
//!   `get_status()` freely.

use crate::error::{Error, Result};
use crate::output::{
    ChannelContext, OutputChannel, OutputConfig, OutputKind, OutputStats, OutputUpdate,
    StatsSnapshot, create_output,
};
use crate::store::PreferencesStore;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;

/// Fan-in target for bytes read back from any output
pub type Relay = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Fired after any state change
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;
/// Builds the channel for a config
pub type OutputFactory =
    Arc<dyn Fn(&OutputConfig, ChannelContext) -> Result<Arc<dyn OutputChannel>> + Send + Sync>;

/// Callbacks shared between the router and every output thread
#[derive(Default)]
pub struct RouterHooks {
    relay: RwLock<Option<Relay>>,
    on_change: RwLock<Option<ChangeCallback>>,
}

impl RouterHooks {
    pub fn set_relay(&self, relay: Relay) {
        *self.relay.write() = Some(relay);
    }

    pub fn set_change_callback(&self, callback: ChangeCallback) {
        *self.on_change.write() = Some(callback);
    }

    /// Deliver inbound bytes; dropped when no relay is set
    pub fn relay(&self, bytes: &[u8]) {
        let relay = self.relay.read().clone();
        match relay {
            Some(relay) => relay(bytes),
            None => debug!("No relay set, dropping {} inbound bytes", bytes.len()),
        }
    }

    pub fn changed(&self) {
        let callback = self.on_change.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[derive(Clone)]
struct OutputEntry {
    config: OutputConfig,
    channel: Arc<dyn OutputChannel>,
    stats: Arc<OutputStats>,
}

/// Status of one output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputStatus {
    #[serde(flatten)]
    pub config: OutputConfig,
    pub running: bool,
    pub clients: usize,
    pub local_addr: Option<String>,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterStatus {
    pub outputs: Vec<OutputStatus>,
    pub total: usize,
    pub active: usize,
}

pub struct Router {
    registry: Mutex<Vec<OutputEntry>>,
    ops: Mutex<()>,
    hooks: Arc<RouterHooks>,
    store: Arc<dyn PreferencesStore>,
    factory: OutputFactory,
}

impl Router {
    /// Router over real sockets, restoring the persisted outputs
    pub fn new(store: Arc<dyn PreferencesStore>) -> Arc<Self> {
        Self::with_factory(store, Arc::new(create_output))
    }

    /// Router with a custom channel factory
    pub fn with_factory(store: Arc<dyn PreferencesStore>, factory: OutputFactory) -> Arc<Self> {
        let router = Arc::new(Self {
            registry: Mutex::new(Vec::new()),
            ops: Mutex::new(()),
            hooks: Arc::new(RouterHooks::default()),
            store,
            factory,
        });
        router.load();
        router
    }

    pub fn hooks(&self) -> &Arc<RouterHooks> {
        &self.hooks
    }

    /// Set the single fan-in callback
    pub fn set_relay(&self, relay: Relay) {
        self.hooks.set_relay(relay);
    }

    pub fn set_change_callback(&self, callback: ChangeCallback) {
        self.hooks.set_change_callback(callback);
    }

    /// Recreate persisted outputs, skipping unsupported types
    fn load(&self) {
        let configs = match self.store.get_router_outputs() {
            Ok(configs) => configs,
            Err(e) => {
                warn!("Failed to load router outputs: {}", e);
                return;
            }
        };

        let _ops = self.ops.lock();
        for config in configs {
            if config.kind == OutputKind::Unsupported {
                warn!("Skipping persisted output '{}': unsupported type", config.id);
                continue;
            }
            if self.find(&config.id).is_some() {
                warn!("Skipping persisted output '{}': duplicate id", config.id);
                continue;
            }
            let entry = match self.build_entry(&config, Arc::default()) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping persisted output '{}': {}", config.id, e);
                    continue;
                }
            };
            let channel = Arc::clone(&entry.channel);
            self.registry.lock().push(entry);
            if config.enabled
                && config.auto_start
                && let Err(e) = channel.start()
            {
                warn!("Persisted output '{}' failed to start: {}", config.id, e);
            }
        }
        info!("Router loaded {} output(s)", self.registry.lock().len());
    }

    fn build_entry(&self, config: &OutputConfig, stats: Arc<OutputStats>) -> Result<OutputEntry> {
        let ctx = ChannelContext::new(&config.id, Arc::clone(&stats), Arc::clone(&self.hooks));
        let channel = (self.factory)(config, ctx)?;
        Ok(OutputEntry {
            config: config.clone(),
            channel,
            stats,
        })
    }

    fn find(&self, id: &str) -> Option<OutputEntry> {
        self.registry
            .lock()
            .iter()
            .find(|e| e.config.id == id)
            .cloned()
    }

    fn entry(&self, id: &str) -> Result<OutputEntry> {
        self.find(id)
            .ok_or_else(|| Error::OutputNotFound(id.to_string()))
    }

    /// Overwrite the persisted list with the live registry
    fn persist(&self) {
        let configs: Vec<OutputConfig> = self
            .registry
            .lock()
            .iter()
            .map(|e| e.config.clone())
            .collect();
        if let Err(e) = self.store.set_router_outputs(&configs) {
            warn!("Failed to persist router outputs: {}", e);
        }
    }

    pub fn add_output(&self, config: OutputConfig) -> Result<String> {
        let message = {
            let _ops = self.ops.lock();
            if config.kind == OutputKind::Unsupported {
                return Err(Error::UnsupportedOutput(config.id));
            }
            if self.find(&config.id).is_some() {
                return Err(Error::DuplicateOutput(config.id));
            }

            let entry = self.build_entry(&config, Arc::default())?;
            let channel = Arc::clone(&entry.channel);
            self.registry.lock().push(entry);
            self.persist();
            info!("Added output '{}' ({})", config.id, config.kind.as_str());

            if config.enabled && config.auto_start {
                match channel.start() {
                    Ok(msg) => format!("Output '{}' added: {}", config.id, msg),
                    Err(e) => {
                        warn!("Output '{}' added but failed to start: {}", config.id, e);
                        format!("Output '{}' added, but start failed: {}", config.id, e)
                    }
                }
            } else {
                format!("Output '{}' added", config.id)
            }
        };
        self.hooks.changed();
        Ok(message)
    }

    pub fn remove_output(&self, id: &str) -> Result<String> {
        {
            let _ops = self.ops.lock();
            let entry = {
                let mut registry = self.registry.lock();
                let pos = registry
                    .iter()
                    .position(|e| e.config.id == id)
                    .ok_or_else(|| Error::OutputNotFound(id.to_string()))?;
                registry.remove(pos)
            };
            entry.channel.stop();
            self.persist();
            info!("Removed output '{}'", id);
        }
        self.hooks.changed();
        Ok(format!("Output '{}' removed", id))
    }

    /// Apply field changes; restarts the output if it was running and is
    /// still enabled. A failed restart still reports success, with a warning.
    pub fn update_output(&self, id: &str, update: OutputUpdate) -> Result<String> {
        if update.kind == Some(OutputKind::Unsupported) {
            return Err(Error::UnsupportedOutput(id.to_string()));
        }

        let message = {
            let _ops = self.ops.lock();
            let old = self.entry(id)?;
            let was_running = old.channel.is_running();

            let mut config = old.config.clone();
            update.apply_to(&mut config);
            let replacement = self.build_entry(&config, Arc::clone(&old.stats))?;

            if was_running {
                old.channel.stop();
            }
            let channel = Arc::clone(&replacement.channel);
            {
                let mut registry = self.registry.lock();
                if let Some(slot) = registry.iter_mut().find(|e| e.config.id == id) {
                    *slot = replacement;
                }
            }
            self.persist();
            info!("Updated output '{}'", id);

            if was_running && config.enabled {
                match channel.start() {
                    Ok(_) => format!("Output '{}' updated and restarted", id),
                    Err(e) => {
                        warn!("Output '{}' updated but restart failed: {}", id, e);
                        format!("Output '{}' updated, but restart failed: {}", id, e)
                    }
                }
            } else {
                format!("Output '{}' updated", id)
            }
        };
        self.hooks.changed();
        Ok(message)
    }

    pub fn start_output(&self, id: &str) -> Result<String> {
        let message = {
            let _ops = self.ops.lock();
            let entry = self.entry(id)?;
            if entry.channel.is_running() {
                return Err(Error::AlreadyRunning(id.to_string()));
            }
            entry.channel.start()?
        };
        self.hooks.changed();
        Ok(message)
    }

    pub fn stop_output(&self, id: &str) -> Result<String> {
        {
            let _ops = self.ops.lock();
            let entry = self.entry(id)?;
            if !entry.channel.is_running() {
                return Err(Error::NotRunning(id.to_string()));
            }
            entry.channel.stop();
        }
        self.hooks.changed();
        Ok(format!("Output '{}' stopped", id))
    }

    /// Unconditional stop + start
    pub fn restart_output(&self, id: &str) -> Result<String> {
        let result = {
            let _ops = self.ops.lock();
            let entry = self.entry(id)?;
            entry.channel.stop();
            entry.channel.start()
        };
        self.hooks.changed();
        result
    }

    /// Stop every output without touching the persisted list
    pub fn stop_all(&self) {
        let _ops = self.ops.lock();
        let entries = self.registry.lock().clone();
        for entry in entries.iter().filter(|e| e.channel.is_running()) {
            entry.channel.stop();
        }
    }

    /// Send one frame to every running output.
    ///
    /// Failures are counted per output and never stop delivery to the rest.
    pub fn forward_to_outputs(&self, data: &[u8]) {
        let running: Vec<OutputEntry> = self
            .registry
            .lock()
            .iter()
            .filter(|e| e.channel.is_running())
            .cloned()
            .collect();

        for entry in running {
            match entry.channel.send(data) {
                // Nobody to deliver to (tcp_server without clients)
                Ok(0) => {}
                Ok(_) => entry.stats.record_tx(),
                Err(e) => {
                    entry.stats.record_error();
                    debug!("Send to '{}' failed: {}", entry.config.id, e);
                }
            }
        }
    }

    pub fn get_status(&self) -> RouterStatus {
        let entries = self.registry.lock().clone();
        let outputs: Vec<OutputStatus> = entries
            .iter()
            .map(|e| OutputStatus {
                config: e.config.clone(),
                running: e.channel.is_running(),
                clients: e.channel.peers(),
                local_addr: e.channel.local_addr().map(|a| a.to_string()),
                stats: e.stats.snapshot(),
            })
            .collect();
        let active = outputs.iter().filter(|o| o.running).count();
        RouterStatus {
            total: outputs.len(),
            active,
            outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-process output that records what it was sent
    struct RecordingOutput {
        running: AtomicBool,
        fail_sends: bool,
        fail_start: bool,
        no_peers: bool,
        received: Mutex<Vec<Vec<u8>>>,
    }

    impl OutputChannel for RecordingOutput {
        fn start(&self) -> Result<String> {
            if self.fail_start {
                return Err(Error::AddrInUse("test".into()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok("started".into())
        }

        fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }

        fn send(&self, data: &[u8]) -> Result<usize> {
            if self.fail_sends {
                return Err(Error::Other("broken pipe".into()));
            }
            if self.no_peers {
                return Ok(0);
            }
            self.received.lock().push(data.to_vec());
            Ok(1)
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    type Created = Arc<Mutex<Vec<(String, Arc<RecordingOutput>)>>>;

    /// Factory: hosts named "fail" refuse sends, "nostart" refuse to start,
    /// "empty" accept sends with nobody listening
    fn recording_factory() -> (OutputFactory, Created) {
        let created: Created = Arc::default();
        let log = created.clone();
        let factory: OutputFactory = Arc::new(move |config: &OutputConfig, _ctx: ChannelContext| {
            let out = Arc::new(RecordingOutput {
                running: AtomicBool::new(false),
                fail_sends: config.host == "fail",
                fail_start: config.host == "nostart",
                no_peers: config.host == "empty",
                received: Mutex::new(Vec::new()),
            });
            log.lock().push((config.id.clone(), out.clone()));
            Ok(out as Arc<dyn OutputChannel>)
        });
        (factory, created)
    }

    fn latest(created: &Created, id: &str) -> Arc<RecordingOutput> {
        created
            .lock()
            .iter()
            .rev()
            .find(|(i, _)| i == id)
            .map(|(_, o)| o.clone())
            .unwrap()
    }

    fn router() -> (Arc<Router>, Arc<MemoryStore>, Created) {
        let store = Arc::new(MemoryStore::default());
        let (factory, created) = recording_factory();
        (Router::with_factory(store.clone(), factory), store, created)
    }

    fn persisted_matches_live(router: &Router, store: &MemoryStore) -> bool {
        let live: Vec<OutputConfig> = router
            .get_status()
            .outputs
            .into_iter()
            .map(|o| o.config)
            .collect();
        store.get_router_outputs().unwrap() == live
    }

    #[test]
    fn test_duplicate_id_rejected_without_side_effects() {
        let (router, store, created) = router();
        router
            .add_output(OutputConfig::new("a", OutputKind::Udp, "h", 1))
            .unwrap();
        let before = router.get_status();

        let err = router
            .add_output(OutputConfig::new("a", OutputKind::TcpServer, "h", 2))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateOutput(_)));
        assert_eq!(router.get_status(), before);
        assert_eq!(created.lock().len(), 1);
        assert!(persisted_matches_live(&router, &store));
    }

    #[test]
    fn test_persisted_list_tracks_mutations() {
        let (router, store, _) = router();
        router
            .add_output(OutputConfig::new("a", OutputKind::Udp, "h", 1))
            .unwrap();
        router
            .add_output(OutputConfig::new("b", OutputKind::TcpClient, "h", 2))
            .unwrap();
        assert!(persisted_matches_live(&router, &store));

        router
            .update_output(
                "a",
                OutputUpdate {
                    kind: Some(OutputKind::TcpServer),
                    port: Some(5760),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(persisted_matches_live(&router, &store));
        assert_eq!(store.get_router_outputs().unwrap()[0].kind, OutputKind::TcpServer);

        router.remove_output("b").unwrap();
        assert!(persisted_matches_live(&router, &store));
        assert_eq!(router.get_status().total, 1);
    }

    #[test]
    fn test_failing_output_does_not_block_others() {
        let (router, _, created) = router();
        for (id, host) in [("a", "ok"), ("b", "fail"), ("c", "ok")] {
            router
                .add_output(OutputConfig::new(id, OutputKind::Udp, host, 1))
                .unwrap();
        }

        router.forward_to_outputs(b"frame");

        assert_eq!(latest(&created, "a").received.lock().as_slice(), [b"frame".to_vec()]);
        assert_eq!(latest(&created, "c").received.lock().as_slice(), [b"frame".to_vec()]);
        let status = router.get_status();
        let stats: Vec<StatsSnapshot> = status.outputs.iter().map(|o| o.stats).collect();
        assert_eq!(stats[0], StatsSnapshot { tx: 1, rx: 0, errors: 0 });
        assert_eq!(stats[1], StatsSnapshot { tx: 0, rx: 0, errors: 1 });
        assert_eq!(stats[2], StatsSnapshot { tx: 1, rx: 0, errors: 0 });
    }

    #[test]
    fn test_send_without_peers_is_not_counted() {
        let (router, _, _) = router();
        router
            .add_output(OutputConfig::new("idle", OutputKind::TcpServer, "empty", 1))
            .unwrap();

        router.forward_to_outputs(b"frame");
        router.forward_to_outputs(b"frame");

        let status = router.get_status();
        assert_eq!(status.outputs[0].stats, StatsSnapshot::default());
    }

    #[test]
    fn test_start_stop_reject_redundant_calls() {
        let (router, _, _) = router();
        let mut config = OutputConfig::new("a", OutputKind::Udp, "h", 1);
        config.auto_start = false;
        router.add_output(config).unwrap();

        assert!(matches!(router.stop_output("a"), Err(Error::NotRunning(_))));
        router.start_output("a").unwrap();
        assert!(matches!(router.start_output("a"), Err(Error::AlreadyRunning(_))));
        router.stop_output("a").unwrap();
        assert!(matches!(router.start_output("zz"), Err(Error::OutputNotFound(_))));
    }

    #[test]
    fn test_update_reports_restart_failure_as_warning() {
        let (router, store, _) = router();
        router
            .add_output(OutputConfig::new("a", OutputKind::Udp, "ok", 1))
            .unwrap();

        let msg = router
            .update_output(
                "a",
                OutputUpdate {
                    host: Some("nostart".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(msg.contains("restart failed"));
        assert_eq!(store.get_router_outputs().unwrap()[0].host, "nostart");
        assert!(!router.get_status().outputs[0].running);
    }

    #[test]
    fn test_load_skips_unsupported_and_autostarts() {
        let store = Arc::new(MemoryStore::default());
        let mut unsupported = OutputConfig::new("legacy", OutputKind::Udp, "h", 1);
        unsupported.kind = OutputKind::Unsupported;
        let mut idle = OutputConfig::new("idle", OutputKind::Udp, "h", 2);
        idle.auto_start = false;
        store
            .set_router_outputs(&[
                OutputConfig::new("live", OutputKind::TcpServer, "h", 3),
                unsupported,
                idle,
            ])
            .unwrap();

        let (factory, _) = recording_factory();
        let router = Router::with_factory(store, factory);
        let status = router.get_status();
        assert_eq!(status.total, 2);
        assert_eq!(status.active, 1);
        assert_eq!(status.outputs[0].config.id, "live");
    }

    #[test]
    fn test_change_callback_may_query_status() {
        let (router, _, _) = router();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let weak = Arc::downgrade(&router);
        router.set_change_callback(Arc::new(move || {
            if let Some(r) = weak.upgrade() {
                let _ = r.get_status();
            }
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        router
            .add_output(OutputConfig::new("a", OutputKind::Udp, "h", 1))
            .unwrap();
        router.restart_output("a").unwrap();
        router.remove_output("a").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let (router, _, _) = router();
        let mut config = OutputConfig::new("x", OutputKind::Udp, "h", 1);
        config.kind = OutputKind::Unsupported;
        assert!(matches!(
            router.add_output(config),
            Err(Error::UnsupportedOutput(_))
        ));
        assert_eq!(router.get_status().total, 0);
    }
}
