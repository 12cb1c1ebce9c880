//! SetuIO - serial protocol bridge and router for FPV ground control
//!
//! Owns the serial link to a flight controller, reconstructs protocol
//! frames from the byte stream, keeps a telemetry snapshot, and fans the
//! raw frames out to a runtime-configurable set of network outputs
//! (TCP server, TCP client, UDP). Bytes sent back by any output are
//! relayed to the flight controller.
//!
//! ## Composition
//!
//! ```no_run
//! use setu_io::{ArduPilotDialect, Bridge, BridgeConfig, JsonFileStore, NullSink, Router};
//! use std::sync::Arc;
//!
//! let router = Router::new(Arc::new(JsonFileStore::new("/tmp/outputs.json")));
//! let bridge = Bridge::new(router, Arc::new(NullSink), Arc::new(ArduPilotDialect), BridgeConfig::default());
//! bridge.connect("/dev/ttyACM0", 115_200)?;
//! # Ok::<(), setu_io::Error>(())
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod output;
pub mod params;
pub mod protocol;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use bridge::{Bridge, BridgeConfig, BridgeStatus, CounterSnapshot};
pub use config::AppConfig;
pub use error::{Error, Result};
pub use events::{ChannelSink, EventSink, NullSink, Subscription};
pub use output::{OutputConfig, OutputKind, OutputUpdate};
pub use params::{ParamType, ParamValue, WriteResult};
pub use protocol::{ArduPilotDialect, DialectLookup, MavDecoder, MessageDecoder};
pub use router::{Router, RouterStatus};
pub use store::{JsonFileStore, MemoryStore, PreferencesStore};
pub use telemetry::TelemetrySnapshot;
