//! Parameter read/write over the asynchronous request/echo exchange
//!
//! Every call registers a one-shot channel under the parameter name before
//! the request frame goes out. The serial reader resolves it when a
//! matching PARAM_VALUE arrives. The registration is dropped when the call
//! returns, whether it was answered or timed out.
//!
//! Only one caller may wait on a given name at a time; a second concurrent
//! request for the same name fails with `Error::ParamBusy`.

use crate::error::{Error, Result};
use crate::protocol::decoder::ParamValueMsg;
use crate::protocol::{FrameBuilder, LinkIdentity};
use crossbeam_channel::{Receiver, Sender, bounded};
use mavlink::common::MavParamType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Float tolerance for write verification
pub const FLOAT_TOLERANCE: f64 = 0.001;

/// MAV_PARAM_TYPE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ParamType {
    Uint8 = 1,
    Int8 = 2,
    Uint16 = 3,
    Int16 = 4,
    Uint32 = 5,
    Int32 = 6,
    Uint64 = 7,
    Int64 = 8,
    Real32 = 9,
    Real64 = 10,
}

impl ParamType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Uint8,
            2 => Self::Int8,
            3 => Self::Uint16,
            4 => Self::Int16,
            5 => Self::Uint32,
            6 => Self::Int32,
            7 => Self::Uint64,
            8 => Self::Int64,
            9 => Self::Real32,
            10 => Self::Real64,
            _ => return None,
        })
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, Self::Real32 | Self::Real64)
    }

    /// Whether an echoed value confirms the requested one
    pub fn verify(self, requested: f64, actual: f64) -> bool {
        if self.is_integer() {
            requested as i64 == actual as i64
        } else {
            (actual - requested).abs() < FLOAT_TOLERANCE
        }
    }
}

impl From<ParamType> for MavParamType {
    fn from(t: ParamType) -> Self {
        match t {
            ParamType::Uint8 => MavParamType::MAV_PARAM_TYPE_UINT8,
            ParamType::Int8 => MavParamType::MAV_PARAM_TYPE_INT8,
            ParamType::Uint16 => MavParamType::MAV_PARAM_TYPE_UINT16,
            ParamType::Int16 => MavParamType::MAV_PARAM_TYPE_INT16,
            ParamType::Uint32 => MavParamType::MAV_PARAM_TYPE_UINT32,
            ParamType::Int32 => MavParamType::MAV_PARAM_TYPE_INT32,
            ParamType::Uint64 => MavParamType::MAV_PARAM_TYPE_UINT64,
            ParamType::Int64 => MavParamType::MAV_PARAM_TYPE_INT64,
            ParamType::Real32 => MavParamType::MAV_PARAM_TYPE_REAL32,
            ParamType::Real64 => MavParamType::MAV_PARAM_TYPE_REAL64,
        }
    }
}

/// A parameter as reported by the vehicle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamValue {
    pub name: String,
    pub value: f64,
    #[serde(rename = "type")]
    pub param_type: Option<ParamType>,
    pub index: u16,
    pub count: u16,
}

impl From<&ParamValueMsg> for ParamValue {
    fn from(msg: &ParamValueMsg) -> Self {
        Self {
            name: msg.name.clone(),
            value: msg.value as f64,
            param_type: ParamType::from_code(msg.param_type),
            index: msg.index,
            count: msg.count,
        }
    }
}

/// Outcome of a single write
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteResult {
    pub success: bool,
    pub verified: bool,
    pub requested: f64,
    pub actual_value: f64,
}

/// Outcome of a sequential batch; every name lands in exactly one map
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport<T> {
    pub success: bool,
    pub values: BTreeMap<String, T>,
    pub errors: BTreeMap<String, String>,
}

impl<T> BatchReport<T> {
    fn new() -> Self {
        Self {
            success: true,
            values: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }

    fn record(&mut self, name: &str, outcome: Result<T>) {
        match outcome {
            Ok(value) => {
                self.values.insert(name.to_string(), value);
            }
            Err(e) => {
                log::warn!("Batch entry {} failed: {}", name, e);
                self.errors.insert(name.to_string(), e.to_string());
                self.success = false;
            }
        }
    }
}

/// Destination for request frames (the serial link in production)
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &[u8]) -> Result<()>;
}

/// Name-keyed correlation of requests and PARAM_VALUE echoes
pub struct ParameterExchange {
    pending: Mutex<HashMap<String, Sender<ParamValue>>>,
    builder: FrameBuilder,
    timeout: Duration,
}

/// Removes the pending entry when the waiting call returns
struct PendingGuard<'a> {
    exchange: &'a ParameterExchange,
    name: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.exchange.pending.lock().remove(&self.name);
    }
}

impl ParameterExchange {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            builder: FrameBuilder::default(),
            timeout,
        }
    }

    /// Default per-call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of calls currently waiting for an echo
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(&self, name: &str) -> Result<(PendingGuard<'_>, Receiver<ParamValue>)> {
        let mut pending = self.pending.lock();
        if pending.contains_key(name) {
            return Err(Error::ParamBusy(name.to_string()));
        }
        let (tx, rx) = bounded(1);
        pending.insert(name.to_string(), tx);
        Ok((
            PendingGuard {
                exchange: self,
                name: name.to_string(),
            },
            rx,
        ))
    }

    /// Hand an incoming PARAM_VALUE to its waiting caller.
    ///
    /// Returns false when nobody was waiting on that name.
    pub fn resolve(&self, msg: &ParamValueMsg) -> bool {
        let pending = self.pending.lock();
        match pending.get(&msg.name) {
            Some(tx) => {
                // A full slot means an earlier echo already answered this call
                let _ = tx.try_send(ParamValue::from(msg));
                true
            }
            None => false,
        }
    }

    fn exchange(
        &self,
        sink: &dyn FrameSink,
        name: &str,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<ParamValue> {
        let (_guard, rx) = self.register(name)?;
        sink.send_frame(frame)?;
        rx.recv_timeout(timeout)
            .map_err(|_| Error::ParamTimeout(name.to_string()))
    }

    /// Request one parameter by name
    pub fn read(
        &self,
        sink: &dyn FrameSink,
        target: LinkIdentity,
        name: &str,
        timeout: Duration,
    ) -> Result<ParamValue> {
        let frame = self.builder.param_request_read(target, name)?;
        log::debug!("PARAM_REQUEST_READ {}", name);
        self.exchange(sink, name, &frame, timeout)
    }

    /// Set one parameter and verify the echoed value
    pub fn write(
        &self,
        sink: &dyn FrameSink,
        target: LinkIdentity,
        name: &str,
        value: f64,
        param_type: ParamType,
        timeout: Duration,
    ) -> Result<WriteResult> {
        let frame = self.builder.param_set(target, name, value, param_type)?;
        log::debug!("PARAM_SET {} = {} ({:?})", name, value, param_type);
        let echo = self.exchange(sink, name, &frame, timeout)?;

        let verified = param_type.verify(value, echo.value);
        if !verified {
            log::warn!(
                "Parameter {} echoed {} after request {}",
                name,
                echo.value,
                value
            );
        }
        Ok(WriteResult {
            success: true,
            verified,
            requested: value,
            actual_value: echo.value,
        })
    }

    /// Sequential reads; one failure does not stop the rest
    pub fn read_batch(
        &self,
        sink: &dyn FrameSink,
        target: LinkIdentity,
        names: &[String],
        timeout: Duration,
    ) -> BatchReport<ParamValue> {
        let mut report = BatchReport::new();
        for name in names {
            report.record(name, self.read(sink, target, name, timeout));
        }
        report
    }

    /// Sequential writes; one failure does not stop the rest
    pub fn write_batch(
        &self,
        sink: &dyn FrameSink,
        target: LinkIdentity,
        entries: &[(String, f64, ParamType)],
        timeout: Duration,
    ) -> BatchReport<WriteResult> {
        let mut report = BatchReport::new();
        for (name, value, param_type) in entries {
            report.record(
                name,
                self.write(sink, target, name, *value, *param_type, timeout),
            );
        }
        report
    }
}
