//! Wire protocol between the coordinator and its modules.
//!
//! Two channels exist per module:
//!
//! - the **registry channel**: small serde_json datagrams a module sends
//!   to the coordinator's registry socket to announce itself and prove
//!   liveness ([`RegistryRequest`] / [`RegistryReply`]);
//! - the **step channel**: a request/reply stream the coordinator opens
//!   to the address the module registered, carrying length-prefixed
//!   serde_json frames ([`ModuleRequest`] / [`ModuleResponse`]).
//!
//! Frame layout: 4-byte big-endian payload length followed by the JSON
//! body. Frames above [`MAX_FRAME_LEN`](crate::consts::MAX_FRAME_LEN)
//! are rejected on read so a corrupted peer cannot force an allocation.
//!
//! Domain payloads (vehicle states, sensor frames, ...) stay opaque
//! bytes: the coordinator moves them, it never interprets them.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::consts::MAX_FRAME_LEN;
use crate::status::ModuleResponseType;

// ─── Registry channel ───────────────────────────────────────────────

/// Datagram a module sends to the registry socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryRequest {
    /// Announce the module's step-channel address under its
    /// registration key.
    Register { key: String, uuid: String, addr: String },
    /// Withdraw the registration on intentional shutdown.
    Unregister { key: String, uuid: String },
    /// Periodic liveness refresh.
    Heartbeat { key: String, uuid: String },
}

impl RegistryRequest {
    /// Registration key the request addresses.
    pub fn key(&self) -> &str {
        match self {
            RegistryRequest::Register { key, .. }
            | RegistryRequest::Unregister { key, .. }
            | RegistryRequest::Heartbeat { key, .. } => key,
        }
    }
}

/// Reply datagram sent back to the requesting module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryReply {
    /// Registration or refresh accepted; carries the heartbeat interval
    /// the module must keep.
    Accepted { heartbeat_interval_ms: u32 },
    Rejected { reason: String },
    /// The coordinator is ejecting the module: it must send Unregister
    /// and exit.
    Disconnecting,
}

// ─── Step channel ───────────────────────────────────────────────────

/// One step exchange, carrying the virtual time and topic payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    /// Virtual simulation time [ms].
    pub sim_time_ms: u64,
    /// Wall-clock seconds since the epoch at dispatch.
    pub cur_time_s: f64,
    /// Inline payloads of the module's subscribed topics.
    #[serde(default)]
    pub messages: HashMap<String, Vec<u8>>,
    /// Shared-memory segment names for subscribed shmem topics. An
    /// empty name means nothing has been published yet.
    #[serde(default)]
    pub sub_topic_shmem_names: HashMap<String, String>,
    /// Shared-memory segment names the module must write its published
    /// shmem topics into.
    #[serde(default)]
    pub pub_topic_shmem_names: HashMap<String, String>,
}

/// Reset parameters broadcast to every module at scenario start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetParams {
    /// Scenario file the run plays. Parsing it is the modules' (and the
    /// scenario parser's) business, not the coordinator's.
    pub scenario_path: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Request frame on the step channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleRequest {
    Init {
        init_args: HashMap<String, String>,
        group: String,
    },
    Reset(ResetParams),
    Step(StepRequest),
    Stop,
}

/// Reply frame on the step channel. One shape serves all requests: the
/// Init reply fills the topic declarations, a Step reply fills the
/// published messages, a Stop reply may fill feedback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleResponse {
    pub ec: ModuleResponseType,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub sub_topics: Vec<String>,
    #[serde(default)]
    pub pub_topics: Vec<String>,
    #[serde(default)]
    pub sub_shmems: Vec<String>,
    #[serde(default)]
    pub pub_shmems: Vec<(String, usize)>,
    /// Published inline topic payloads.
    #[serde(default)]
    pub messages: Vec<(String, Vec<u8>)>,
    /// Final feedback key/values (Stop reply).
    #[serde(default)]
    pub feedback: HashMap<String, String>,
    /// Module-side step wall time [ms].
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ModuleResponse {
    /// Synthesized response for a request that never got a reply.
    pub fn timed_out() -> Self {
        Self {
            ec: ModuleResponseType::Timeout,
            err: "no response within the allowed window".to_string(),
            ..Default::default()
        }
    }
}

// ─── Frame codec ────────────────────────────────────────────────────

/// Write one length-prefixed frame.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds the {} byte limit", payload.len(), MAX_FRAME_LEN),
        ));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(payload)?;
    w.flush()
}

/// Read one length-prefixed frame.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("incoming frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

/// Serialize a message and write it as one frame.
pub fn write_message<W: Write, T: Serialize>(w: &mut W, msg: &T) -> io::Result<()> {
    let payload = serde_json::to_vec(msg)?;
    write_frame(w, &payload)
}

/// Read one frame and deserialize it.
pub fn read_message<R: Read, T: for<'de> Deserialize<'de>>(r: &mut R) -> io::Result<T> {
    let payload = read_frame(r)?;
    Ok(serde_json::from_slice(&payload)?)
}
