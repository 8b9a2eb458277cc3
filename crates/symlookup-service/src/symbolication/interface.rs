use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::symcaches::CacheStatus;
use crate::utils::hex::HexValue;

/// A batch lookup request, the body of `POST /symbolicate/v5`.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolicationRequest {
    pub jobs: Vec<SymbolicationJob>,
}

/// One job of a batch: a list of modules and stacks referencing them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolicationJob {
    /// The modules of this job as `[debug_filename, debug_id]` pairs.
    pub memory_map: Vec<(String, String)>,
    pub stacks: Vec<Vec<RawFrame>>,
}

/// A frame to symbolicate: `[module_index, module_offset]`.
///
/// A module index of `-1` marks a frame outside of any known module.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct RawFrame(pub i64, pub HexValue);

impl RawFrame {
    pub const NO_MODULE: i64 = -1;
}

/// Per-request options that are passed outside of the request body.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestOptions {
    /// Whether try sources are consulted after all regular sources.
    pub include_try: bool,
    /// Whether the response carries a [`DebugInfo`] payload.
    pub debug: bool,
}

/// The response to a [`SymbolicationRequest`], with one result per job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolicationResponse {
    pub results: Vec<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobResult {
    pub stacks: Vec<Vec<SymbolicatedFrame>>,
    /// For every module of the memory map, keyed `debug_filename/DEBUG_ID`:
    /// `true` if its symbols were found, `false` if not, and `null` if no frame referenced it.
    pub found_modules: BTreeMap<String, Option<bool>>,
}

/// A frame of the response.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SymbolicatedFrame {
    /// The index of this frame in its stack.
    pub frame: usize,
    pub module_offset: HexValue,
    /// The debug filename of the module, unless the frame had no module.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_offset: Option<HexValue>,
}

/// Diagnostics about how the modules of a request were resolved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugInfo {
    /// The number of distinct modules that were looked up.
    pub modules_looked_up: usize,
    /// The number of frames that were symbolicated.
    pub frames_symbolicated: usize,
    pub modules: BTreeMap<String, ModuleDiagnostics>,
    /// Total time spent resolving modules, in milliseconds.
    pub resolve_ms: u64,
}

/// How the symbols of one module were obtained.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleDiagnostics {
    pub found: bool,
    pub status: CacheStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convert_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Errors that fail a whole [`SymbolicationRequest`].
///
/// Problems with individual modules never end up here, they are reported per module instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SymbolicationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("symbol cache unavailable")]
    StoreUnavailable(#[source] Arc<std::io::Error>),
    #[error(transparent)]
    Overloaded(#[from] MaxRequestsError),
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("maximum number of concurrent requests reached")]
pub struct MaxRequestsError;
