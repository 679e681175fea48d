//! Test-parameter validation and normalization.
//!
//! A run is described by a flat key→string map (the harness collects it
//! from environment variables). Each known key carries an explicit
//! [`ParamKind`] and a `required` flag, so requiredness is declared per
//! key rather than inferred from whatever its default happens to be.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

/// First TCP port used by the harness; flow `i` runs on `FIRST_PORT + i`.
pub const FIRST_PORT: u16 = 10000;

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("missing required parameter `{0}`")]
    Missing(&'static str),
    #[error("parameter `{key}` is malformed: {reason}")]
    Format { key: &'static str, reason: String },
}

/// How a raw parameter value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Numeric, coerced to `f64`.
    Float,
    /// Taken verbatim.
    Text,
    /// Compact congestion-control assignment, e.g. `cubic:1,bbr:2`.
    CcList,
}

struct ParamSpec {
    key: &'static str,
    kind: ParamKind,
    required: bool,
}

/// The fixed set of keys a run understands. Unknown keys in the input
/// map are ignored.
const PARAMS: &[ParamSpec] = &[
    ParamSpec { key: "bw", kind: ParamKind::Float, required: true },
    ParamSpec { key: "rtt", kind: ParamKind::Float, required: true },
    ParamSpec { key: "buf", kind: ParamKind::Float, required: true },
    ParamSpec { key: "loss", kind: ParamKind::Float, required: false },
    ParamSpec { key: "policer", kind: ParamKind::Float, required: false },
    ParamSpec { key: "cc", kind: ParamKind::CcList, required: true },
    ParamSpec { key: "interval", kind: ParamKind::Float, required: false },
    ParamSpec { key: "dur", kind: ParamKind::Float, required: true },
    ParamSpec { key: "outdir", kind: ParamKind::Text, required: true },
    ParamSpec { key: "qdisc", kind: ParamKind::Text, required: false },
    ParamSpec { key: "pcap", kind: ParamKind::Float, required: false },
];

/// Validated, immutable parameters for one test run.
#[derive(Debug, Clone)]
pub struct TestParams {
    /// Bottleneck bandwidth in Mbit/s.
    pub bottleneck_mbit: f64,
    /// Emulated round-trip time in ms (split evenly per direction).
    pub rtt_ms: f64,
    /// Bottleneck buffer depth in packets, on top of the BDP.
    pub buffer_packets: u64,
    /// Bottleneck random loss rate in percent.
    pub loss_percent: f64,
    /// Policer rate in Mbit/s; 0 disables the policer.
    pub policer_mbit: f64,
    /// Congestion control algorithm per flow, in start order.
    pub cc_algorithms: Vec<String>,
    /// Seconds between consecutive flow starts.
    pub start_interval_secs: f64,
    /// Test duration in seconds.
    pub duration_secs: f64,
    /// Directory for logs and metric artifacts.
    pub outdir: PathBuf,
    /// Downstream queuing discipline descriptor; empty means plain FIFO.
    pub qdisc: String,
    /// Bytes per packet to capture; 0 disables capture.
    pub snaplen_bytes: u64,
}

impl TestParams {
    /// Validate and normalize a raw parameter map.
    pub fn from_map(raw: &BTreeMap<String, String>) -> Result<Self, ParamError> {
        // Presence and shape are checked against the declared table
        // first, so a missing key is reported as missing even when a
        // later key is also malformed.
        for spec in PARAMS {
            let value = match raw.get(spec.key) {
                Some(v) => v,
                None if spec.required => return Err(ParamError::Missing(spec.key)),
                None => continue,
            };
            match spec.kind {
                ParamKind::Float => {
                    value.trim().parse::<f64>().map_err(|_| ParamError::Format {
                        key: spec.key,
                        reason: format!("`{value}` is not a number"),
                    })?;
                }
                // Expanded below; any string is a valid Text value.
                ParamKind::CcList | ParamKind::Text => {}
            }
        }

        let bottleneck_mbit = float_param(raw, "bw")?.unwrap_or(0.0);
        let rtt_ms = float_param(raw, "rtt")?.unwrap_or(0.0);
        let buffer_packets = int_param(raw, "buf")?.unwrap_or(0);
        let loss_percent = float_param(raw, "loss")?.unwrap_or(0.0);
        let policer_mbit = float_param(raw, "policer")?.unwrap_or(0.0);
        let start_interval_secs = float_param(raw, "interval")?.unwrap_or(0.0);
        let duration_secs = float_param(raw, "dur")?.unwrap_or(0.0);
        let snaplen_bytes = int_param(raw, "pcap")?.unwrap_or(0);

        // Required by the table above, so the lookups cannot miss.
        let cc_raw = raw.get("cc").map(String::as_str).unwrap_or_default();
        let cc_algorithms = parse_cc_list(cc_raw)?;
        let outdir = raw.get("outdir").map(String::as_str).unwrap_or_default();
        let qdisc = raw.get("qdisc").cloned().unwrap_or_default();

        let params = Self {
            bottleneck_mbit,
            rtt_ms,
            buffer_packets,
            loss_percent,
            policer_mbit,
            cc_algorithms,
            start_interval_secs,
            duration_secs,
            outdir: PathBuf::from(outdir),
            qdisc,
            snaplen_bytes,
        };
        params.validate()?;
        Ok(params)
    }

    /// Number of concurrent flows in this run.
    pub fn flow_count(&self) -> usize {
        self.cc_algorithms.len()
    }

    fn validate(&self) -> Result<(), ParamError> {
        require_positive("bw", self.bottleneck_mbit)?;
        require_positive("rtt", self.rtt_ms)?;
        require_positive("dur", self.duration_secs)?;
        require_non_negative("loss", self.loss_percent)?;
        require_non_negative("policer", self.policer_mbit)?;
        require_non_negative("interval", self.start_interval_secs)?;
        if self.outdir.as_os_str().is_empty() {
            return Err(ParamError::Format {
                key: "outdir",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Expand a compact congestion-control assignment into one algorithm
/// name per flow: `"cubic:1,bbr:2"` becomes `["cubic", "bbr", "bbr"]`.
pub fn parse_cc_list(raw: &str) -> Result<Vec<String>, ParamError> {
    let mut flows = Vec::new();
    for group in raw.split(',') {
        let parts: Vec<&str> = group.split(':').collect();
        if parts.len() != 2 {
            return Err(ParamError::Format {
                key: "cc",
                reason: format!("group `{group}` is not of the form name:count"),
            });
        }
        let count: usize = parts[1].parse().map_err(|_| ParamError::Format {
            key: "cc",
            reason: format!("flow count `{}` is not a positive integer", parts[1]),
        })?;
        if count == 0 {
            return Err(ParamError::Format {
                key: "cc",
                reason: format!("flow count for `{}` must be positive", parts[0]),
            });
        }
        for _ in 0..count {
            flows.push(parts[0].to_string());
        }
    }
    Ok(flows)
}

fn float_param(raw: &BTreeMap<String, String>, key: &'static str) -> Result<Option<f64>, ParamError> {
    match raw.get(key) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ParamError::Format {
                key,
                reason: format!("`{v}` is not a number"),
            }),
    }
}

fn int_param(raw: &BTreeMap<String, String>, key: &'static str) -> Result<Option<u64>, ParamError> {
    match raw.get(key) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ParamError::Format {
                key,
                reason: format!("`{v}` is not a non-negative integer"),
            }),
    }
}

fn require_positive(key: &'static str, value: f64) -> Result<(), ParamError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(ParamError::Format {
            key,
            reason: format!("must be positive, got {value}"),
        })
    }
}

fn require_non_negative(key: &'static str, value: f64) -> Result<(), ParamError> {
    if value >= 0.0 {
        Ok(())
    } else {
        Err(ParamError::Format {
            key,
            reason: format!("must not be negative, got {value}"),
        })
    }
}
