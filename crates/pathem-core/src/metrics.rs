//! Aggregate metrics over a parsed socket-statistics time series.
//!
//! Retransmission rates come from the *last observed* cumulative
//! counters per port (they are running totals, never summed across
//! samples). The median RTT pools every smoothed-RTT sample of every
//! flow at every instant into one distribution.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;

use crate::sslog::TimeSeries;

/// Scalar results of one run.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    /// Retransmission rate per port, as a fraction of data segments sent.
    pub per_flow_retrans: BTreeMap<u16, f64>,
    /// Aggregate retransmission rate, weighted by data segments sent
    /// (not a mean of the per-flow rates).
    pub aggregate_retrans: f64,
    /// Median smoothed RTT across all pooled samples, in milliseconds.
    pub median_srtt_ms: f64,
}

/// Compute all metrics from a parsed time series.
pub fn compute(series: &TimeSeries) -> Metrics {
    let mut last_retrans: BTreeMap<u16, u64> = BTreeMap::new();
    let mut last_data_segs: BTreeMap<u16, u64> = BTreeMap::new();
    let mut rtts_secs: Vec<f64> = Vec::new();

    for sample in &series.samples {
        for (&port, flow) in &sample.flows {
            last_retrans.insert(port, flow.retrans);
            last_data_segs.insert(port, flow.data_segs_out);
            if let Some(rtt) = flow.srtt_secs {
                rtts_secs.push(rtt);
            }
        }
    }

    let mut per_flow_retrans = BTreeMap::new();
    let mut total_retrans: u64 = 0;
    let mut total_data_segs: u64 = 0;
    for (&port, &segs) in &last_data_segs {
        let retrans = last_retrans.get(&port).copied().unwrap_or(0);
        let rate = if segs == 0 {
            tracing::warn!(port, "no data segments sent; retransmit rate set to 0");
            0.0
        } else {
            retrans as f64 / segs as f64
        };
        per_flow_retrans.insert(port, rate);
        total_retrans += retrans;
        total_data_segs += segs;
    }

    let aggregate_retrans = if total_data_segs == 0 {
        if !per_flow_retrans.is_empty() {
            tracing::warn!("no data segments sent on any flow; aggregate rate set to 0");
        }
        0.0
    } else {
        total_retrans as f64 / total_data_segs as f64
    };

    Metrics {
        per_flow_retrans,
        aggregate_retrans,
        median_srtt_ms: median(&rtts_secs) * 1000.0,
    }
}

/// Median of a sample set; the average of the two middle elements for
/// even lengths, 0 for an empty input.
pub fn median(nums: &[f64]) -> f64 {
    if nums.is_empty() {
        return 0.0;
    }
    let mut sorted = nums.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    (sorted[n / 2] + sorted[(n - 1) / 2]) / 2.0
}

impl Metrics {
    /// Write the single-value result artifacts: one per-flow
    /// retransmission-rate file (percent, ascending port order), the
    /// aggregate rate, and the pooled median RTT in milliseconds.
    pub fn write_artifacts(&self, outdir: &Path) -> io::Result<()> {
        for (i, rate) in self.per_flow_retrans.values().enumerate() {
            fs::write(
                outdir.join(format!("retrans.out.{i}.txt")),
                format!("{:.5}\n", rate * 100.0),
            )?;
        }
        fs::write(
            outdir.join("retrans.out.total.txt"),
            format!("{:.5}\n", self.aggregate_retrans * 100.0),
        )?;
        fs::write(
            outdir.join("rtt_p50.out.total.txt"),
            format!("{}\n", self.median_srtt_ms),
        )?;
        Ok(())
    }
}
