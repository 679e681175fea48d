//! pathem — netem path-emulation harness for TCP evaluation.
//!
//! Derives `tc netem`/HTB shaping for a fixed five-node bottleneck
//! chain (`srv — srt — mid — crt — cli`), samples per-connection
//! socket statistics while traffic runs, and distills the log into
//! retransmission-rate and median-RTT artifacts.
//!
//! Test parameters arrive as environment variables (`bw`, `rtt`,
//! `buf`, `cc`, `dur`, `outdir`, and the optional `loss`, `policer`,
//! `interval`, `qdisc`, `pcap`); namespace construction and traffic
//! generation are driven by external tooling.

use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pathem_core::metrics;
use pathem_core::params::TestParams;
use pathem_core::shaping::ShapingConfig;
use pathem_core::sslog;
use pathem_harness::{apply, sampler};

#[derive(Parser, Debug)]
#[command(name = "pathem", about = "TCP path-emulation test harness")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the derived shaping directives for the current parameters.
    Derive {
        /// Also apply them via `ip netns exec`.
        #[arg(long, default_value_t = false)]
        apply: bool,
    },
    /// Run the periodic `ss` sampling loop for the test duration.
    Sample,
    /// Parse `ss.log` and write the metric artifacts.
    Analyze {
        /// Also print the metrics as JSON on stdout.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Apply shaping, sample for the duration, then analyze.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let raw: BTreeMap<String, String> = std::env::vars().collect();
    let params = TestParams::from_map(&raw).context("invalid test parameters")?;

    tracing::info!(
        bw_mbit = params.bottleneck_mbit,
        rtt_ms = params.rtt_ms,
        buf_packets = params.buffer_packets,
        flows = params.flow_count(),
        qdisc = %params.qdisc,
        "pathem starting"
    );

    match cli.command {
        Cmd::Derive { apply } => derive(&params, apply),
        Cmd::Sample => sample(&params).await?,
        Cmd::Analyze { json } => analyze(&params, json)?,
        Cmd::Run => {
            derive(&params, true);
            sample(&params).await?;
            analyze(&params, false)?;
        }
    }
    Ok(())
}

fn derive(params: &TestParams, apply_them: bool) {
    let config = ShapingConfig::derive(params);
    let directives = config.directives();
    for directive in &directives {
        println!("{}", directive.render());
    }
    if apply_them {
        // Failures here are deliberately non-fatal; see apply.rs.
        let failures = apply::apply(&apply::NetnsRunner, &directives);
        if failures > 0 {
            tracing::warn!(failures, "some shaping directives failed; continuing");
        }
    }
}

async fn sample(params: &TestParams) -> anyhow::Result<()> {
    fs::create_dir_all(&params.outdir)
        .with_context(|| format!("creating output directory {}", params.outdir.display()))?;
    let log_path = params.outdir.join("ss.log");
    let mut source = sampler::SsSampleSource::new(params.flow_count());

    tracing::info!(
        log = %log_path.display(),
        dur_secs = params.duration_secs,
        filter = source.filter(),
        "sampling socket statistics"
    );
    sampler::run(
        &mut source,
        &log_path,
        Duration::from_secs_f64(params.duration_secs),
    )
    .await
    .context("sampling loop failed")?;
    Ok(())
}

fn analyze(params: &TestParams, json: bool) -> anyhow::Result<()> {
    let log_path = params.outdir.join("ss.log");
    let text = fs::read_to_string(&log_path)
        .with_context(|| format!("reading {}", log_path.display()))?;

    let series = sslog::parse(&text).context("telemetry log is structurally invalid")?;
    let metrics = metrics::compute(&series);
    metrics
        .write_artifacts(&params.outdir)
        .context("writing metric artifacts")?;

    tracing::info!(
        samples = series.len(),
        flows = metrics.per_flow_retrans.len(),
        retrans_pct = metrics.aggregate_retrans * 100.0,
        median_rtt_ms = metrics.median_srtt_ms,
        "analysis complete"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    }
    Ok(())
}
