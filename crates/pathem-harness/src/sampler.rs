//! Periodic socket-statistics sampling loop.
//!
//! Every 100 ms the loop appends a `# <unix seconds>` marker and one
//! raw `ss` snapshot to the log file. The snapshot itself comes from a
//! [`SampleSource`], so the loop's timing and file format are testable
//! without a sender namespace; the run sequencing (sampling overlaps
//! traffic, parsing starts only after both finish) lives in `main`.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pathem_core::params::FIRST_PORT;
use pathem_core::shaping::RECEIVER_IP;

/// Wall-clock cadence of the sampling loop.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Produces one raw socket-statistics snapshot, column header included.
pub trait SampleSource {
    fn sample(&mut self) -> io::Result<String>;
}

/// `ss -tinm` inside the sender namespace, filtered to the harness
/// port range and the receiver address.
pub struct SsSampleSource {
    filter: String,
}

impl SsSampleSource {
    pub fn new(flow_count: usize) -> Self {
        let filter = format!(
            "dport >= :{} and dport < :{} and dst {}",
            FIRST_PORT,
            FIRST_PORT as usize + flow_count,
            RECEIVER_IP,
        );
        Self { filter }
    }

    /// The `ss` connection filter expression this source samples with.
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

impl SampleSource for SsSampleSource {
    fn sample(&mut self) -> io::Result<String> {
        let output = Command::new("sudo")
            .args(["ip", "netns", "exec", "srv", "ss", "-tinm", &self.filter])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "ss exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Run the sampling loop until `duration` elapses, truncating and then
/// appending to `log_path`. A failed snapshot is logged and skipped;
/// the marker cadence is held regardless.
pub async fn run(
    source: &mut dyn SampleSource,
    log_path: &Path,
    duration: Duration,
) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)?;

    let started = tokio::time::Instant::now();
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);

    while started.elapsed() < duration {
        interval.tick().await;

        // Marker and snapshot are written together: a marker with no
        // following header line would desynchronize the parser.
        let snapshot = match source.sample() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "socket-statistics snapshot failed");
                continue;
            }
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(io::Error::other)?
            .as_secs_f64();
        writeln!(file, "# {now:.6}")?;
        file.write_all(snapshot.as_bytes())?;
        if !snapshot.ends_with('\n') {
            file.write_all(b"\n")?;
        }
    }
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ss_filter_covers_the_flow_port_range() {
        let source = SsSampleSource::new(3);
        assert_eq!(
            source.filter(),
            "dport >= :10000 and dport < :10003 and dst 192.168.3.100"
        );
    }
}
