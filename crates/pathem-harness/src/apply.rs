//! Hands derived shaping directives to the external `tc`/`ip` tooling.
//!
//! Application is best-effort: a failed directive is logged and the run
//! continues. Cleanup and re-application of qdiscs race against each
//! other across runs, and a partial failure here is usually a stale
//! qdisc being deleted twice rather than a broken configuration.

use std::io;
use std::process::{Command, Output};

use pathem_core::shaping::Directive;

/// Executes one directive. Split out so tests can run the application
/// loop without touching the system.
pub trait DirectiveRunner {
    fn run(&self, directive: &Directive) -> io::Result<Output>;
}

/// Runs directives through `sudo`, entering the target namespace with
/// `ip netns exec` where the directive names one.
pub struct NetnsRunner;

impl DirectiveRunner for NetnsRunner {
    fn run(&self, directive: &Directive) -> io::Result<Output> {
        let mut cmd = Command::new("sudo");
        if let Some(ns) = directive.node.netns() {
            cmd.args(["ip", "netns", "exec", ns, directive.program]);
        } else {
            cmd.arg(directive.program);
        }
        cmd.args(&directive.args);
        cmd.output()
    }
}

/// Apply all directives in order; returns the number that failed.
pub fn apply(runner: &dyn DirectiveRunner, directives: &[Directive]) -> usize {
    let mut failures = 0;
    for directive in directives {
        match runner.run(directive) {
            Ok(output) if output.status.success() => {
                tracing::debug!(cmd = %directive.render(), "shaping directive applied");
            }
            Ok(output) => {
                if !directive.cleanup {
                    failures += 1;
                    tracing::error!(
                        cmd = %directive.render(),
                        status = ?output.status.code(),
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "shaping directive failed"
                    );
                }
            }
            Err(e) => {
                if !directive.cleanup {
                    failures += 1;
                    tracing::error!(
                        cmd = %directive.render(),
                        error = %e,
                        "could not execute shaping directive"
                    );
                }
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathem_core::params::TestParams;
    use pathem_core::shaping::ShapingConfig;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct FailingRunner {
        seen: Mutex<Vec<String>>,
    }

    impl DirectiveRunner for FailingRunner {
        fn run(&self, directive: &Directive) -> io::Result<Output> {
            self.seen.lock().unwrap().push(directive.render());
            Ok(Output {
                status: std::process::ExitStatus::from_raw(2 << 8),
                stdout: Vec::new(),
                stderr: b"RTNETLINK answers: File exists".to_vec(),
            })
        }
    }

    #[test]
    fn failures_are_non_fatal_and_all_directives_still_run() {
        let params = TestParams {
            bottleneck_mbit: 10.0,
            rtt_ms: 40.0,
            buffer_packets: 100,
            loss_percent: 0.0,
            policer_mbit: 5.0,
            cc_algorithms: vec!["bbr".into()],
            start_interval_secs: 0.0,
            duration_secs: 10.0,
            outdir: PathBuf::from("/tmp/pathem"),
            qdisc: "fq_codel".into(),
            snaplen_bytes: 0,
        };
        let directives = ShapingConfig::derive(&params).directives();
        let runner = FailingRunner {
            seen: Mutex::new(Vec::new()),
        };

        let failures = apply(&runner, &directives);

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen.len(), directives.len());
        // Cleanup directives fail silently; the rest are counted.
        let cleanups = directives.iter().filter(|d| d.cleanup).count();
        assert_eq!(failures, directives.len() - cleanups);
    }
}
