//! Core logic for the pathem TCP path-emulation harness.
//!
//! Turns high-level test parameters (bottleneck bandwidth, RTT, buffer
//! depth, loss, policer rate, qdisc) into concrete `tc netem`/HTB
//! shaping directives for a fixed five-node bottleneck topology, and
//! parses the periodic `ss` socket-statistics log taken during a run
//! into per-flow and aggregate metrics.
//!
//! Everything here is pure: applying directives, creating namespaces,
//! and driving traffic generators belong to the harness binary and the
//! external tooling it shells out to.

pub mod metrics;
pub mod params;
pub mod shaping;
pub mod sslog;
