//! Path shaping derivation for the five-node bottleneck topology.
//!
//! The emulated chain is `srv — srt — mid — crt — cli`: server, server
//! router, middle (policer) host, client router (netem delay/rate/loss),
//! and client. This module turns validated [`TestParams`] into the
//! ordered `tc`/`ip` directives that shape both directions of the
//! bottleneck link. Executing the directives is the harness's job;
//! nothing here touches the system.

use crate::params::TestParams;

/// Wire MTU used to convert the bandwidth-delay product into packets.
pub const MTU_BYTES: f64 = 1500.0;

/// Effectively-unbounded netem limit used when buffering responsibility
/// moves to a downstream qdisc. netem must never drop before the user's
/// discipline does.
pub const UNBOUNDED_LIMIT_PACKETS: u64 = 2_000_000_000;

/// Reverse (ACK) direction rate in Mbit/s. Fixed, not derived from the
/// test parameters.
pub const REVERSE_RATE_MBIT: f64 = 1000.0;

/// Reverse (ACK) direction buffer in packets. Fixed, as above.
pub const REVERSE_BUFFER_PACKETS: u64 = 1000;

/// Sender-side address the policer matches on. The policer is per-link,
/// not per-flow, so it keys on the source host rather than a port.
pub const SENDER_ADDR: &str = "192.168.0.1/32";

/// Receiver address flows connect to; also used by the sampler filter.
pub const RECEIVER_IP: &str = "192.168.3.100";

const FORWARD_DEV: &str = "crt.r";
const REVERSE_DEV: &str = "crt.l";
const POLICER_DEV: &str = "mid.l";
const DOWNSTREAM_DEV: &str = "cli.l";
const IFB_DEV: &str = "cli.ifb0";

/// Where a directive executes: a namespace of the emulated chain, or
/// the host itself (module loading).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Host,
    Server,
    ServerRouter,
    Middle,
    ClientRouter,
    Client,
}

impl Node {
    /// Network namespace name, or `None` for the host.
    pub fn netns(&self) -> Option<&'static str> {
        match self {
            Node::Host => None,
            Node::Server => Some("srv"),
            Node::ServerRouter => Some("srt"),
            Node::Middle => Some("mid"),
            Node::ClientRouter => Some("crt"),
            Node::Client => Some("cli"),
        }
    }
}

/// One externally-executed shaping command.
#[derive(Debug, Clone)]
pub struct Directive {
    pub node: Node,
    pub program: &'static str,
    pub args: Vec<String>,
    /// Best-effort cleanup commands are expected to fail on a fresh
    /// system; failures of these are not even worth a log line.
    pub cleanup: bool,
}

impl Directive {
    fn new(node: Node, program: &'static str, args: Vec<String>) -> Self {
        Self {
            node,
            program,
            args,
            cleanup: false,
        }
    }

    fn cleanup(node: Node, program: &'static str, args: Vec<String>) -> Self {
        Self {
            node,
            program,
            args,
            cleanup: true,
        }
    }

    /// Rendering for logs and `pathem derive` output.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(ns) = self.node.netns() {
            out.push_str("ip netns exec ");
            out.push_str(ns);
            out.push(' ');
        }
        out.push_str(self.program);
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// netem parameters for one direction of the bottleneck link.
#[derive(Debug, Clone)]
pub struct NetemClause {
    pub device: &'static str,
    pub delay_ms: f64,
    pub loss_percent: f64,
    pub limit_packets: u64,
    /// `None` when rate limiting moved to the downstream HTB chain.
    pub rate_mbit: Option<f64>,
}

/// Hard-drop rate cap applied at the middle node's ingress.
#[derive(Debug, Clone)]
pub struct PolicerClause {
    pub rate_mbit: f64,
    pub match_src: &'static str,
}

/// HTB rate limiter plus user qdisc on redirected receiver ingress.
#[derive(Debug, Clone)]
pub struct DownstreamChain {
    pub rate_mbit: f64,
    pub qdisc: String,
}

/// Complete shaping configuration for one run. Created once from the
/// validated parameters and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ShapingConfig {
    pub forward: NetemClause,
    pub reverse: NetemClause,
    pub policer: Option<PolicerClause>,
    pub downstream: Option<DownstreamChain>,
}

/// netem queue limit in packets: the packets legitimately in flight
/// across the emulated pipe (one BDP) plus the requested buffer depth.
pub fn netem_limit(rate_mbit: f64, delay_ms: f64, buf_packets: u64) -> u64 {
    let bdp_bits = rate_mbit * 1_000_000.0 * (delay_ms / 1000.0);
    let bdp_bytes = bdp_bits / 8.0;
    let bdp_packets = (bdp_bytes / MTU_BYTES) as u64;
    bdp_packets + buf_packets
}

impl ShapingConfig {
    /// Derive the shaping configuration from validated parameters.
    pub fn derive(params: &TestParams) -> Self {
        let one_way_delay_ms = params.rtt_ms / 2.0;
        let fifo = params.qdisc.is_empty();

        // With a plain FIFO bottleneck, netem does the rate limiting
        // and buffering itself (it is more accurate than HTB). With a
        // user qdisc, both responsibilities move downstream and netem
        // must never drop first.
        let forward = NetemClause {
            device: FORWARD_DEV,
            delay_ms: one_way_delay_ms,
            loss_percent: params.loss_percent,
            limit_packets: if fifo {
                netem_limit(params.bottleneck_mbit, one_way_delay_ms, params.buffer_packets)
            } else {
                UNBOUNDED_LIMIT_PACKETS
            },
            rate_mbit: fifo.then_some(params.bottleneck_mbit),
        };

        let reverse = NetemClause {
            device: REVERSE_DEV,
            delay_ms: one_way_delay_ms,
            loss_percent: 0.0,
            limit_packets: netem_limit(REVERSE_RATE_MBIT, one_way_delay_ms, REVERSE_BUFFER_PACKETS),
            rate_mbit: Some(REVERSE_RATE_MBIT),
        };

        let policer = (params.policer_mbit > 0.0).then(|| PolicerClause {
            rate_mbit: params.policer_mbit,
            match_src: SENDER_ADDR,
        });

        let downstream = (!fifo).then(|| DownstreamChain {
            rate_mbit: params.bottleneck_mbit,
            qdisc: params.qdisc.clone(),
        });

        Self {
            forward,
            reverse,
            policer,
            downstream,
        }
    }

    /// Ordered directives for the whole link: policer first, then the
    /// per-direction netem qdiscs, then the downstream HTB chain.
    pub fn directives(&self) -> Vec<Directive> {
        let mut out = Vec::new();

        if let Some(policer) = &self.policer {
            policer_directives(policer, &mut out);
        }

        out.push(netem_directive(Node::ClientRouter, &self.forward));
        out.push(netem_directive(Node::ClientRouter, &self.reverse));

        if let Some(chain) = &self.downstream {
            downstream_directives(chain, &mut out);
        }

        out
    }
}

fn netem_directive(node: Node, clause: &NetemClause) -> Directive {
    let mut args: Vec<String> = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        clause.device.into(),
        "root".into(),
        "netem".into(),
        "limit".into(),
        clause.limit_packets.to_string(),
        "delay".into(),
        format!("{}ms", clause.delay_ms),
        "loss".into(),
        "random".into(),
        format!("{}%", clause.loss_percent),
    ];
    if let Some(rate) = clause.rate_mbit {
        args.push("rate".into());
        args.push(format!("{rate}Mbit"));
    }
    Directive::new(node, "tc", args)
}

fn policer_directives(policer: &PolicerClause, out: &mut Vec<Directive>) {
    out.push(Directive::new(
        Node::Middle,
        "tc",
        vec![
            "qdisc".into(),
            "add".into(),
            "dev".into(),
            POLICER_DEV.into(),
            "ingress".into(),
        ],
    ));
    out.push(Directive::new(
        Node::Middle,
        "tc",
        vec![
            "filter".into(),
            "add".into(),
            "dev".into(),
            POLICER_DEV.into(),
            "parent".into(),
            "ffff:".into(),
            "protocol".into(),
            "ip".into(),
            "prio".into(),
            "10".into(),
            "u32".into(),
            "match".into(),
            "ip".into(),
            "src".into(),
            policer.match_src.into(),
            "flowid".into(),
            "1:2".into(),
            "action".into(),
            "police".into(),
            "rate".into(),
            format!("{}Mbit", policer.rate_mbit),
            "burst".into(),
            "100k".into(),
            "drop".into(),
        ],
    ));
}

fn downstream_directives(chain: &DownstreamChain, out: &mut Vec<Directive>) {
    // IFB and mirred modules must be present before the redirect.
    out.push(Directive::cleanup(Node::Host, "rmmod", vec!["ifb".into()]));
    out.push(Directive::new(
        Node::Host,
        "modprobe",
        vec!["ifb".into(), "numifbs=10".into()],
    ));
    out.push(Directive::new(
        Node::Host,
        "modprobe",
        vec!["act_mirred".into()],
    ));

    // Clear stale qdiscs from earlier runs.
    for dev in [DOWNSTREAM_DEV, IFB_DEV] {
        for kind in ["root", "ingress"] {
            out.push(Directive::cleanup(
                Node::Client,
                "tc",
                vec![
                    "qdisc".into(),
                    "del".into(),
                    "dev".into(),
                    dev.into(),
                    kind.into(),
                ],
            ));
        }
    }

    // Redirect all receiver-side ingress to the IFB device.
    out.push(Directive::new(
        Node::Client,
        "tc",
        vec![
            "qdisc".into(),
            "add".into(),
            "dev".into(),
            DOWNSTREAM_DEV.into(),
            "handle".into(),
            "ffff:".into(),
            "ingress".into(),
        ],
    ));
    out.push(Directive::new(
        Node::Client,
        "ip",
        vec![
            "link".into(),
            "add".into(),
            IFB_DEV.into(),
            "type".into(),
            "ifb".into(),
        ],
    ));
    out.push(Directive::new(
        Node::Client,
        "ip",
        vec![
            "link".into(),
            "set".into(),
            "dev".into(),
            IFB_DEV.into(),
            "up".into(),
        ],
    ));
    out.push(Directive::new(
        Node::Client,
        "ip",
        vec![
            "link".into(),
            "set".into(),
            "dev".into(),
            IFB_DEV.into(),
            "txqueuelen".into(),
            "128000".into(),
        ],
    ));
    out.push(Directive::new(
        Node::Client,
        "tc",
        vec![
            "filter".into(),
            "add".into(),
            "dev".into(),
            DOWNSTREAM_DEV.into(),
            "parent".into(),
            "ffff:".into(),
            "protocol".into(),
            "all".into(),
            "u32".into(),
            "match".into(),
            "u32".into(),
            "0".into(),
            "0".into(),
            "action".into(),
            "mirred".into(),
            "egress".into(),
            "redirect".into(),
            "dev".into(),
            IFB_DEV.into(),
        ],
    ));

    // HTB root enforces the bottleneck rate; the user's qdisc queues
    // beneath it.
    out.push(Directive::new(
        Node::Client,
        "tc",
        vec![
            "qdisc".into(),
            "add".into(),
            "dev".into(),
            IFB_DEV.into(),
            "root".into(),
            "handle".into(),
            "1:".into(),
            "htb".into(),
            "default".into(),
            "11".into(),
        ],
    ));
    out.push(Directive::new(
        Node::Client,
        "tc",
        vec![
            "class".into(),
            "add".into(),
            "dev".into(),
            IFB_DEV.into(),
            "parent".into(),
            "1:".into(),
            "classid".into(),
            "1:11".into(),
            "htb".into(),
            "rate".into(),
            format!("{}Mbit", chain.rate_mbit),
            "ceil".into(),
            format!("{}Mbit", chain.rate_mbit),
        ],
    ));

    let mut qdisc_args: Vec<String> = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        IFB_DEV.into(),
        "parent".into(),
        "1:11".into(),
        "handle".into(),
        "20:".into(),
    ];
    qdisc_args.extend(chain.qdisc.split_whitespace().map(String::from));
    out.push(Directive::new(Node::Client, "tc", qdisc_args));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn params(qdisc: &str, policer: f64) -> TestParams {
        TestParams {
            bottleneck_mbit: 100.0,
            rtt_ms: 40.0,
            buffer_packets: 250,
            loss_percent: 1.0,
            policer_mbit: policer,
            cc_algorithms: vec!["bbr".into()],
            start_interval_secs: 0.0,
            duration_secs: 30.0,
            outdir: PathBuf::from("/tmp/pathem"),
            qdisc: qdisc.into(),
            snaplen_bytes: 0,
        }
    }

    #[test]
    fn limit_holds_bdp_plus_buffer() {
        // 100 Mbit * 20 ms = 250_000 bytes = 166 full-size packets.
        assert_eq!(netem_limit(100.0, 20.0, 0), 166);
        assert_eq!(netem_limit(100.0, 20.0, 250), 416);
    }

    #[test]
    fn limit_is_monotone_in_each_input() {
        let rates = [1.0, 10.0, 100.0, 1000.0];
        let delays = [1.0, 5.0, 25.0, 100.0];
        let bufs = [0u64, 10, 100, 1000];
        for w in rates.windows(2) {
            for &d in &delays {
                for &b in &bufs {
                    assert!(netem_limit(w[0], d, b) <= netem_limit(w[1], d, b));
                }
            }
        }
        for &r in &rates {
            for w in delays.windows(2) {
                for &b in &bufs {
                    assert!(netem_limit(r, w[0], b) <= netem_limit(r, w[1], b));
                }
            }
        }
        for &r in &rates {
            for &d in &delays {
                for w in bufs.windows(2) {
                    assert!(netem_limit(r, d, w[0]) <= netem_limit(r, d, w[1]));
                }
            }
        }
    }

    #[test]
    fn fifo_run_keeps_rate_and_finite_limit_in_netem() {
        let cfg = ShapingConfig::derive(&params("", 0.0));
        assert_eq!(cfg.forward.rate_mbit, Some(100.0));
        assert_eq!(cfg.forward.limit_packets, netem_limit(100.0, 20.0, 250));
        assert_eq!(cfg.forward.delay_ms, 20.0);
        assert!(cfg.downstream.is_none());
        assert!(cfg.policer.is_none());
    }

    #[test]
    fn reverse_direction_uses_fixed_ack_path_constants() {
        let cfg = ShapingConfig::derive(&params("", 0.0));
        assert_eq!(cfg.reverse.rate_mbit, Some(REVERSE_RATE_MBIT));
        assert_eq!(cfg.reverse.loss_percent, 0.0);
        assert_eq!(
            cfg.reverse.limit_packets,
            netem_limit(REVERSE_RATE_MBIT, 20.0, REVERSE_BUFFER_PACKETS)
        );
    }

    #[test]
    fn user_qdisc_moves_buffering_downstream() {
        let cfg = ShapingConfig::derive(&params("codel limit 1000", 0.0));
        assert_eq!(cfg.forward.limit_packets, UNBOUNDED_LIMIT_PACKETS);
        assert_eq!(cfg.forward.rate_mbit, None);
        let chain = cfg.downstream.as_ref().unwrap();
        assert_eq!(chain.rate_mbit, 100.0);

        let rendered: Vec<String> =
            cfg.directives().iter().map(Directive::render).collect();
        assert!(rendered
            .iter()
            .any(|d| d.contains("mirred egress redirect dev cli.ifb0")));
        assert!(rendered
            .iter()
            .any(|d| d.contains("htb rate 100Mbit ceil 100Mbit")));
        assert!(rendered
            .iter()
            .any(|d| d.ends_with("handle 20: codel limit 1000")));
    }

    #[test]
    fn policer_clause_matches_sender_address() {
        let cfg = ShapingConfig::derive(&params("", 20.0));
        let policer = cfg.policer.as_ref().unwrap();
        assert_eq!(policer.rate_mbit, 20.0);

        let rendered: Vec<String> =
            cfg.directives().iter().map(Directive::render).collect();
        let police = rendered
            .iter()
            .find(|d| d.contains("action police"))
            .unwrap();
        assert!(police.contains("match ip src 192.168.0.1/32"));
        assert!(police.contains("rate 20Mbit burst 100k drop"));
        assert!(police.starts_with("ip netns exec mid "));
    }

    #[test]
    fn netem_directives_target_the_client_router() {
        let cfg = ShapingConfig::derive(&params("", 0.0));
        let rendered: Vec<String> =
            cfg.directives().iter().map(Directive::render).collect();
        assert_eq!(rendered.len(), 2);
        assert!(rendered[0].starts_with("ip netns exec crt tc qdisc add dev crt.r root netem"));
        assert!(rendered[0].contains("delay 20ms"));
        assert!(rendered[0].contains("loss random 1%"));
        assert!(rendered[0].ends_with("rate 100Mbit"));
        assert!(rendered[1].starts_with("ip netns exec crt tc qdisc add dev crt.l root netem"));
    }
}
