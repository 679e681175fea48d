//! Parser for the periodic `ss` socket-statistics log.
//!
//! The log interleaves three line classes:
//!
//! - timestamp markers: `# <unix seconds>`
//! - a column-header line right after every marker, always discarded
//! - per-flow pairs: a five-token connection tuple line followed by a
//!   mandatory `key:value` statistics line
//!
//! The parser is an explicit state machine fed one line at a time, so
//! the missing-line failure modes are ordinary, testable transitions.
//! Structural violations abort the whole parse: a malformed sample
//! silently skewing the pooled median is worse than no result.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SsLogError {
    #[error("bad timestamp marker `{0}`")]
    BadTimestamp(String),
    #[error("timestamp {0} is not positive")]
    NonPositiveTimestamp(f64),
    #[error("timestamp {current} does not advance past {previous}")]
    NonMonotonicTimestamp { previous: f64, current: f64 },
    #[error("flow record before the first timestamp marker: `{0}`")]
    RecordBeforeTimestamp(String),
    #[error("unable to find connection tuple in `{0}`")]
    BadFlowTuple(String),
    #[error("missing statistics line for port {0}")]
    MissingStats(u16),
    #[error("bad statistics token `{token}`: {reason}")]
    BadStatsToken { token: String, reason: String },
    #[error("no cwnd in statistics line `{0}`")]
    MissingCwnd(String),
}

/// Statistics for one flow at one sample instant. Counters are
/// cumulative since connection start, as the kernel reports them.
#[derive(Debug, Clone, Serialize)]
pub struct FlowRecord {
    pub port: u16,
    /// Congestion window in packets. Mandatory: a record without it is
    /// a parse failure, never a silent default.
    pub cwnd: u64,
    pub bytes_acked: u64,
    pub retrans: u64,
    pub data_segs_out: u64,
    /// Smoothed RTT in seconds, when the kernel reported one.
    pub srtt_secs: Option<f64>,
    pub unacked: u64,
}

/// One sealed sample: every flow observed under a single marker.
#[derive(Debug, Clone, Serialize)]
pub struct TimePoint {
    pub time_secs: f64,
    pub flows: BTreeMap<u16, FlowRecord>,
}

/// All samples of a run, in the order the markers appeared.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimeSeries {
    pub samples: Vec<TimePoint>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    AwaitTimestamp,
    SkipHeader,
    AwaitFlowOrTimestamp,
    AwaitStats { port: u16 },
}

/// Line-at-a-time parser; call [`Parser::push_line`] for each input
/// line and [`Parser::finish`] at end of input.
#[derive(Debug)]
pub struct Parser {
    state: State,
    current_time: f64,
    current: BTreeMap<u16, FlowRecord>,
    series: TimeSeries,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::AwaitTimestamp,
            current_time: 0.0,
            current: BTreeMap::new(),
            series: TimeSeries::default(),
        }
    }

    pub fn push_line(&mut self, line: &str) -> Result<(), SsLogError> {
        match self.state {
            State::AwaitTimestamp => {
                let Some(raw) = timestamp_marker(line) else {
                    return Err(SsLogError::RecordBeforeTimestamp(line.to_string()));
                };
                self.start_sample(raw)?;
            }
            State::SkipHeader => {
                // Column headers the sampler always emits; content is
                // not validated.
                self.state = State::AwaitFlowOrTimestamp;
            }
            State::AwaitFlowOrTimestamp => {
                if let Some(raw) = timestamp_marker(line) {
                    self.start_sample(raw)?;
                } else {
                    let port = parse_flow_tuple(line)?;
                    self.state = State::AwaitStats { port };
                }
            }
            State::AwaitStats { port } => {
                if timestamp_marker(line).is_some() {
                    return Err(SsLogError::MissingStats(port));
                }
                let record = parse_flow_stats(port, line)?;
                self.current.insert(port, record);
                self.state = State::AwaitFlowOrTimestamp;
            }
        }
        Ok(())
    }

    /// Seal any in-progress sample and return the series. End of input
    /// while a statistics line is still owed is fatal.
    pub fn finish(mut self) -> Result<TimeSeries, SsLogError> {
        if let State::AwaitStats { port } = self.state {
            return Err(SsLogError::MissingStats(port));
        }
        self.seal_sample();
        Ok(self.series)
    }

    fn start_sample(&mut self, raw: &str) -> Result<(), SsLogError> {
        let time_secs: f64 = raw
            .trim()
            .parse()
            .map_err(|_| SsLogError::BadTimestamp(raw.trim().to_string()))?;
        if time_secs <= 0.0 {
            return Err(SsLogError::NonPositiveTimestamp(time_secs));
        }
        if !matches!(self.state, State::AwaitTimestamp) && time_secs <= self.current_time {
            return Err(SsLogError::NonMonotonicTimestamp {
                previous: self.current_time,
                current: time_secs,
            });
        }
        self.seal_sample();
        self.current_time = time_secs;
        self.state = State::SkipHeader;
        Ok(())
    }

    fn seal_sample(&mut self) {
        if self.current.is_empty() {
            // No live sockets matched the sampler filter at this
            // instant; the timestamp is not recorded.
            return;
        }
        self.series.samples.push(TimePoint {
            time_secs: self.current_time,
            flows: std::mem::take(&mut self.current),
        });
    }
}

/// Parse a complete log in one pass.
pub fn parse(input: &str) -> Result<TimeSeries, SsLogError> {
    let mut parser = Parser::new();
    for line in input.lines() {
        parser.push_line(line)?;
    }
    parser.finish()
}

fn timestamp_marker(line: &str) -> Option<&str> {
    line.strip_prefix("# ")
}

/// A connection tuple line is exactly five whitespace-delimited tokens
/// (state, recv-q, send-q, local address, peer address); the flow port
/// is the integer after the last `:`.
fn parse_flow_tuple(line: &str) -> Result<u16, SsLogError> {
    let bad = || SsLogError::BadFlowTuple(line.to_string());
    if line.split_whitespace().count() != 5 {
        return Err(bad());
    }
    let trimmed = line.trim();
    let (_, port) = trimmed.rsplit_once(':').ok_or_else(bad)?;
    port.parse().map_err(|_| bad())
}

fn parse_flow_stats(port: u16, line: &str) -> Result<FlowRecord, SsLogError> {
    let mut cwnd = None;
    let mut bytes_acked = 0;
    let mut retrans = 0;
    let mut data_segs_out = 0;
    let mut srtt_secs = None;
    let mut unacked = 0;

    for token in line.split_whitespace() {
        if token.starts_with("cwnd:") {
            cwnd = Some(int_after_colon(token)?);
        } else if token.starts_with("bytes_acked:") {
            bytes_acked = int_after_colon(token)?;
        } else if token.starts_with("retrans:") {
            // retrans:<in-flight>/<cumulative>; only the cumulative
            // counter matters for rate computation.
            let (_, value) = token.rsplit_once('/').ok_or_else(|| bad_token(token, "no `/`"))?;
            retrans = parse_int(token, value)?;
        } else if token.starts_with("data_segs_out:") {
            data_segs_out = int_after_colon(token)?;
        } else if token.starts_with("rtt:") {
            // rtt:<srtt>/<rttvar> in milliseconds; normalize to seconds.
            let rest = &token["rtt:".len()..];
            let (value, _) = rest.rsplit_once('/').ok_or_else(|| bad_token(token, "no `/`"))?;
            let ms: f64 = value
                .parse()
                .map_err(|_| bad_token(token, "srtt is not a number"))?;
            srtt_secs = Some(ms / 1000.0);
        } else if token.starts_with("unacked:") {
            unacked = int_after_colon(token)?;
        }
    }

    let Some(cwnd) = cwnd else {
        return Err(SsLogError::MissingCwnd(line.trim().to_string()));
    };

    Ok(FlowRecord {
        port,
        cwnd,
        bytes_acked,
        retrans,
        data_segs_out,
        srtt_secs,
        unacked,
    })
}

fn int_after_colon(token: &str) -> Result<u64, SsLogError> {
    let (_, value) = token
        .rsplit_once(':')
        .ok_or_else(|| bad_token(token, "no `:`"))?;
    parse_int(token, value)
}

fn parse_int(token: &str, value: &str) -> Result<u64, SsLogError> {
    value
        .parse()
        .map_err(|_| bad_token(token, "value is not an integer"))
}

fn bad_token(token: &str, reason: &str) -> SsLogError {
    SsLogError::BadStatsToken {
        token: token.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "State Recv-Q Send-Q Local Address:Port Peer Address:Port";

    fn tuple(port: u16) -> String {
        format!("ESTAB 0 36960 [::ffff:192.168.0.1]:53410 [::ffff:192.168.3.100]:{port}")
    }

    fn stats(cwnd: u64, retrans: u64, segs: u64, rtt_ms: f64) -> String {
        format!(
            "\t cubic wscale:7,7 rto:204 rtt:{rtt_ms}/2.25 ato:40 mss:1448 \
             cwnd:{cwnd} bytes_acked:123456 segs_out:500 data_segs_out:{segs} \
             retrans:0/{retrans} unacked:10 minrtt:40"
        )
    }

    #[test]
    fn parses_single_sample_with_two_flows() {
        let log = format!(
            "# 1700000000.1\n{HEADER}\n{}\n{}\n{}\n{}\n",
            tuple(10000),
            stats(100, 12, 480, 40.5),
            tuple(10001),
            stats(80, 0, 300, 38.0),
        );
        let series = parse(&log).unwrap();
        assert_eq!(series.len(), 1);
        let sample = &series.samples[0];
        assert_eq!(sample.time_secs, 1700000000.1);
        assert_eq!(sample.flows.len(), 2);

        let flow = &sample.flows[&10000];
        assert_eq!(flow.cwnd, 100);
        assert_eq!(flow.retrans, 12);
        assert_eq!(flow.data_segs_out, 480);
        assert_eq!(flow.bytes_acked, 123456);
        assert_eq!(flow.unacked, 10);
        assert_eq!(flow.srtt_secs, Some(0.0405));
        assert_eq!(sample.flows[&10001].cwnd, 80);
    }

    #[test]
    fn marker_seals_previous_sample_under_previous_timestamp() {
        let log = format!(
            "# 100.0\n{HEADER}\n{}\n{}\n# 100.1\n{HEADER}\n{}\n{}\n",
            tuple(10000),
            stats(10, 0, 50, 40.0),
            tuple(10000),
            stats(20, 1, 90, 41.0),
        );
        let series = parse(&log).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.samples[0].time_secs, 100.0);
        assert_eq!(series.samples[0].flows[&10000].cwnd, 10);
        assert_eq!(series.samples[1].time_secs, 100.1);
        assert_eq!(series.samples[1].flows[&10000].cwnd, 20);
    }

    #[test]
    fn empty_samples_are_not_recorded() {
        // Markers with no live sockets in between.
        let log = format!(
            "# 100.0\n{HEADER}\n# 100.1\n{HEADER}\n{}\n{}\n",
            tuple(10000),
            stats(10, 0, 50, 40.0),
        );
        let series = parse(&log).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series.samples[0].time_secs, 100.1);
    }

    #[test]
    fn header_line_is_discarded_without_validation() {
        // Even a header that looks like a five-token tuple is skipped.
        let log = format!(
            "# 100.0\nESTAB 0 0 a:1 b:2\n{}\n{}\n",
            tuple(10000),
            stats(10, 0, 50, 40.0),
        );
        assert_eq!(parse(&log).unwrap().len(), 1);
    }

    #[test]
    fn tuple_with_wrong_token_count_is_fatal() {
        let log = format!("# 100.0\n{HEADER}\nESTAB 0 0 only:4\n");
        assert!(matches!(parse(&log), Err(SsLogError::BadFlowTuple(_))));
    }

    #[test]
    fn missing_stats_line_at_eof_is_fatal() {
        let log = format!("# 100.0\n{HEADER}\n{}\n", tuple(10000));
        assert!(matches!(parse(&log), Err(SsLogError::MissingStats(10000))));
    }

    #[test]
    fn marker_in_place_of_stats_line_is_fatal() {
        let log = format!("# 100.0\n{HEADER}\n{}\n# 100.1\n", tuple(10000));
        assert!(matches!(parse(&log), Err(SsLogError::MissingStats(10000))));
    }

    #[test]
    fn stats_without_cwnd_fail_the_whole_run() {
        let log = format!(
            "# 100.0\n{HEADER}\n{}\n\t cubic rtt:40.0/2.0 data_segs_out:100 retrans:0/5\n",
            tuple(10000),
        );
        assert!(matches!(parse(&log), Err(SsLogError::MissingCwnd(_))));
    }

    #[test]
    fn non_positive_timestamp_is_fatal() {
        assert!(matches!(
            parse("# 0.0\n"),
            Err(SsLogError::NonPositiveTimestamp(_))
        ));
        assert!(matches!(
            parse("# -5.0\n"),
            Err(SsLogError::NonPositiveTimestamp(_))
        ));
    }

    #[test]
    fn timestamps_must_strictly_increase() {
        let log = format!(
            "# 100.0\n{HEADER}\n{}\n{}\n# 100.0\n{HEADER}\n",
            tuple(10000),
            stats(10, 0, 50, 40.0),
        );
        assert!(matches!(
            parse(&log),
            Err(SsLogError::NonMonotonicTimestamp { .. })
        ));
    }

    #[test]
    fn data_before_first_marker_is_fatal() {
        assert!(matches!(
            parse("ESTAB 0 0 a:1 b:10000\n"),
            Err(SsLogError::RecordBeforeTimestamp(_))
        ));
    }

    #[test]
    fn unrecognized_tokens_are_ignored() {
        let log = format!(
            "# 100.0\n{HEADER}\n{}\n\t bbr cwnd:50 pacing_rate 1Gbps delivery_rate 500Mbps\n",
            tuple(10000),
        );
        let series = parse(&log).unwrap();
        let flow = &series.samples[0].flows[&10000];
        assert_eq!(flow.cwnd, 50);
        assert_eq!(flow.retrans, 0);
        assert_eq!(flow.srtt_secs, None);
    }
}
