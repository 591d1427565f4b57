// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::File;
use std::io::BufRead;
use std::str::FromStr;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::warn;
use serde::Serialize;

use tcp_pert::build_congestion_controller;
use tcp_pert::Config;
use tcp_pert::CongestionController;
use tcp_pert::CongestionState;
use tcp_pert::CongestionStats;
use tcp_pert::PertStatus;
use tcp_pert::TcpState;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Log target. If no file is specified, logs will be written to `stderr`.
pub fn log_target(log_file: &Option<String>) -> Result<env_logger::Target> {
    match log_file {
        Some(path) => {
            let file = File::create(path)?;
            Ok(env_logger::Target::Pipe(Box::new(file)))
        }
        None => Ok(env_logger::Target::Stderr),
    }
}

/// Event of a replay trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraceEvent {
    /// An ack carrying an RTT sample.
    Ack { rtt: Duration, segments: u32 },

    /// Drop or mark events observed by the sender.
    Mark { count: u64 },

    /// Explicit marking probability supplied by the network.
    Ecn { prob: f64 },

    /// Congestion state transition of the sender.
    State(CongestionState),
}

/// A timestamped trace event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceRecord {
    /// Offset from the start of the trace.
    pub time: Duration,

    pub event: TraceEvent,
}

fn parse_millis(s: &str, what: &str) -> Result<Duration> {
    let v = f64::from_str(s).map_err(|e| format!("invalid {} {:?}: {}", what, s, e))?;
    let d = Duration::try_from_secs_f64(v / 1000.0)
        .map_err(|e| format!("invalid {} {:?}: {}", what, s, e))?;
    Ok(d)
}

fn expect_arg<'a>(args: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<&'a str> {
    args.next().ok_or_else(|| format!("missing {}", what).into())
}

impl TraceRecord {
    /// Parse one trace line: `<time_ms> <event> [args]`.
    ///
    /// Blank lines and lines starting with `#` are skipped and yield None.
    pub fn parse(line: &str) -> Result<Option<TraceRecord>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut fields = line.split_whitespace();
        let time = parse_millis(expect_arg(&mut fields, "time")?, "time")?;
        let name = expect_arg(&mut fields, "event")?;

        let event = match name {
            "ack" => {
                let rtt = parse_millis(expect_arg(&mut fields, "rtt")?, "rtt")?;
                let segments = match fields.next() {
                    Some(s) => u32::from_str(s).map_err(|e| format!("invalid segments {:?}: {}", s, e))?,
                    None => 1,
                };
                TraceEvent::Ack { rtt, segments }
            }
            "mark" => {
                let s = expect_arg(&mut fields, "count")?;
                let count = u64::from_str(s).map_err(|e| format!("invalid count {:?}: {}", s, e))?;
                TraceEvent::Mark { count }
            }
            "ecn" => {
                let s = expect_arg(&mut fields, "probability")?;
                let prob = f64::from_str(s).map_err(|e| format!("invalid probability {:?}: {}", s, e))?;
                TraceEvent::Ecn { prob }
            }
            "state" => {
                let s = expect_arg(&mut fields, "state")?;
                TraceEvent::State(CongestionState::from_str(s)?)
            }
            _ => return Err(format!("unknown event {:?}", name).into()),
        };

        if let Some(extra) = fields.next() {
            return Err(format!("unexpected argument {:?}", extra).into());
        }

        Ok(Some(TraceRecord { time, event }))
    }
}

/// Read a whole trace. Records must not go back in time.
pub fn parse_trace<R: BufRead>(reader: R) -> Result<Vec<TraceRecord>> {
    let mut records: Vec<TraceRecord> = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let record = match TraceRecord::parse(&line) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => return Err(format!("line {}: {}", i + 1, e).into()),
        };

        if let Some(last) = records.last() {
            if record.time < last.time {
                return Err(format!("line {}: time goes backwards", i + 1).into());
            }
        }
        records.push(record);
    }

    Ok(records)
}

/// Host side view after one replayed event.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutput {
    pub time_ms: f64,
    pub event: String,
    pub state: &'static str,
    pub cwnd: u64,
    pub ssthresh: u64,
    pub pert: Option<PertStatus>,
}

impl ReplayOutput {
    /// One line summary for text output.
    pub fn to_text(&self) -> String {
        let mut line = format!(
            "{:>10.3} {:<16} {:<8} cwnd={} ssthresh={}",
            self.time_ms, self.event, self.state, self.cwnd, self.ssthresh
        );

        if let Some(s) = &self.pert {
            line.push_str(&format!(
                " alpha={:.3} beta={:.5} mode={} drop_prob={:.5}",
                s.alpha, s.beta, s.mode, s.drop_prob
            ));
        }
        line
    }
}

/// A minimal TCP sender driving a congestion controller from a trace.
///
/// The sender is always window limited, so the bytes in flight follow the
/// congestion window.
pub struct TraceReplayer {
    cc: Box<dyn CongestionController>,
    tcb: TcpState,
    state: CongestionState,
    start: Instant,
}

impl TraceReplayer {
    pub fn new(conf: &Config) -> Self {
        let mut tcb = conf.initial_tcp_state();
        tcb.bytes_in_flight = tcb.cwnd;

        Self {
            cc: build_congestion_controller(conf),
            tcb,
            state: CongestionState::Open,
            start: Instant::now(),
        }
    }

    /// Apply one trace record to the controller and the host state.
    pub fn replay(&mut self, record: &TraceRecord) -> Result<ReplayOutput> {
        let now = self.start + record.time;

        let event = match record.event {
            TraceEvent::Ack { rtt, segments } => {
                self.cc.on_ack(now, segments, rtt);
                if self.state == CongestionState::Open {
                    self.tcb.cwnd = self.cc.increase_window(now, self.tcb, segments);
                    self.tcb.bytes_in_flight = self.tcb.cwnd;
                }
                format!("ack {}us", rtt.as_micros())
            }
            TraceEvent::Mark { count } => {
                self.cc.on_congestion_signal(count);
                format!("mark {}", count)
            }
            TraceEvent::Ecn { prob } => {
                self.cc.set_explicit_mark_prob(prob)?;
                format!("ecn {}", prob)
            }
            TraceEvent::State(new_state) => {
                self.on_state(now, new_state);
                let name: &'static str = new_state.into();
                format!("state {}", name)
            }
        };

        Ok(ReplayOutput {
            time_ms: record.time.as_secs_f64() * 1000.0,
            event,
            state: self.state.into(),
            cwnd: self.tcb.cwnd,
            ssthresh: self.tcb.ssthresh,
            pert: self.cc.estimator_status(),
        })
    }

    fn on_state(&mut self, now: Instant, new_state: CongestionState) {
        let entering = new_state.is_loss_recovery() && !self.state.is_loss_recovery();

        // A degenerate drop history keeps the previous estimate, the replay
        // goes on.
        if let Err(e) = self.cc.on_congestion_state(now, new_state) {
            warn!("{:?} congestion state {:?}: {}", self.cc, new_state, e);
        }
        self.state = new_state;

        if !entering {
            return;
        }

        let ssthresh = self.cc.ssthresh(self.tcb, self.tcb.bytes_in_flight);
        let cwnd = match new_state {
            CongestionState::Recovery => self.tcb.cwnd.min(ssthresh),
            _ => self.tcb.segment_size,
        };
        debug!(
            "{:?} reduce cwnd {} -> {}, ssthresh {} -> {}",
            self.cc, self.tcb.cwnd, cwnd, self.tcb.ssthresh, ssthresh
        );

        self.tcb.ssthresh = ssthresh;
        self.tcb.cwnd = cwnd;
        self.tcb.bytes_in_flight = cwnd;
    }

    pub fn tcp_state(&self) -> TcpState {
        self.tcb
    }

    pub fn name(&self) -> &str {
        self.cc.name()
    }

    pub fn stats(&self) -> &CongestionStats {
        self.cc.stats()
    }
}
