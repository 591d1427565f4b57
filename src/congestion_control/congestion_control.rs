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

#![allow(unused_variables)]

use core::str::FromStr;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use strum_macros::EnumIter;
use strum_macros::IntoStaticStr;

use crate::Config;
use crate::Error;
use crate::Result;
pub use drop_history::DropHistory;
pub use drop_history::DROP_HISTORY_LEN;
pub use new_reno::NewReno;
pub use new_reno::NewRenoConfig;
pub use pert_red::Mode;
pub use pert_red::PertRed;
pub use pert_red::PertRedConfig;
pub use pert_red::PertStatus;
pub use pert_red::DEFAULT_ALPHA_MAX;
pub use pert_red::DEFAULT_THRESH1;
pub use pert_red::DEFAULT_THRESH2;
pub use pert_red::DEFAULT_THRESH3;
pub use pert_red::DEFAULT_WEIGHTS;
pub(crate) use pert_red::validate_alpha_max;
pub(crate) use pert_red::validate_thresholds;
pub(crate) use pert_red::validate_weights;

/// Available congestion control algorithm
#[repr(C)]
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CongestionControlAlgorithm {
    /// NewReno halves the window on a congestion event and grows it by one
    /// segment per round trip in congestion avoidance.
    NewReno,

    /// PERT/RED estimates the queueing delay from RTT samples and reacts to
    /// it early, emulating RED at the end host. It also keeps a weighted
    /// history of drop events to estimate the drop probability, and adapts
    /// an aggressiveness parameter according to the current delay region.
    #[default]
    PertRed,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("newreno") || algor.eq_ignore_ascii_case("reno") {
            Ok(CongestionControlAlgorithm::NewReno)
        } else if algor.eq_ignore_ascii_case("pert")
            || algor.eq_ignore_ascii_case("pertred")
            || algor.eq_ignore_ascii_case("pert-red")
        {
            Ok(CongestionControlAlgorithm::PertRed)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Congestion state of the host TCP sender.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default, EnumIter, IntoStaticStr)]
pub enum CongestionState {
    /// Normal state, no dubious events.
    #[default]
    Open,

    /// Dubious events seen (duplicate acks, SACK).
    Disorder,

    /// The window was reduced because of an explicit congestion signal.
    Cwr,

    /// Fast recovery after a loss was detected.
    Recovery,

    /// Retransmission timeout fired.
    Loss,
}

impl CongestionState {
    /// Whether the sender is recovering from a loss.
    pub fn is_loss_recovery(&self) -> bool {
        matches!(self, CongestionState::Recovery | CongestionState::Loss)
    }
}

impl FromStr for CongestionState {
    type Err = Error;

    fn from_str(state: &str) -> Result<CongestionState> {
        if state.eq_ignore_ascii_case("open") {
            Ok(CongestionState::Open)
        } else if state.eq_ignore_ascii_case("disorder") {
            Ok(CongestionState::Disorder)
        } else if state.eq_ignore_ascii_case("cwr") {
            Ok(CongestionState::Cwr)
        } else if state.eq_ignore_ascii_case("recovery") {
            Ok(CongestionState::Recovery)
        } else if state.eq_ignore_ascii_case("loss") {
            Ok(CongestionState::Loss)
        } else {
            Err(Error::InvalidOperation(format!("unknown state {}", state)))
        }
    }
}

/// Snapshot of the host window variables.
///
/// Controllers only read it. A new window is handed back to the host as a
/// return value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpState {
    /// Congestion window in bytes.
    pub cwnd: u64,

    /// Slow start threshold in bytes.
    pub ssthresh: u64,

    /// Segment size in bytes.
    pub segment_size: u64,

    /// Bytes in flight.
    pub bytes_in_flight: u64,
}

impl TcpState {
    /// Congestion window in segments.
    pub fn cwnd_in_segments(&self) -> u64 {
        if self.segment_size == 0 {
            return self.cwnd;
        }
        self.cwnd / self.segment_size
    }
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// Total segments acked.
    pub acked_segments: u64,

    /// Valid RTT samples processed.
    pub rtt_samples: u64,

    /// RTT samples ignored because they were zero.
    pub ignored_rtt_samples: u64,

    /// Entries into recovery or loss.
    pub congestion_events: u64,

    /// Times alpha was recomputed.
    pub alpha_updates: u64,
}

/// Congestion control interfaces shared by different algorithms.
pub trait CongestionController {
    /// Name of congestion control algorithm.
    fn name(&self) -> &str;

    /// Callback for each ack carrying an RTT sample.
    fn on_ack(&mut self, now: Instant, segments_acked: u32, rtt: Duration) {}

    /// Callback when the host changes its congestion state.
    fn on_congestion_state(&mut self, now: Instant, new_state: CongestionState) -> Result<()> {
        Ok(())
    }

    /// Drop or mark events observed by the host since the last call.
    fn on_congestion_signal(&mut self, events: u64) {}

    /// Explicit marking probability supplied by the network.
    fn set_explicit_mark_prob(&mut self, prob: f64) -> Result<()> {
        Ok(())
    }

    /// Slow start threshold to use after a congestion event.
    fn ssthresh(&self, tcb: TcpState, bytes_in_flight: u64) -> u64;

    /// Grow the congestion window. Return the new congestion window in bytes.
    fn increase_window(&mut self, now: Instant, tcb: TcpState, segments_acked: u32) -> u64;

    /// Delay and drop estimation state. If the algorithm does not keep one,
    /// return None.
    fn estimator_status(&self) -> Option<PertStatus> {
        None
    }

    /// Independent copy for a forked connection.
    fn fork(&self) -> Box<dyn CongestionController>;

    /// Congestion stats.
    fn stats(&self) -> &CongestionStats;
}

impl fmt::Debug for dyn CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller {}.", self.name())
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(conf: &Config) -> Box<dyn CongestionController> {
    match conf.congestion_control_algorithm {
        CongestionControlAlgorithm::NewReno => Box::new(NewReno::new(NewRenoConfig::from(conf))),
        CongestionControlAlgorithm::PertRed => Box::new(PertRed::new(PertRedConfig::from(conf))),
    }
}


mod drop_history;
mod new_reno;
mod pert_red;
