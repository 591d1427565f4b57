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

//! TCP-PERT is an implementation of the PERT/RED congestion control
//! algorithm for TCP senders.
//!
//! PERT/RED estimates the queueing delay of a path from RTT samples and
//! derives two control outputs from it:
//!
//! * **ssthresh reduction**: on a congestion event, the sender keeps a
//!   fraction of ssthresh that shrinks as the queue fills up.
//! * **alpha**: an aggressiveness multiplier adapted according to the
//!   current delay region and to the estimated drop probability.
//!
//! The controllers never own the connection. The host passes RTT samples,
//! congestion state transitions and snapshots of its window variables, and
//! reads the control outputs back.
//!
//! ## Get started
//!
//! ```
//! use std::time::Duration;
//! use std::time::Instant;
//!
//! use tcp_pert::build_congestion_controller;
//! use tcp_pert::Config;
//! use tcp_pert::CongestionState;
//!
//! let conf = Config::new();
//! let mut cc = build_congestion_controller(&conf);
//! let mut tcb = conf.initial_tcp_state();
//! let now = Instant::now();
//!
//! cc.on_ack(now, 1, Duration::from_millis(50));
//! tcb.cwnd = cc.increase_window(now, tcb, 1);
//!
//! cc.on_congestion_signal(3);
//! cc.on_congestion_state(now, CongestionState::Recovery)?;
//! tcb.ssthresh = cc.ssthresh(tcb, tcb.bytes_in_flight);
//!
//! let status = cc.estimator_status().unwrap();
//! assert!(status.alpha >= 1.0);
//! # Ok::<(), tcp_pert::error::Error>(())
//! ```

use std::time::Duration;

use crate::congestion_control::validate_alpha_max;
use crate::congestion_control::validate_thresholds;
use crate::congestion_control::validate_weights;

/// Default segment size in bytes.
pub const DEFAULT_SEGMENT_SIZE: u64 = 1460;

/// Default initial congestion window in segments.
/// See RFC 6928.
pub const DEFAULT_INITIAL_CONGESTION_WINDOW: u64 = 10;

/// Default minimal congestion window in segments.
pub const DEFAULT_MIN_CONGESTION_WINDOW: u64 = 2;

/// Result type for congestion control operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Congestion control configurations.
#[derive(Debug, Clone)]
pub struct Config {
    /// The congestion control algorithm used for a connection.
    congestion_control_algorithm: CongestionControlAlgorithm,

    /// Segment size in bytes.
    segment_size: u64,

    /// The initial congestion window in segments.
    initial_congestion_window: u64,

    /// The minimal congestion window in segments.
    min_congestion_window: u64,

    /// The threshold for slow start in segments.
    slow_start_thresh: u64,

    /// PERT queueing delay below which the path is in the high speed region.
    pert_thresh1: Duration,

    /// PERT upper queueing delay of the safe region.
    pert_thresh2: Duration,

    /// PERT initial full queue threshold.
    pert_thresh3: Duration,

    /// PERT upper limit of alpha.
    pert_alpha_max: f64,

    /// PERT recency weights of the drop history, oldest epoch first.
    pert_weights: [f64; DROP_HISTORY_LEN],
}

impl Config {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    ///
    /// ## Examples:
    ///
    /// ```
    /// let mut conf = tcp_pert::Config::new();
    /// conf.set_pert_thresholds(2, 8)?;
    /// conf.set_pert_alpha_max(4.0)?;
    /// # Ok::<(), tcp_pert::error::Error>(())
    /// ```
    pub fn new() -> Self {
        Self {
            congestion_control_algorithm: CongestionControlAlgorithm::PertRed,
            segment_size: DEFAULT_SEGMENT_SIZE,
            initial_congestion_window: DEFAULT_INITIAL_CONGESTION_WINDOW,
            min_congestion_window: DEFAULT_MIN_CONGESTION_WINDOW,
            slow_start_thresh: u64::MAX,
            pert_thresh1: congestion_control::DEFAULT_THRESH1,
            pert_thresh2: congestion_control::DEFAULT_THRESH2,
            pert_thresh3: congestion_control::DEFAULT_THRESH3,
            pert_alpha_max: congestion_control::DEFAULT_ALPHA_MAX,
            pert_weights: congestion_control::DEFAULT_WEIGHTS,
        }
    }

    /// Set congestion control algorithm that the connection would use.
    /// The default value is PertRed.
    pub fn set_congestion_control_algorithm(&mut self, cca: CongestionControlAlgorithm) {
        self.congestion_control_algorithm = cca;
    }

    /// Set the segment size in bytes. Zero is replaced by the default value.
    /// The default value is 1460.
    pub fn set_segment_size(&mut self, v: u64) {
        self.segment_size = if v == 0 { DEFAULT_SEGMENT_SIZE } else { v };
    }

    /// Set the initial congestion window in segments.
    /// The default value is 10.
    pub fn set_initial_congestion_window(&mut self, segments: u64) {
        self.initial_congestion_window = segments;
    }

    /// Set the minimal congestion window in segments.
    /// The default value is 2.
    pub fn set_min_congestion_window(&mut self, segments: u64) {
        self.min_congestion_window = segments;
    }

    /// Set the threshold for slow start in segments.
    /// The default value is the maximum value of u64.
    pub fn set_slow_start_thresh(&mut self, segments: u64) {
        self.slow_start_thresh = segments;
    }

    /// Set the PERT queueing delay thresholds in milliseconds. Below
    /// `thresh1` the path is in the high speed region, `thresh2` bounds the
    /// safe region. `thresh1` should not be above `thresh2`.
    /// The default values are 5 and 10 milliseconds.
    pub fn set_pert_thresholds(&mut self, thresh1: u64, thresh2: u64) -> Result<()> {
        let thresh1 = Duration::from_millis(thresh1);
        let thresh2 = Duration::from_millis(thresh2);
        validate_thresholds(thresh1, thresh2)?;
        self.pert_thresh1 = thresh1;
        self.pert_thresh2 = thresh2;
        Ok(())
    }

    /// Set the PERT initial full queue threshold in milliseconds. It is
    /// replaced by the observed delay spread after the first RTT sample.
    /// The default value is 20 milliseconds.
    pub fn set_pert_thresh3(&mut self, millis: u64) {
        self.pert_thresh3 = Duration::from_millis(millis);
    }

    /// Set the upper limit of PERT alpha. It should not be less than one.
    /// The default value is 8.
    pub fn set_pert_alpha_max(&mut self, v: f64) -> Result<()> {
        validate_alpha_max(v)?;
        self.pert_alpha_max = v;
        Ok(())
    }

    /// Set the recency weights of the PERT drop history, from the oldest
    /// epoch to the newest. Weights should not be negative.
    /// The default value is [0.2, 0.4, 0.6, 0.8, 1, 1, 1, 1].
    pub fn set_pert_weights(&mut self, weights: [f64; DROP_HISTORY_LEN]) -> Result<()> {
        validate_weights(&weights)?;
        self.pert_weights = weights;
        Ok(())
    }

    /// Window variables of a new connection.
    pub fn initial_tcp_state(&self) -> TcpState {
        TcpState {
            cwnd: self
                .initial_congestion_window
                .saturating_mul(self.segment_size),
            ssthresh: self.slow_start_thresh.saturating_mul(self.segment_size),
            segment_size: self.segment_size,
            bytes_in_flight: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}


pub use crate::congestion_control::build_congestion_controller;
pub use crate::congestion_control::CongestionControlAlgorithm;
pub use crate::congestion_control::CongestionController;
pub use crate::congestion_control::CongestionState;
pub use crate::congestion_control::CongestionStats;
pub use crate::congestion_control::Mode;
pub use crate::congestion_control::NewReno;
pub use crate::congestion_control::PertRed;
pub use crate::congestion_control::PertRedConfig;
pub use crate::congestion_control::PertStatus;
pub use crate::congestion_control::TcpState;
pub use crate::congestion_control::DROP_HISTORY_LEN;
pub use crate::error::Error;

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

pub mod error;
