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

use std::time::Duration;
use std::time::Instant;

use log::*;

use super::CongestionController;
use super::CongestionState;
use super::CongestionStats;
use super::TcpState;
use crate::Config;
use crate::Result;

/// NewReno configurable parameters.
#[derive(Debug, Clone)]
pub struct NewRenoConfig {
    /// Minimal congestion window in segments after a congestion event.
    min_cwnd_segments: u64,
}

impl NewRenoConfig {
    pub fn from(conf: &Config) -> Self {
        Self {
            min_cwnd_segments: conf.min_congestion_window.max(1),
        }
    }
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        Self {
            min_cwnd_segments: crate::DEFAULT_MIN_CONGESTION_WINDOW,
        }
    }
}

/// NewReno congestion control algorithm.
///
/// See <https://www.rfc-editor.org/rfc/rfc6582.html> and
/// <https://www.rfc-editor.org/rfc/rfc5681.html#section-3.1>.
#[derive(Debug, Clone)]
pub struct NewReno {
    /// Configuration.
    config: NewRenoConfig,

    /// Current congestion state of the host.
    state: CongestionState,

    /// Congestion statistics.
    stats: CongestionStats,
}

impl NewReno {
    pub fn new(config: NewRenoConfig) -> Self {
        Self {
            config,
            state: CongestionState::Open,
            stats: Default::default(),
        }
    }

    /// Slow start: one segment per acked segment, until ssthresh is reached.
    /// Return the new cwnd and the acked segments not yet consumed.
    fn slow_start(&self, tcb: &TcpState, segments_acked: u32) -> (u64, u32) {
        if segments_acked >= 1 {
            let cwnd = tcb.cwnd.saturating_add(tcb.segment_size);
            trace!(
                "{}. slow start, cwnd {} -> {}, ssthresh {}",
                self.name(),
                tcb.cwnd,
                cwnd,
                tcb.ssthresh
            );
            return (cwnd, segments_acked - 1);
        }

        (tcb.cwnd, 0)
    }

    /// Congestion avoidance: about one segment per round trip.
    fn congestion_avoidance(&self, tcb: &TcpState, segments_acked: u32) -> u64 {
        if segments_acked == 0 || tcb.cwnd == 0 {
            return tcb.cwnd;
        }

        let adder = (tcb.segment_size.saturating_mul(tcb.segment_size) / tcb.cwnd).max(1);
        let cwnd = tcb.cwnd.saturating_add(adder);
        trace!(
            "{}. congestion avoidance, cwnd {} -> {}",
            self.name(),
            tcb.cwnd,
            cwnd
        );

        cwnd
    }

    /// Window growth shared with the algorithms built on top of NewReno.
    pub(super) fn grow(&mut self, tcb: TcpState, segments_acked: u32) -> u64 {
        let mut tcb = tcb;
        let mut segments_acked = segments_acked;

        if tcb.cwnd < tcb.ssthresh {
            (tcb.cwnd, segments_acked) = self.slow_start(&tcb, segments_acked);
        }

        if tcb.cwnd >= tcb.ssthresh && segments_acked > 0 {
            tcb.cwnd = self.congestion_avoidance(&tcb, segments_acked);
        }

        tcb.cwnd
    }
}

impl CongestionController for NewReno {
    fn name(&self) -> &str {
        "NEW_RENO"
    }

    fn on_ack(&mut self, now: Instant, segments_acked: u32, rtt: Duration) {
        self.stats.acked_segments = self
            .stats
            .acked_segments
            .saturating_add(segments_acked as u64);

        if rtt.is_zero() {
            self.stats.ignored_rtt_samples = self.stats.ignored_rtt_samples.saturating_add(1);
        } else {
            self.stats.rtt_samples = self.stats.rtt_samples.saturating_add(1);
        }
    }

    fn on_congestion_state(&mut self, now: Instant, new_state: CongestionState) -> Result<()> {
        if new_state.is_loss_recovery() && !self.state.is_loss_recovery() {
            self.stats.congestion_events = self.stats.congestion_events.saturating_add(1);
        }
        self.state = new_state;

        Ok(())
    }

    fn ssthresh(&self, tcb: TcpState, bytes_in_flight: u64) -> u64 {
        let min_ssthresh = self.config.min_cwnd_segments.saturating_mul(tcb.segment_size);
        (bytes_in_flight / 2).max(min_ssthresh)
    }

    fn increase_window(&mut self, now: Instant, tcb: TcpState, segments_acked: u32) -> u64 {
        self.grow(tcb, segments_acked)
    }

    fn fork(&self) -> Box<dyn CongestionController> {
        Box::new(self.clone())
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}
