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

//! PERT/RED: Probabilistic Early Response TCP with RED-like drop estimation.
//!
//! PERT reacts to the queueing delay observed through RTT samples instead of
//! waiting for losses. The fraction of ssthresh kept on a congestion event
//! (`beta`) follows the ratio between the current and the maximum observed
//! queueing delay. A weighted history of drop counts gives an estimate of
//! the drop probability, which is used together with an explicit marking
//! probability to adapt the aggressiveness parameter `alpha`.
//!
//! The current queueing delay is classified into three regions:
//!
//! * HighSpeed: the queue is nearly empty, alpha grows fast.
//! * Compete: the queue is at least half full, alpha follows the ratio of
//!   explicit marks to drops.
//! * Safe: in between, alpha decays towards one.
//!
//! Alpha is recomputed at most once every five smoothed RTTs.

#![allow(unused_variables)]

use std::time::Duration;
use std::time::Instant;

use log::*;
use serde::Serialize;
use strum_macros::Display;

use super::CongestionController;
use super::CongestionState;
use super::CongestionStats;
use super::DropHistory;
use super::NewReno;
use super::NewRenoConfig;
use super::TcpState;
use super::DROP_HISTORY_LEN;
use crate::Config;
use crate::Error;
use crate::Result;

/// Default lower delay threshold, below which the path is considered idle.
pub const DEFAULT_THRESH1: Duration = Duration::from_millis(5);

/// Default upper delay threshold of the safe region.
pub const DEFAULT_THRESH2: Duration = Duration::from_millis(10);

/// Default full queue threshold. Replaced by the observed delay spread after
/// the first RTT sample.
pub const DEFAULT_THRESH3: Duration = Duration::from_millis(20);

/// Default upper limit of alpha.
pub const DEFAULT_ALPHA_MAX: f64 = 8.0;

/// Default recency weights, oldest epoch first. They sum to
/// `DROP_PROB_NUMERATOR`, so the drop probability is the inverse of the
/// weighted mean of the history.
pub const DEFAULT_WEIGHTS: [f64; DROP_HISTORY_LEN] = [0.2, 0.4, 0.6, 0.8, 1.0, 1.0, 1.0, 1.0];

/// Initial beta, halving ssthresh until a queueing delay is observed.
const INITIAL_BETA: f64 = 0.5;

/// Weight of the previous value in the smoothed delay.
const SMOOTHING_GAIN: f64 = 0.99;

/// Share of the delay spread considered a full queue.
const FULL_QUEUE_RATIO: f64 = 0.65;

/// Floor of the maximum queueing delay, in seconds.
const MIN_MAX_QUEUE: f64 = 0.010;

/// Numerator of the drop probability estimate.
const DROP_PROB_NUMERATOR: f64 = 6.0;

/// Alpha is updated at most once per this many smoothed RTTs.
const ALPHA_UPDATE_RTTS: f64 = 5.0;

/// Alpha increment in the compete region.
const COMPETE_ALPHA_STEP: f64 = 0.1;

/// Alpha increment in the high speed region.
const HIGHSPEED_ALPHA_STEP: f64 = 0.5;

/// Alpha decay in the safe region.
const SAFE_ALPHA_DECAY: f64 = 0.9;

/// Delay region of the current queueing delay.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default, Display, Serialize)]
pub enum Mode {
    /// The queue is nearly empty.
    HighSpeed,

    /// The queue is between the thresholds.
    #[default]
    Safe,

    /// The queue is at least half of the maximum observed queue.
    Compete,
}

/// PERT/RED configurable parameters.
#[derive(Debug, Clone)]
pub struct PertRedConfig {
    /// Queueing delay below which the path is in the high speed region.
    thresh1: Duration,

    /// Upper queueing delay of the safe region.
    thresh2: Duration,

    /// Initial full queue threshold.
    thresh3: Duration,

    /// Upper limit of alpha.
    alpha_max: f64,

    /// Recency weights of the drop history, oldest epoch first.
    weights: [f64; DROP_HISTORY_LEN],

    /// Configuration of the window growth inherited from NewReno.
    new_reno: NewRenoConfig,
}

impl PertRedConfig {
    pub fn new(
        thresh1: Duration,
        thresh2: Duration,
        thresh3: Duration,
        alpha_max: f64,
        weights: [f64; DROP_HISTORY_LEN],
    ) -> Result<Self> {
        validate_thresholds(thresh1, thresh2)?;
        validate_alpha_max(alpha_max)?;
        validate_weights(&weights)?;

        Ok(Self {
            thresh1,
            thresh2,
            thresh3,
            alpha_max,
            weights,
            new_reno: NewRenoConfig::default(),
        })
    }

    pub fn from(conf: &Config) -> Self {
        Self {
            thresh1: conf.pert_thresh1,
            thresh2: conf.pert_thresh2,
            thresh3: conf.pert_thresh3,
            alpha_max: conf.pert_alpha_max,
            weights: conf.pert_weights,
            new_reno: NewRenoConfig::from(conf),
        }
    }
}

impl Default for PertRedConfig {
    fn default() -> Self {
        Self {
            thresh1: DEFAULT_THRESH1,
            thresh2: DEFAULT_THRESH2,
            thresh3: DEFAULT_THRESH3,
            alpha_max: DEFAULT_ALPHA_MAX,
            weights: DEFAULT_WEIGHTS,
            new_reno: NewRenoConfig::default(),
        }
    }
}

pub(crate) fn validate_thresholds(thresh1: Duration, thresh2: Duration) -> Result<()> {
    if thresh1 > thresh2 {
        return Err(Error::InvalidConfig(format!(
            "thresh1 {:?} above thresh2 {:?}",
            thresh1, thresh2
        )));
    }
    Ok(())
}

pub(crate) fn validate_alpha_max(alpha_max: f64) -> Result<()> {
    if !alpha_max.is_finite() || alpha_max < 1.0 {
        return Err(Error::InvalidConfig(format!("alpha_max {}", alpha_max)));
    }
    Ok(())
}

pub(crate) fn validate_weights(weights: &[f64; DROP_HISTORY_LEN]) -> Result<()> {
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(Error::InvalidConfig(format!("weights {:?}", weights)));
    }
    Ok(())
}

/// Read-only view of the estimator for the host window logic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PertStatus {
    /// Current aggressiveness multiplier.
    pub alpha: f64,

    /// Upper limit of alpha.
    pub alpha_max: f64,

    /// Fraction of ssthresh removed on a congestion event.
    pub beta: f64,

    /// Current delay region.
    pub mode: Mode,

    /// Estimated drop probability.
    pub drop_prob: f64,

    /// Explicit marking probability supplied by the host.
    pub er_prob: f64,

    /// Minimum RTT observed, if any.
    pub min_rtt: Option<Duration>,

    /// Maximum RTT observed, if any.
    pub max_rtt: Option<Duration>,

    /// Smoothed RTT in seconds, zero before the first sample.
    pub smoothed_delay: f64,

    /// Current full queue threshold.
    pub thresh3: Duration,

    /// Reset on each entry into recovery or loss.
    pub change_window: u64,
}

/// PERT/RED congestion control algorithm.
#[derive(Debug, Clone)]
pub struct PertRed {
    /// Configuration.
    config: PertRedConfig,

    /// Window growth.
    new_reno: NewReno,

    /// Minimum RTT since the connection started.
    min_rtt: Duration,

    /// Maximum RTT since the connection started.
    max_rtt: Duration,

    /// Smoothed RTT in seconds. Zero until the first valid sample.
    smoothed_delay: f64,

    /// Fraction of ssthresh removed on a congestion event.
    beta: f64,

    /// Full queue threshold, follows the delay spread.
    thresh3: Duration,

    /// Aggressiveness multiplier.
    alpha: f64,

    /// Estimated drop probability.
    drop_prob: f64,

    /// Explicit marking probability supplied by the host.
    er_prob: f64,

    /// Drop events since the last rollup.
    nd: f64,

    /// Drop counts of the latest epochs.
    drop_history: DropHistory,

    /// Current delay region.
    mode: Mode,

    /// Samples classified as high speed since the last reset.
    highspeed_counter: u64,

    /// Samples classified as compete since the last reset.
    compete_counter: u64,

    /// Last time alpha was recomputed.
    last_alpha_update: Option<Instant>,

    /// Reset on each entry into recovery or loss.
    change_window: u64,

    /// Last congestion state reported by the host.
    state: CongestionState,

    /// Statistics.
    stats: CongestionStats,
}

impl PertRed {
    pub fn new(config: PertRedConfig) -> Self {
        let thresh3 = config.thresh3;
        let new_reno = NewReno::new(config.new_reno.clone());

        Self {
            config,
            new_reno,
            min_rtt: Duration::MAX,
            max_rtt: Duration::ZERO,
            smoothed_delay: 0.0,
            beta: INITIAL_BETA,
            thresh3,
            alpha: 1.0,
            drop_prob: 0.0,
            er_prob: 0.0,
            nd: 0.0,
            drop_history: DropHistory::new(),
            mode: Mode::default(),
            highspeed_counter: 0,
            compete_counter: 0,
            last_alpha_update: None,
            change_window: 0,
            state: CongestionState::Open,
            stats: Default::default(),
        }
    }

    /// Current queueing delay and maximum queueing delay, in seconds.
    fn queue_delay(&self) -> (f64, f64) {
        let spread = self.max_rtt.saturating_sub(self.min_rtt).as_secs_f64();
        let max_queue = spread.max(MIN_MAX_QUEUE);
        let cur_queue = self.smoothed_delay - self.min_rtt.as_secs_f64();

        (cur_queue, max_queue)
    }

    /// Update the smoothed delay, the full queue threshold and beta.
    fn update_pert_vars(&mut self, rtt: Duration) {
        let rtt_secs = rtt.as_secs_f64();
        self.smoothed_delay = if self.smoothed_delay > 0.0 {
            SMOOTHING_GAIN * self.smoothed_delay + (1.0 - SMOOTHING_GAIN) * rtt_secs
        } else {
            rtt_secs
        };

        let spread = self.max_rtt.saturating_sub(self.min_rtt);
        self.thresh3 = std::cmp::max(self.config.thresh2 * 2, spread.mul_f64(FULL_QUEUE_RATIO));

        let (cur_queue, max_queue) = self.queue_delay();
        if cur_queue > 0.0 {
            self.beta = cur_queue / (cur_queue + max_queue);
        }

        trace!(
            "{}. rtt = {}us, min_rtt = {}us, max_rtt = {}us, srtt = {:.6}s, cur_queue = {:.6}s, max_queue = {:.6}s, beta = {:.5}",
            self.name(),
            rtt.as_micros(),
            self.min_rtt.as_micros(),
            self.max_rtt.as_micros(),
            self.smoothed_delay,
            cur_queue,
            max_queue,
            self.beta
        );
    }

    /// Push the drop count of the finished epoch and recompute the drop
    /// probability.
    fn roll_drop_history(&mut self) -> Result<()> {
        self.change_window = 0;

        // An epoch without drops brings nothing new to the estimate.
        if self.nd == 0.0 {
            return Ok(());
        }

        self.drop_history.push(self.nd);
        self.nd = 0.0;

        let l = self.drop_history.weighted_sum(&self.config.weights);
        if l == 0.0 {
            debug!(
                "{}. weighted drop history is zero, keep drop_prob = {}",
                self.name(),
                self.drop_prob
            );
            return Err(Error::DivisionByZero);
        }
        self.drop_prob = DROP_PROB_NUMERATOR / l;

        debug!(
            "{}. drop history = {:?}, drop_prob = {}",
            self.name(),
            self.drop_history.as_slice(),
            self.drop_prob
        );

        Ok(())
    }

    /// Alpha target in the compete region.
    fn compete_target(&self, cur_queue: f64, max_queue: f64) -> f64 {
        let pp1 = 1.0 + self.er_prob / self.drop_prob;

        if cur_queue > max_queue / 2.0 && cur_queue < FULL_QUEUE_RATIO * max_queue {
            let distance = cur_queue - 0.49 * max_queue;
            if distance == 0.0 {
                return pp1;
            }

            let k1 = (pp1 - 1.0) * max_queue * 16.0 / 1500.0;
            let k2 = 1.0 + k1 * 100.0 / max_queue;
            return k2 - k1 / distance;
        }

        pp1
    }

    /// Alpha target in the safe region. It is only reported, alpha decays
    /// regardless of it.
    fn safe_target(&self, cur_queue: f64) -> f64 {
        let thresh1 = self.config.thresh1.as_secs_f64();
        let thresh2 = self.config.thresh2.as_secs_f64();

        if cur_queue > thresh1 && cur_queue < thresh2 {
            let k2 = (thresh2 - thresh1) / 31.0;
            let k1 = k2 + thresh2;
            return k1 / (k2 + cur_queue);
        }

        1.0
    }

    /// Classify the current queueing delay and, once every five smoothed
    /// RTTs, recompute alpha.
    ///
    /// `congestion_window` is the host congestion window in segments. A
    /// region has to be observed for at least that many samples before it
    /// changes alpha.
    pub fn check_and_set_alpha(&mut self, now: Instant, congestion_window: u64) {
        if self.smoothed_delay <= 0.0 {
            return;
        }

        let srtt = self.smoothed_delay;
        let (cur_queue, max_queue) = self.queue_delay();

        self.mode = if cur_queue <= self.config.thresh1.as_secs_f64() {
            self.highspeed_counter = self.highspeed_counter.saturating_add(1);
            Mode::HighSpeed
        } else if cur_queue >= 0.5 * max_queue {
            self.compete_counter = self.compete_counter.saturating_add(1);
            Mode::Compete
        } else {
            self.highspeed_counter = 0;
            self.compete_counter = 0;
            Mode::Safe
        };

        if let Some(last) = self.last_alpha_update {
            if now.saturating_duration_since(last).as_secs_f64() < ALPHA_UPDATE_RTTS * srtt {
                return;
            }
        }

        let alpha_max = self.config.alpha_max;
        let prev_alpha = self.alpha;

        if self.compete_counter >= congestion_window {
            self.alpha = if self.drop_prob != 0.0 {
                let target = self.compete_target(cur_queue, max_queue);
                (self.alpha + COMPETE_ALPHA_STEP).min(target).min(alpha_max)
            } else {
                (self.alpha + COMPETE_ALPHA_STEP).min(alpha_max)
            };
        } else if self.highspeed_counter >= congestion_window {
            self.alpha = (self.alpha + HIGHSPEED_ALPHA_STEP).min(alpha_max);
        } else {
            let target = self.safe_target(cur_queue);
            trace!("{}. safe region target = {}", self.name(), target);

            self.alpha = (SAFE_ALPHA_DECAY * self.alpha).max(1.0);
        }
        self.alpha = self.alpha.max(1.0).min(alpha_max);

        self.compete_counter = 0;
        self.highspeed_counter = 0;
        self.last_alpha_update = Some(now);
        self.stats.alpha_updates = self.stats.alpha_updates.saturating_add(1);

        debug!(
            "{}. mode = {}, cur_queue = {:.6}s, max_queue = {:.6}s, alpha {} -> {}",
            self.name(),
            self.mode,
            cur_queue,
            max_queue,
            prev_alpha,
            self.alpha
        );
    }

    /// New ssthresh after a congestion event: keep `1 - beta` of the current
    /// ssthresh, and never less than two segments.
    pub fn ssthresh_factor(&self, current_ssthresh: u64, segment_size: u64) -> u64 {
        let reduced = ((1.0 - self.beta) * current_ssthresh as f64) as u64;
        reduced.max(segment_size.saturating_mul(2))
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn drop_prob(&self) -> f64 {
        self.drop_prob
    }

    pub fn drop_history(&self) -> &DropHistory {
        &self.drop_history
    }

    /// Read-only view of the estimator.
    pub fn status(&self) -> PertStatus {
        let sampled = self.smoothed_delay > 0.0;

        PertStatus {
            alpha: self.alpha,
            alpha_max: self.config.alpha_max,
            beta: self.beta,
            mode: self.mode,
            drop_prob: self.drop_prob,
            er_prob: self.er_prob,
            min_rtt: sampled.then_some(self.min_rtt),
            max_rtt: sampled.then_some(self.max_rtt),
            smoothed_delay: self.smoothed_delay,
            thresh3: self.thresh3,
            change_window: self.change_window,
        }
    }
}

impl CongestionController for PertRed {
    fn name(&self) -> &str {
        "PERT_RED"
    }

    fn on_ack(&mut self, now: Instant, segments_acked: u32, rtt: Duration) {
        self.stats.acked_segments = self
            .stats
            .acked_segments
            .saturating_add(segments_acked as u64);

        // A zero sample is a measurement glitch, not a zero delay path.
        if rtt.is_zero() {
            self.stats.ignored_rtt_samples = self.stats.ignored_rtt_samples.saturating_add(1);
            trace!("{}. ignore zero rtt sample", self.name());
            return;
        }
        self.stats.rtt_samples = self.stats.rtt_samples.saturating_add(1);

        self.min_rtt = self.min_rtt.min(rtt);
        self.max_rtt = self.max_rtt.max(rtt);
        self.update_pert_vars(rtt);
    }

    fn on_congestion_state(&mut self, now: Instant, new_state: CongestionState) -> Result<()> {
        let prev_state = self.state;
        self.state = new_state;

        // Only the entry into recovery or loss closes an epoch.
        if !new_state.is_loss_recovery() || prev_state.is_loss_recovery() {
            return Ok(());
        }

        self.stats.congestion_events = self.stats.congestion_events.saturating_add(1);
        debug!(
            "{}. congestion state {:?} -> {:?}, nd = {}",
            self.name(),
            prev_state,
            new_state,
            self.nd
        );

        self.roll_drop_history()
    }

    fn on_congestion_signal(&mut self, events: u64) {
        self.nd += events as f64;
    }

    fn set_explicit_mark_prob(&mut self, prob: f64) -> Result<()> {
        if !prob.is_finite() || prob < 0.0 {
            return Err(Error::InvalidOperation(format!(
                "explicit mark probability {}",
                prob
            )));
        }
        self.er_prob = prob;

        Ok(())
    }

    fn ssthresh(&self, tcb: TcpState, bytes_in_flight: u64) -> u64 {
        self.ssthresh_factor(tcb.ssthresh, tcb.segment_size)
    }

    fn increase_window(&mut self, now: Instant, tcb: TcpState, segments_acked: u32) -> u64 {
        self.check_and_set_alpha(now, tcb.cwnd_in_segments());
        self.new_reno.grow(tcb, segments_acked)
    }

    fn estimator_status(&self) -> Option<PertStatus> {
        Some(self.status())
    }

    fn fork(&self) -> Box<dyn CongestionController> {
        Box::new(self.clone())
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;

    const EPSILON: f64 = 1e-9;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    /// Put the estimator in a known delay state.
    fn set_delay(p: &mut PertRed, min_rtt: Duration, max_rtt: Duration, srtt: f64) {
        p.min_rtt = min_rtt;
        p.max_rtt = max_rtt;
        p.smoothed_delay = srtt;
    }

    #[test]
    fn pert_red_init() {
        let p = PertRed::new(PertRedConfig::default());
        assert_eq!(p.name(), "PERT_RED");
        assert_eq!(p.alpha(), 1.0);
        assert_eq!(p.beta(), INITIAL_BETA);
        assert_eq!(p.mode(), Mode::Safe);
        assert_eq!(p.drop_prob(), 0.0);
        assert_eq!(p.drop_history().len(), DROP_HISTORY_LEN);

        let status = p.status();
        assert_eq!(status.min_rtt, None);
        assert_eq!(status.max_rtt, None);
        assert_eq!(status.thresh3, DEFAULT_THRESH3);
        assert_eq!(status.alpha_max, DEFAULT_ALPHA_MAX);
    }

    #[test]
    fn pert_red_first_sample() {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        p.on_ack(now, 1, ms(50));
        assert_eq!(p.min_rtt, ms(50));
        assert_eq!(p.max_rtt, ms(50));
        assert!((p.smoothed_delay - 0.050).abs() < EPSILON);
        // No queue yet, beta keeps its initial value.
        assert_eq!(p.beta(), INITIAL_BETA);
        assert_eq!(p.thresh3, DEFAULT_THRESH2 * 2);

        let status = p.status();
        assert_eq!(status.min_rtt, Some(ms(50)));
        assert_eq!(status.max_rtt, Some(ms(50)));
    }

    #[test]
    fn pert_red_second_sample() {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        p.on_ack(now, 1, ms(50));
        p.on_ack(now, 1, ms(100));
        assert_eq!(p.min_rtt, ms(50));
        assert_eq!(p.max_rtt, ms(100));
        assert!((p.smoothed_delay - 0.0505).abs() < EPSILON);
        assert!((p.beta() - 0.0005 / 0.0505).abs() < EPSILON);
        assert!((p.beta() - 0.00990).abs() < 1e-5);

        // 0.65 * 50ms is above 2 * thresh2.
        assert_eq!(p.thresh3, ms(50).mul_f64(FULL_QUEUE_RATIO));
    }

    #[test]
    fn pert_red_zero_rtt_ignored() {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        for _ in 0..5 {
            p.on_ack(now, 1, Duration::ZERO);
        }
        assert_eq!(p.min_rtt, Duration::MAX);
        assert_eq!(p.max_rtt, Duration::ZERO);
        assert_eq!(p.smoothed_delay, 0.0);
        assert_eq!(p.beta(), INITIAL_BETA);
        assert_eq!(p.stats().ignored_rtt_samples, 5);
        assert_eq!(p.stats().rtt_samples, 0);
        assert_eq!(p.stats().acked_segments, 5);

        p.on_ack(now, 1, ms(50));
        p.on_ack(now, 1, ms(100));
        let before = p.status();
        for _ in 0..5 {
            p.on_ack(now, 3, Duration::ZERO);
        }
        assert_eq!(p.status(), before);
    }

    #[test]
    fn pert_red_ssthresh() {
        let mut p = PertRed::new(PertRedConfig::default());
        let tcb = TcpState {
            cwnd: 20000,
            ssthresh: 20000,
            segment_size: 1000,
            bytes_in_flight: 20000,
        };

        // Initial beta halves ssthresh.
        assert_eq!(p.ssthresh(tcb, 20000), 10000);

        // Never below two segments.
        let small = TcpState {
            ssthresh: 3000,
            ..tcb
        };
        assert_eq!(p.ssthresh(small, 3000), 2000);

        p.beta = 0.25;
        assert_eq!(p.ssthresh_factor(20000, 1000), 15000);
        assert_eq!(p.ssthresh_factor(u64::MAX, 1000), (0.75 * u64::MAX as f64) as u64);
    }

    #[test]
    fn pert_red_empty_epoch() -> Result<()> {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();
        p.change_window = 7;

        p.on_congestion_state(now, CongestionState::Loss)?;
        assert_eq!(p.drop_history().as_slice(), &[0.0; DROP_HISTORY_LEN]);
        assert_eq!(p.drop_prob(), 0.0);
        assert_eq!(p.change_window, 0);
        assert_eq!(p.stats().congestion_events, 1);

        Ok(())
    }

    #[test]
    fn pert_red_drop_prob() -> Result<()> {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        p.on_congestion_signal(4);
        p.on_congestion_signal(6);
        p.on_congestion_state(now, CongestionState::Recovery)?;
        assert_eq!(p.nd, 0.0);
        assert_eq!(
            p.drop_history().as_slice(),
            &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 10.0]
        );
        // L = 1.0 * 10
        assert!((p.drop_prob() - 0.6).abs() < EPSILON);

        p.on_congestion_state(now, CongestionState::Open)?;
        p.on_congestion_signal(20);
        p.on_congestion_state(now, CongestionState::Loss)?;
        // L = 1.0 * 10 + 1.0 * 20
        assert!((p.drop_prob() - 0.2).abs() < EPSILON);
        assert_eq!(p.stats().congestion_events, 2);

        Ok(())
    }

    #[test]
    fn pert_red_edge_triggered() -> Result<()> {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        p.on_congestion_signal(10);
        p.on_congestion_state(now, CongestionState::Recovery)?;
        let drop_prob = p.drop_prob();

        // Still recovering, the new events stay in the accumulator.
        p.on_congestion_signal(3);
        p.on_congestion_state(now, CongestionState::Loss)?;
        p.on_congestion_state(now, CongestionState::Recovery)?;
        assert_eq!(p.nd, 3.0);
        assert_eq!(p.drop_prob(), drop_prob);
        assert_eq!(p.stats().congestion_events, 1);

        // Other states never close an epoch.
        p.on_congestion_state(now, CongestionState::Disorder)?;
        p.on_congestion_state(now, CongestionState::Cwr)?;
        assert_eq!(p.nd, 3.0);

        p.on_congestion_state(now, CongestionState::Loss)?;
        assert_eq!(p.nd, 0.0);
        assert_eq!(p.stats().congestion_events, 2);

        Ok(())
    }

    #[test]
    fn pert_red_zero_weighted_history() {
        let weights = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let conf = PertRedConfig::new(
            DEFAULT_THRESH1,
            DEFAULT_THRESH2,
            DEFAULT_THRESH3,
            DEFAULT_ALPHA_MAX,
            weights,
        )
        .unwrap();
        let mut p = PertRed::new(conf);
        let now = Instant::now();

        p.on_congestion_signal(5);
        assert_eq!(
            p.on_congestion_state(now, CongestionState::Loss),
            Err(Error::DivisionByZero)
        );
        assert_eq!(
            p.drop_history().as_slice(),
            &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0]
        );
        // The previous estimate is kept.
        assert_eq!(p.drop_prob(), 0.0);
        assert!(p.drop_prob().is_finite());
        assert_eq!(p.nd, 0.0);
    }

    #[test]
    fn pert_red_classify() {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        // No sample yet.
        p.check_and_set_alpha(now, 10);
        assert_eq!(p.last_alpha_update, None);
        assert_eq!(p.stats().alpha_updates, 0);

        // cur_queue = 2ms <= thresh1
        set_delay(&mut p, ms(50), ms(100), 0.052);
        p.check_and_set_alpha(now, 10);
        assert_eq!(p.mode(), Mode::HighSpeed);

        // cur_queue = 30ms >= 0.5 * 50ms
        set_delay(&mut p, ms(50), ms(100), 0.080);
        p.check_and_set_alpha(now, 10);
        assert_eq!(p.mode(), Mode::Compete);

        // cur_queue = 8ms, in between
        set_delay(&mut p, ms(50), ms(100), 0.058);
        p.check_and_set_alpha(now, 10);
        assert_eq!(p.mode(), Mode::Safe);
        assert_eq!(p.highspeed_counter, 0);
        assert_eq!(p.compete_counter, 0);
    }

    #[test]
    fn pert_red_compete_without_drops() {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        set_delay(&mut p, ms(50), ms(100), 0.090);
        p.compete_counter = 10;
        p.check_and_set_alpha(now, 10);

        assert_eq!(p.mode(), Mode::Compete);
        assert!((p.alpha() - 1.1).abs() < EPSILON);
        assert_eq!(p.compete_counter, 0);
        assert_eq!(p.highspeed_counter, 0);
        assert_eq!(p.last_alpha_update, Some(now));
        assert_eq!(p.stats().alpha_updates, 1);

        // Capped at alpha_max.
        p.alpha = DEFAULT_ALPHA_MAX - 0.05;
        p.compete_counter = 10;
        let now = now + Duration::from_secs(1);
        p.check_and_set_alpha(now, 10);
        assert_eq!(p.alpha(), DEFAULT_ALPHA_MAX);
    }

    #[test]
    fn pert_red_compete_with_drops() -> Result<()> {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();
        p.drop_prob = 0.01;
        p.set_explicit_mark_prob(0.01)?;

        // max_queue = 100ms, cur_queue = 60ms is inside (50ms, 65ms).
        set_delay(&mut p, ms(50), ms(150), 0.110);
        let k1 = 0.1 * 16.0 / 1500.0;
        let k2 = 1.0 + k1 * 100.0 / 0.1;
        let target = k2 - k1 / (0.060 - 0.049);
        assert!((p.compete_target(0.060, 0.1) - target).abs() < EPSILON);
        assert!(target > 1.0 && target < 2.0);

        p.alpha = 3.0;
        p.compete_counter = 5;
        p.check_and_set_alpha(now, 5);
        assert!((p.alpha() - target).abs() < 1e-6);

        // cur_queue = 80ms is above 0.65 * max_queue, target is 1 + er/d.
        set_delay(&mut p, ms(50), ms(150), 0.130);
        p.alpha = 3.0;
        p.compete_counter = 5;
        let now = now + Duration::from_secs(1);
        p.check_and_set_alpha(now, 5);
        assert!((p.alpha() - 2.0).abs() < EPSILON);

        // Below the target alpha grows by one step.
        p.alpha = 1.0;
        p.compete_counter = 5;
        let now = now + Duration::from_secs(1);
        p.check_and_set_alpha(now, 5);
        assert!((p.alpha() - 1.1).abs() < EPSILON);

        Ok(())
    }

    #[test]
    fn pert_red_compete_target_guard() {
        let mut p = PertRed::new(PertRedConfig::default());
        p.drop_prob = 0.5;
        p.er_prob = 0.5;

        // Outside of the interval the target is 1 + er/d.
        assert_eq!(p.compete_target(0.049, 0.1), 2.0);
        assert_eq!(p.compete_target(0.070, 0.1), 2.0);
        assert_eq!(p.compete_target(0.050, 0.1), 2.0);

        // Inside of the interval the target stays in (1, 1 + er/d).
        for cur in [0.0501, 0.055, 0.06, 0.0649] {
            let target = p.compete_target(cur, 0.1);
            assert!(target > 1.0 && target < 2.0, "cur {} target {}", cur, target);
        }
    }

    #[test]
    fn pert_red_highspeed() {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        set_delay(&mut p, ms(50), ms(100), 0.052);
        p.check_and_set_alpha(now, 1);
        assert_eq!(p.mode(), Mode::HighSpeed);
        assert!((p.alpha() - 1.5).abs() < EPSILON);

        // Compete takes precedence when both counters reached the window.
        set_delay(&mut p, ms(50), ms(100), 0.090);
        p.highspeed_counter = 3;
        p.compete_counter = 2;
        let now = now + Duration::from_secs(1);
        p.check_and_set_alpha(now, 3);
        assert!((p.alpha() - 1.6).abs() < EPSILON);
    }

    #[test]
    fn pert_red_safe_decay() {
        let mut p = PertRed::new(PertRedConfig::default());
        let mut now = Instant::now();

        // cur_queue = 8ms, between thresh1 and thresh2.
        set_delay(&mut p, ms(50), ms(100), 0.058);
        assert!(p.safe_target(0.008) > 1.0);
        assert_eq!(p.safe_target(0.020), 1.0);

        p.alpha = 2.0;
        p.check_and_set_alpha(now, 10);
        assert_eq!(p.mode(), Mode::Safe);
        assert!((p.alpha() - 1.8).abs() < EPSILON);

        p.alpha = 1.05;
        now += Duration::from_secs(1);
        p.check_and_set_alpha(now, 10);
        assert_eq!(p.alpha(), 1.0);
    }

    #[test]
    fn pert_red_alpha_time_gate() {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        // srtt = 52ms, the gate opens again after 260ms.
        set_delay(&mut p, ms(50), ms(100), 0.052);
        p.check_and_set_alpha(now, 1);
        assert!((p.alpha() - 1.5).abs() < EPSILON);

        p.check_and_set_alpha(now + ms(100), 1);
        p.check_and_set_alpha(now + ms(259), 1);
        assert!((p.alpha() - 1.5).abs() < EPSILON);
        // Counters keep accumulating while the gate is closed.
        assert_eq!(p.highspeed_counter, 2);
        assert_eq!(p.stats().alpha_updates, 1);

        p.check_and_set_alpha(now + ms(261), 1);
        assert!((p.alpha() - 2.0).abs() < EPSILON);
        assert_eq!(p.highspeed_counter, 0);
        assert_eq!(p.last_alpha_update, Some(now + ms(261)));
        assert_eq!(p.stats().alpha_updates, 2);
    }

    #[test]
    fn pert_red_increase_window() {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();
        let tcb = TcpState {
            cwnd: 1000,
            ssthresh: 10000,
            segment_size: 1000,
            bytes_in_flight: 0,
        };

        p.on_ack(now, 1, ms(50));
        p.on_ack(now, 1, ms(100));

        // Slow start, and the ack driven region check runs first.
        assert_eq!(p.increase_window(now, tcb, 1), 2000);
        assert_eq!(p.mode(), Mode::HighSpeed);
        assert_eq!(p.last_alpha_update, Some(now));
        assert!((p.alpha() - 1.5).abs() < EPSILON);
    }

    #[test]
    fn pert_red_huge_segment() {
        let mut conf = Config::new();
        conf.set_segment_size(1 << 33);
        let mut p = PertRed::new(PertRedConfig::from(&conf));
        let now = Instant::now();
        let tcb = TcpState {
            cwnd: 1 << 34,
            ssthresh: 1 << 33,
            segment_size: 1 << 33,
            bytes_in_flight: 1 << 34,
        };

        p.on_ack(now, 1, ms(50));
        assert_eq!(
            p.increase_window(now, tcb, 1),
            (1 << 34) + u64::MAX / (1 << 34)
        );
        // Half of ssthresh is below the two segment floor.
        assert_eq!(p.ssthresh(tcb, 1 << 34), 1 << 34);
    }

    #[test]
    fn pert_red_fork() -> Result<()> {
        let mut parent = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        parent.on_ack(now, 1, ms(50));
        parent.on_ack(now, 1, ms(100));
        parent.on_congestion_signal(4);

        let mut child = parent.fork();
        assert_eq!(child.estimator_status(), Some(parent.status()));

        child.on_ack(now, 1, ms(20));
        child.on_congestion_state(now, CongestionState::Loss)?;

        assert_eq!(parent.min_rtt, ms(50));
        assert_eq!(parent.nd, 4.0);
        assert_eq!(parent.drop_prob(), 0.0);

        let status = child.estimator_status().unwrap();
        assert_eq!(status.min_rtt, Some(ms(20)));
        assert!(status.drop_prob > 0.0);

        Ok(())
    }

    #[test]
    fn pert_red_explicit_mark_prob() {
        let mut p = PertRed::new(PertRedConfig::default());

        assert!(p.set_explicit_mark_prob(0.3).is_ok());
        assert_eq!(p.status().er_prob, 0.3);

        assert!(p.set_explicit_mark_prob(-0.1).is_err());
        assert!(p.set_explicit_mark_prob(f64::NAN).is_err());
        assert!(p.set_explicit_mark_prob(f64::INFINITY).is_err());
        assert_eq!(p.status().er_prob, 0.3);
    }

    #[test]
    fn pert_red_new_config() {
        let weights = DEFAULT_WEIGHTS;
        assert!(PertRedConfig::new(ms(5), ms(10), ms(20), 4.0, weights).is_ok());
        assert!(PertRedConfig::new(ms(5), ms(5), ms(20), 1.0, weights).is_ok());

        assert!(PertRedConfig::new(ms(20), ms(10), ms(20), 4.0, weights).is_err());
        assert!(PertRedConfig::new(ms(5), ms(10), ms(20), 0.5, weights).is_err());
        assert!(PertRedConfig::new(ms(5), ms(10), ms(20), f64::NAN, weights).is_err());

        let mut bad = weights;
        bad[3] = -1.0;
        assert!(PertRedConfig::new(ms(5), ms(10), ms(20), 4.0, bad).is_err());

        assert_eq!(DEFAULT_WEIGHTS.iter().sum::<f64>(), DROP_PROB_NUMERATOR);
    }

    #[test]
    fn pert_red_status_json() -> std::result::Result<(), serde_json::Error> {
        let mut p = PertRed::new(PertRedConfig::default());
        let now = Instant::now();

        let json = serde_json::to_value(p.status())?;
        assert_eq!(json["mode"], "Safe");
        assert!(json["min_rtt"].is_null());

        p.on_ack(now, 1, ms(50));
        let json = serde_json::to_value(p.status())?;
        assert_eq!(json["alpha"], 1.0);
        assert_eq!(json["beta"], INITIAL_BETA);
        assert_eq!(json["min_rtt"]["secs"], 0);
        assert_eq!(json["min_rtt"]["nanos"], 50_000_000);

        Ok(())
    }

    #[test]
    fn pert_red_random_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5045_5254);
        let mut p = PertRed::new(PertRedConfig::default());
        let mut now = Instant::now();
        let mut prev_min = Duration::MAX;
        let mut prev_max = Duration::ZERO;
        let mut state = CongestionState::Open;

        for _ in 0..20_000 {
            now += Duration::from_micros(rng.gen_range(0..20_000));

            match rng.gen_range(0..10) {
                0 => p.on_congestion_signal(rng.gen_range(0..5)),
                1 => {
                    state = match state {
                        CongestionState::Open => CongestionState::Recovery,
                        CongestionState::Recovery => CongestionState::Loss,
                        _ => CongestionState::Open,
                    };
                    // A zero weighted history can not happen with the
                    // default weights and a non-empty epoch.
                    assert!(p.on_congestion_state(now, state).is_ok());
                    assert_eq!(p.drop_history().len(), DROP_HISTORY_LEN);
                }
                2 => {
                    let er = rng.gen_range(0.0..0.5);
                    assert!(p.set_explicit_mark_prob(er).is_ok());
                }
                3 => p.check_and_set_alpha(now, rng.gen_range(0..8)),
                _ => {
                    let rtt = Duration::from_micros(rng.gen_range(0..300_000));
                    p.on_ack(now, 1, rtt);
                    if !rtt.is_zero() {
                        assert!(p.min_rtt <= prev_min);
                        assert!(p.max_rtt >= prev_max);
                        assert!(p.min_rtt <= p.max_rtt);
                        prev_min = p.min_rtt;
                        prev_max = p.max_rtt;
                    }
                }
            }

            assert!(p.beta() >= 0.0 && p.beta() < 1.0);
            assert!(p.alpha() >= 1.0 && p.alpha() <= DEFAULT_ALPHA_MAX);
            assert!(p.drop_prob().is_finite() && p.drop_prob() >= 0.0);
            assert!(p.thresh3 >= DEFAULT_THRESH2 * 2);
        }
    }
}
