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
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;

use clap::error::ErrorKind;
use clap::CommandFactory;
use clap::Parser;
use log::debug;
use log::info;

use tcp_pert::Config;
use tcp_pert::CongestionControlAlgorithm;
use tcp_pert_tools::parse_trace;
use tcp_pert_tools::Result;
use tcp_pert_tools::TraceReplayer;

#[derive(Parser, Debug, Clone)]
#[clap(name = "pert_replay")]
pub struct ReplayOpt {
    /// Trace file. Each line is `<time_ms> <event> [args]`, where event is one
    /// of `ack <rtt_ms> [segments]`, `mark <count>`, `ecn <prob>` and
    /// `state <open|disorder|cwr|recovery|loss>`.
    #[clap(value_name = "TRACE")]
    pub trace: String,

    /// Congestion control algorithm.
    #[clap(long, default_value = "PERT", value_name = "STR")]
    pub congestion_control_algor: CongestionControlAlgorithm,

    /// Segment size in bytes.
    #[clap(long, default_value = "1460", value_name = "NUM")]
    pub segment_size: u64,

    /// Initial congestion window in packets.
    #[clap(long, default_value = "10", value_name = "NUM")]
    pub initial_congestion_window: u64,

    /// Minimum congestion window in packets.
    #[clap(long, default_value = "2", value_name = "NUM")]
    pub min_congestion_window: u64,

    /// Slow start threshold in packets. "0" means no threshold.
    #[clap(long, default_value = "0", value_name = "NUM")]
    pub slow_start_thresh: u64,

    /// PERT lower queueing delay threshold in milliseconds.
    #[clap(long, default_value = "5", value_name = "TIME")]
    pub pert_thresh1: u64,

    /// PERT upper queueing delay threshold in milliseconds.
    #[clap(long, default_value = "10", value_name = "TIME")]
    pub pert_thresh2: u64,

    /// PERT initial full queue threshold in milliseconds.
    #[clap(long, default_value = "20", value_name = "TIME")]
    pub pert_thresh3: u64,

    /// PERT upper limit of alpha.
    #[clap(long, default_value = "8", value_name = "NUM")]
    pub pert_alpha_max: f64,

    /// Print one JSON object per event instead of text.
    #[clap(long)]
    pub json: bool,

    /// Log level, support OFF/ERROR/WARN/INFO/DEBUG/TRACE.
    #[clap(long, default_value = "WARN", value_name = "STR")]
    pub log_level: log::LevelFilter,

    /// Log file path. If no file is specified, logs will be written to `stderr`.
    #[clap(long, value_name = "FILE")]
    pub log_file: Option<String>,
}

fn parse_option() -> std::result::Result<ReplayOpt, clap::error::Error> {
    let option = ReplayOpt::parse();

    if option.pert_thresh1 > option.pert_thresh2 {
        return Err(ReplayOpt::command().error(
            ErrorKind::ValueValidation,
            "pert-thresh1 should not be above pert-thresh2",
        ));
    }

    Ok(option)
}

fn process_option(option: &ReplayOpt) -> Result<Config> {
    env_logger::builder()
        .target(tcp_pert_tools::log_target(&option.log_file)?)
        .filter_level(option.log_level)
        .format_timestamp_millis()
        .init();

    let mut conf = Config::new();
    conf.set_congestion_control_algorithm(option.congestion_control_algor);
    conf.set_segment_size(option.segment_size);
    conf.set_initial_congestion_window(option.initial_congestion_window);
    conf.set_min_congestion_window(option.min_congestion_window);
    if option.slow_start_thresh != 0 {
        conf.set_slow_start_thresh(option.slow_start_thresh);
    }
    conf.set_pert_thresholds(option.pert_thresh1, option.pert_thresh2)?;
    conf.set_pert_thresh3(option.pert_thresh3);
    conf.set_pert_alpha_max(option.pert_alpha_max)?;

    debug!("replay config {:?}", conf);
    Ok(conf)
}

fn main() -> Result<()> {
    // Parse replay option.
    let option = match parse_option() {
        Ok(option) => option,
        Err(e) => e.exit(),
    };

    // Process replay option.
    let conf = process_option(&option)?;

    // Load trace.
    let records = parse_trace(BufReader::new(File::open(&option.trace)?))?;
    info!("loaded {} records from {}", records.len(), option.trace);

    // Replay trace.
    let mut replayer = TraceReplayer::new(&conf);
    let mut out = BufWriter::new(std::io::stdout().lock());
    for record in &records {
        let output = replayer.replay(record)?;
        if option.json {
            serde_json::to_writer(&mut out, &output)?;
            writeln!(out)?;
        } else {
            writeln!(out, "{}", output.to_text())?;
        }
    }

    if !option.json {
        let stats = replayer.stats();
        writeln!(out, "algorithm: {}", replayer.name())?;
        writeln!(out, "acked segments: {}", stats.acked_segments)?;
        writeln!(
            out,
            "rtt samples: {} ({} ignored)",
            stats.rtt_samples, stats.ignored_rtt_samples
        )?;
        writeln!(out, "congestion events: {}", stats.congestion_events)?;
        writeln!(out, "alpha updates: {}", stats.alpha_updates)?;
    }
    out.flush()?;

    Ok(())
}
