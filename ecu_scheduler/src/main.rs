//! # ECU Scheduler
//!
//! Real-time fuel/spark scheduler binary. Loads a validated `EcuConfig`,
//! opens the file-backed calibration store, and drives
//! [`ecu_scheduler::controller::CoreController`] on a synthetic tooth stream
//! and a 1ms cycle tick. A real deployment replaces the synthetic tooth
//! source and [`ecu_scheduler::timing::SimTimingOutput`] with the hardware
//! driver that implements `TimingOutput` against the MCPWM peripheral; that
//! driver lives outside this crate (see `timing.rs`).
//!
//! # Usage
//!
//! ```bash
//! ecu_scheduler --config /etc/ecu/ecu.toml --sim-rpm 3000
//! ecu_scheduler -c ./ecu.toml -v --json
//! ```

#![deny(warnings)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use ecu_scheduler::controller::CoreController;
use ecu_scheduler::phase::ToothEvent;
use ecu_scheduler::timing::SimTimingOutput;

/// ECU Scheduler - real-time fuel/spark scheduling core
#[derive(Parser, Debug)]
#[command(name = "ecu_scheduler")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Real-time fuel/spark scheduler for a four-cylinder, four-stroke ECU")]
#[command(long_about = None)]
struct Args {
    /// Path to the firmware TOML configuration file
    #[arg(short, long, default_value = "/etc/ecu/ecu.toml")]
    config: PathBuf,

    /// Simulated crank RPM used to drive the synthetic tooth stream
    #[arg(long, default_value_t = 3000)]
    sim_rpm: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("ecu_scheduler startup failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    info!("ECU Scheduler v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut controller = CoreController::from_config_file(&args.config)?;
    info!(path = %args.config.display(), "configuration loaded");

    let tooth_count_total = controller.config().tooth_count_total as u32;
    let logical_positions = tooth_count_total + 2;
    let tooth_period_us = (60_000_000u32 / args.sim_rpm.max(1)) / logical_positions.max(1);

    let mut output = SimTimingOutput::new();
    let mut now_us: u32 = 0;
    let mut tooth_counter: u64 = 0;
    let mut last_cycle_ms: u64 = 0;
    let start = Instant::now();

    controller.feed_watchdog(0);
    info!(
        sim_rpm = args.sim_rpm,
        tooth_period_us, "entering synthetic tooth/cycle loop"
    );

    loop {
        output.set_counter(now_us);
        controller.on_tooth_event(
            ToothEvent {
                timestamp_us: now_us,
                is_cam_phase: tooth_counter % logical_positions as u64 == 0,
            },
            now_us,
            &mut output,
        )?;
        tooth_counter += 1;
        now_us = now_us.wrapping_add(tooth_period_us);

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if elapsed_ms != last_cycle_ms {
            last_cycle_ms = elapsed_ms;
            controller.feed_watchdog(elapsed_ms);
            if let Err(e) = controller.on_cycle_tick(elapsed_ms) {
                warn!(error = %e, "cycle tick degraded, continuing");
            }
            let status = controller.status();
            if elapsed_ms % 1000 == 0 {
                info!(
                    rpm = status.rpm,
                    sync_state = ?status.sync_state,
                    limp_mode = status.limp_mode,
                    late = status.late,
                    rearm_collision = status.rearm_collision,
                    "status"
                );
            }
        }

        std::thread::sleep(Duration::from_micros(tooth_period_us as u64));
    }
}

/// Set up tracing based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
