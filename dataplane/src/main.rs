// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The forwarding process.
//!
//! Builds the switch context from the command line, populates the vport
//! registry, hands each forwarding core its pipeline as a scheduled job,
//! and runs the control pipeline plus the periodic stats display on the
//! master core until interrupted.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use args::{CmdArgs, Parser};
use datapath::{Pipeline, PipelineConfig, Switch};
use flow::TscClock;
use sched::JobBoard;

mod ports;
mod stats_display;

/// Buffers in the packet pool.
const PKTMBUF_POOL_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
enum InitError {
    #[error(transparent)]
    Args(#[from] args::ArgsError),
    #[error(transparent)]
    Vport(#[from] vport::VportError),
    #[error(transparent)]
    Rings(#[from] ring::registry::RegistryError),
    #[error(transparent)]
    Pipeline(#[from] datapath::PipelineError),
    #[error(transparent)]
    Memnic(#[from] vport::memnic::MemnicError),
    #[error(transparent)]
    Sched(#[from] sched::SchedError),
    #[error("install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cmd = CmdArgs::parse();
    match run(cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal initialisation failure");
            ExitCode::FAILURE
        }
    }
}

fn run(cmd: CmdArgs) -> Result<(), InitError> {
    cmd.validate()?;

    info!("calibrating cycle counter");
    let clock = TscClock::calibrate();
    info!(hz = clock.hz(), "cycle counter calibrated");

    let switch = Arc::new(Switch::new(PKTMBUF_POOL_SIZE, clock));
    ports::populate(&switch, &cmd)?;

    let forwarding_cores = cmd.forwarding_cores();
    let n_cores = forwarding_cores
        .iter()
        .copied()
        .chain(std::iter::once(cmd.vswitchd))
        .max()
        .unwrap_or(0) as usize
        + 1;
    let board = JobBoard::new(n_cores, cmd.vswitchd as usize);

    // forwarding pipelines on slave cores
    for core in &forwarding_cores {
        let ingress = ports::ingress_for_core(&cmd, *core);
        let mut config = PipelineConfig::new(*core);
        config.ingress = ingress;
        let mut pipeline = Pipeline::new(Arc::clone(&switch), config)?;
        let board_ref = Arc::clone(&board);
        let core_idx = *core as usize;
        board.add_job(
            core_idx,
            Box::new(move || {
                pipeline.run_once();
                if board_ref.removal_requested(core_idx) {
                    board_ref.ack_removal(core_idx);
                }
            }),
        )?;
    }

    // the control pipeline runs on the master core
    let mut control = Pipeline::new(
        Arc::clone(&switch),
        PipelineConfig::new(cmd.vswitchd),
    )?;
    board.add_job(
        cmd.vswitchd as usize,
        Box::new(move || control.run_once()),
    )?;

    if cmd.stats > 0 {
        let display = stats_display::StatsDisplay::new(Arc::clone(&switch));
        let interval = Duration::from_secs(cmd.stats);
        let mut last = Instant::now();
        board.add_job(
            cmd.vswitchd as usize,
            Box::new(move || {
                if last.elapsed() >= interval {
                    display.print();
                    last = Instant::now();
                }
            }),
        )?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let stopper = Arc::clone(&running);
    ctrlc::set_handler(move || {
        stopper.store(false, Ordering::Release);
    })?;

    board.launch_all();
    info!(
        cores = forwarding_cores.len(),
        master = cmd.vswitchd,
        "data plane online"
    );

    while running.load(Ordering::Acquire) {
        board.run_master_round();
    }

    info!("stopping forwarding cores");
    board.stop_all();
    Ok(())
}
