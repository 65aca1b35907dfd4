//! dab-cmdline - DAB/DAB+ receiver for the command line
//!
//! Selects a service from an ensemble and writes its audio as 16-bit PCM
//! to stdout. Diagnostics and machine-readable status lines go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dab_cmdline::band;
use dab_cmdline::config::{self, Config};
use dab_cmdline::controller::{Controller, RunPlan, ServiceSelector};
use dab_cmdline::device;
use dab_cmdline::engine::{EngineOptions, LibDab};
use dab_cmdline::sink::pcm::PcmOutput;
use dab_cmdline::sink::tdc::TdcServer;
use dab_cmdline::sink::RadioSink;
use dab_cmdline::state::RadioState;

/// Exit status when the decoding engine cannot be brought up
const EXIT_NO_ENGINE: i32 = 4;

#[tokio::main]
async fn main() {
    let config = match config::parse() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    init_logging(config.verbose);

    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

/// Logs go to stderr; stdout carries the audio
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: Config) -> Result<i32> {
    let Some(frequency) = band::frequency(config.band, &config.channel) else {
        error!("Unknown channel {} in {}", config.channel, config.band);
        return Ok(1);
    };

    info!("Configuration:");
    info!("  Device: {:?}", config.device.kind);
    info!("  Channel: {} ({}, {} Hz)", config.channel, config.band, frequency);
    match config.service_id {
        Some(sid) => info!("  Service: SID {:X}", sid),
        None => info!("  Service: {}", config.program),
    }
    info!("  Mode: {}", config.mode);
    if config.duration_secs >= 0 {
        info!("  Duration: {} s", config.duration_secs);
    }
    if let Some(dir) = &config.info_dir {
        info!("  Info directory: {}", dir.display());
    }

    let device = match device::open(&config.device) {
        Ok(device) => device,
        Err(e) => {
            error!("Exception : {}", e);
            return Ok(1);
        }
    };

    let state = RadioState::new();
    let pcm = if config.streamer {
        PcmOutput::streamed_stdout().context("cannot start PCM streamer")?
    } else {
        PcmOutput::stdout()
    };
    let mut sink = RadioSink::new(state.clone(), pcm);
    if let Some(dir) = &config.info_dir {
        sink = sink.with_info_dir(dir);
    }
    if let Some(port) = config.data_port {
        let (server, _accept) = TdcServer::bind(port)
            .await
            .with_context(|| format!("cannot listen on TDC port {}", port))?;
        sink = sink.with_tdc(server);
    }

    let options = EngineOptions {
        mode: config.mode,
        threshold: config.threshold,
    };
    let engine = match LibDab::open(&config.engine_lib, options, device.clone(), Arc::new(sink)) {
        Ok(engine) => engine,
        Err(e) => {
            error!("{}", e);
            error!("sorry, no radio device available, fatal");
            return Ok(EXIT_NO_ENGINE);
        }
    };

    let signals = state.clone();
    tokio::spawn(async move {
        if let Err(e) = watch_signals(signals).await {
            warn!("Cannot install signal handlers: {}", e);
        }
    });

    let plan = RunPlan {
        frequency,
        sync_timeout: config.sync_timeout,
        ensemble_timeout: config.ensemble_timeout,
        service: match config.service_id {
            Some(sid) => ServiceSelector::Sid(sid),
            None => ServiceSelector::Name(config.program.clone()),
        },
        duration_secs: config.duration_secs,
    };
    let outcome = Controller::new(engine, device, state, plan).run().await;
    Ok(outcome.exit_code())
}

#[cfg(unix)]
async fn watch_signals(state: Arc<RadioState>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        warn!("Signal caught, terminating!");
        state.interrupt();
    }
}

#[cfg(not(unix))]
async fn watch_signals(state: Arc<RadioState>) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        warn!("Signal caught, terminating!");
        state.interrupt();
    }
}
