//! Receiver control loop
//!
//! Start the device and engine, wait for time sync and an ensemble, select
//! the requested service and play it until the duration runs out or a
//! signal arrives. Teardown runs exactly once on every path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::device::DeviceHandler;
use crate::engine::DabEngine;
use crate::state::RadioState;

/// Settle time after the ensemble is found, before a service is selected
const SETTLE_TICKS: u32 = 3;

/// Quality summary interval, in ticks
const STATS_TICKS: u64 = 10;

/// How the service to play is named on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSelector {
    Name(String),
    Sid(u32),
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Tuned frequency in Hz
    pub frequency: u32,
    /// Seconds to wait for time synchronisation
    pub sync_timeout: i32,
    /// Seconds to wait for the ensemble
    pub ensemble_timeout: i32,
    pub service: ServiceSelector,
    /// Seconds to play; negative means until interrupted
    pub duration_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    NoSignal,
    NoEnsemble,
    DeviceFailed,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Finished => 0,
            Outcome::NoSignal | Outcome::NoEnsemble => 22,
            Outcome::DeviceFailed => 1,
        }
    }
}

pub struct Controller<E: DabEngine> {
    engine: E,
    device: Arc<dyn DeviceHandler>,
    state: Arc<RadioState>,
    plan: RunPlan,
    tick: Duration,
}

impl<E: DabEngine> Controller<E> {
    pub fn new(engine: E, device: Arc<dyn DeviceHandler>, state: Arc<RadioState>, plan: RunPlan) -> Self {
        Self {
            engine,
            device,
            state,
            plan,
            tick: Duration::from_secs(1),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub async fn run(mut self) -> Outcome {
        if let Err(e) = self.device.restart_reader(self.plan.frequency) {
            error!("Cannot start {}: {}", self.device.name(), e);
            self.engine.exit();
            return Outcome::DeviceFailed;
        }

        self.state.reset_acquisition();
        self.engine.start_processing();

        let state = self.state.clone();
        if !self
            .wait_for(self.plan.sync_timeout, || state.time_synced())
            .await
        {
            error!("There does not seem to be a DAB signal here");
            self.abort().await;
            return Outcome::NoSignal;
        }
        info!("there might be a DAB signal here");

        if !self
            .wait_for(self.plan.ensemble_timeout, || state.ensemble_recognized())
            .await
        {
            error!("no ensemble data found, fatal");
            self.abort().await;
            return Outcome::NoEnsemble;
        }

        for _ in 0..SETTLE_TICKS {
            tokio::time::sleep(self.tick).await;
        }
        if self.state.interrupted() {
            info!("Interrupted before playback");
        } else {
            self.state.set_running(true);
            self.select_service();
        }

        self.play().await;
        self.shutdown();
        Outcome::Finished
    }

    /// Poll `ready` once per tick, at most `timeout` times
    async fn wait_for(&self, timeout: i32, ready: impl Fn() -> bool) -> bool {
        for left in (0..timeout.max(0)).rev() {
            if ready() {
                return true;
            }
            debug!("waiting, {} s left", left + 1);
            tokio::time::sleep(self.tick).await;
        }
        ready()
    }

    fn select_service(&mut self) {
        let name = match &self.plan.service {
            ServiceSelector::Name(name) => name.clone(),
            ServiceSelector::Sid(sid) => match self.engine.service_name(*sid) {
                Some(name) => name,
                None => {
                    warn!("No service with SID {:X} in this ensemble", sid);
                    String::new()
                }
            },
        };

        info!("we try to start program {}", name);
        if !self.engine.is_audio_service(&name) {
            warn!("sorry  we cannot handle service {}", name);
            self.state.set_running(false);
            return;
        }
        let data = self.engine.data_for_audio_service(&name);
        if !data.defined {
            warn!("sorry  we cannot handle service {}", name);
            self.state.set_running(false);
            return;
        }
        self.engine.reset_msc();
        self.engine.set_audio_channel(&data);
    }

    async fn play(&self) {
        let mut remaining = self.plan.duration_secs;
        let mut ticks: u64 = 0;
        while self.state.is_running() && remaining != 0 {
            if remaining > 0 {
                remaining -= 1;
            }
            tokio::time::sleep(self.tick).await;
            ticks += 1;
            if ticks % STATS_TICKS == 0 {
                debug!("{}", self.state.quality);
            }
        }
    }

    /// Failed acquisition: give the reader a tick to drain before stopping
    async fn abort(mut self) {
        self.device.stop_reader();
        tokio::time::sleep(self.tick).await;
        self.engine.stop();
        self.engine.exit();
    }

    fn shutdown(mut self) {
        self.device.stop_reader();
        self.engine.stop();
        self.engine.exit();
        info!("Receiver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Outcome::Finished.exit_code(), 0);
        assert_eq!(Outcome::NoSignal.exit_code(), 22);
        assert_eq!(Outcome::NoEnsemble.exit_code(), 22);
        assert_eq!(Outcome::DeviceFailed.exit_code(), 1);
    }
}
