use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, info};

use chanstore_types::ChannelIndex;

use crate::error::{Disruption, DisruptionReport, EngineError, EngineResult, Problem};

/// Shared flag raised once the owning storage system is gone.
///
/// Every component holding a clone observes the raise. After it, the
/// operation controller reports processing as disabled.
#[derive(Clone, Debug, Default)]
pub struct LivenessSignal(Arc<AtomicBool>);

impl LivenessSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    active: bool,
    channel_processing_enabled: bool,
    disruptions: Vec<Disruption>,
}

/// Process-wide gate consulted by channels and the task broker.
///
/// Lifecycle: inactive -> active -> (disrupted) -> inactive. Once a
/// disruption is registered, channel processing stays disabled until a new
/// controller is built for a fresh initialization; disruptions are never
/// cleared.
///
/// All state sits behind one lock. Disruptions are rare and must never be
/// missed, so contention is not a concern.
#[derive(Debug)]
pub struct OperationController {
    state: Mutex<ControllerState>,
    liveness: LivenessSignal,
}

impl OperationController {
    pub fn new(liveness: LivenessSignal) -> Self {
        Self {
            state: Mutex::new(ControllerState::default()),
            liveness,
        }
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(disruptions: &[Disruption]) -> EngineError {
        EngineError::Disrupted(DisruptionReport {
            disruptions: disruptions.to_vec(),
        })
    }

    /// Enable channel processing. Fails if a disruption was ever registered.
    pub fn activate(&self) -> EngineResult<()> {
        let mut state = self.state();
        if !state.disruptions.is_empty() {
            return Err(Self::report(&state.disruptions));
        }
        if !state.active {
            info!("channel processing activated");
        }
        state.active = true;
        state.channel_processing_enabled = true;
        Ok(())
    }

    /// Disable channel processing.
    pub fn deactivate(&self) {
        let mut state = self.state();
        if state.active {
            info!("channel processing deactivated");
        }
        state.active = false;
        state.channel_processing_enabled = false;
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    /// Whether channels may proceed.
    ///
    /// Fails with the full disruption report once any disruption exists;
    /// that takes priority over the enabled flag. Returns `false` after the
    /// liveness signal was raised.
    pub fn check_processing_enabled(&self) -> EngineResult<bool> {
        let state = self.state();
        if !state.disruptions.is_empty() {
            return Err(Self::report(&state.disruptions));
        }
        if self.liveness.is_raised() {
            return Ok(false);
        }
        Ok(state.channel_processing_enabled)
    }

    /// Non-failing variant of [`check_processing_enabled`](Self::check_processing_enabled).
    pub fn is_channel_processing_enabled(&self) -> bool {
        matches!(self.check_processing_enabled(), Ok(true))
    }

    /// Record a disruption and disable channel processing.
    ///
    /// Returns `true` only for the first disruption, so exactly one reporter
    /// drives any system-wide follow-up.
    pub fn register_disruption(&self, channel: Option<ChannelIndex>, error: Problem) -> bool {
        let mut state = self.state();
        match channel {
            Some(channel) => error!(%channel, error = %error, "disruption registered"),
            None => error!(error = %error, "disruption registered"),
        }
        state.disruptions.push(Disruption { channel, error });
        state.channel_processing_enabled = false;
        state.disruptions.len() == 1
    }

    pub fn has_disruptions(&self) -> bool {
        !self.state().disruptions.is_empty()
    }

    /// Snapshot of all disruptions in registration order.
    pub fn disruptions(&self) -> Vec<Disruption> {
        self.state().disruptions.clone()
    }
}
