#![allow(dead_code)]

use std::time::Duration;

use adreno_preempt::sim::SimDevice;
use adreno_preempt::{PreemptConfig, PreemptController, PreemptState};

pub const WATCHDOG: Duration = Duration::from_millis(10);

/// Hardware defaults with record sizes small enough for host tests.
pub fn small_config() -> PreemptConfig {
    PreemptConfig {
        context_record_size: 512,
        user_record_size: 256,
        watchdog_timeout: WATCHDOG,
        ..Default::default()
    }
}

/// Controller for `sim` after `hw_init`, with the init writes and events cleared.
pub fn controller(sim: &SimDevice) -> PreemptController {
    let ctrl = PreemptController::init(sim.device(), small_config()).unwrap();
    ctrl.hw_init();
    sim.gpu.take_writes();
    sim.telemetry.take();
    ctrl
}

/// Play the CP: finish the in-flight switch and raise the interrupt. Returns whether a switch was
/// pending.
pub fn complete_switch(sim: &SimDevice, ctrl: &PreemptController) -> bool {
    let pending = sim.gpu.complete_switch();
    if pending {
        ctrl.on_interrupt();
    }
    pending
}

pub fn assert_edges_legal(sim: &SimDevice) {
    for (from, to) in sim.telemetry.state_changes() {
        assert!(
            PreemptState::can_transition(from, to),
            "illegal transition {from} -> {to}"
        );
    }
}
