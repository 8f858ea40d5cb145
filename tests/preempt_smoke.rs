use std::sync::Arc;

use adreno::preempt::sim::{CountingRecovery, SimAllocator, SimGpu};
use adreno::preempt::{
    PageTableParams, PreemptState, Ring, StaticAddressSpace, TracingTelemetry,
};
use adreno::time::StdHostClock;
use adreno::{PreemptConfig, PreemptController, PreemptDevice};
use pretty_assertions::assert_eq;

fn rings(n: usize) -> Vec<Arc<Ring>> {
    (0..n)
        .map(|id| {
            let aspace = Arc::new(StaticAddressSpace(PageTableParams {
                ttbr0: 0x1_0000_0000,
                asid: 0,
            }));
            Arc::new(Ring::new(
                id,
                0x8000_0000 + ((id as u64) << 16),
                0x9000_0000 + ((id as u64) << 8),
                aspace,
            ))
        })
        .collect()
}

#[test]
fn preemption_round_trip_with_tracing_sink() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let gpu = Arc::new(SimGpu::new());
    let allocator = Arc::new(SimAllocator::new());
    let recovery = Arc::new(CountingRecovery::new());
    let device = PreemptDevice {
        rings: rings(2),
        mmio: gpu.clone(),
        allocator: allocator.clone(),
        recovery: recovery.clone(),
        telemetry: Arc::new(TracingTelemetry),
        clock: Arc::new(StdHostClock::new()),
    };

    let mut ctrl = PreemptController::init(
        device,
        PreemptConfig {
            context_record_size: 4096,
            user_record_size: 4096,
            ..Default::default()
        },
    )
    .unwrap();
    ctrl.hw_init();
    assert!(ctrl.preemption_enabled());

    ctrl.submit(1, 16).unwrap();
    assert_eq!(ctrl.state(), PreemptState::Triggered);

    assert!(gpu.complete_switch());
    ctrl.on_interrupt();
    assert_eq!(ctrl.state(), PreemptState::None);
    assert_eq!(ctrl.cur_ring(), 1);
    assert_eq!(recovery.count(), 0);

    ctrl.fini();
    assert_eq!(allocator.live(), 0);
}

#[test]
fn default_config_matches_hardware_defaults() {
    let config = PreemptConfig::default();
    assert_eq!(config.preempt_level, 1);
    assert!(config.uses_gmem);
    assert!(!config.skip_save_restore);
    assert_eq!(config.watchdog_timeout, std::time::Duration::from_secs(10));
    assert_eq!(config.context_record_size, 2860 * 1024);
    assert_eq!(config.user_record_size, 192 * 1024);
}
