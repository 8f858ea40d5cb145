mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use adreno_preempt::sim::SimDevice;
use adreno_preempt::{FaultReason, PreemptEvent, PreemptFault, PreemptState};
use pretty_assertions::assert_eq;

use common::{assert_edges_legal, complete_switch, controller, WATCHDOG};

#[test]
fn interrupt_is_ignored_unless_triggered() {
    let sim = SimDevice::new(2);
    let ctrl = controller(&sim);

    // NONE
    ctrl.on_interrupt();
    assert_eq!(ctrl.state(), PreemptState::None);
    assert!(sim.telemetry.take().is_empty());

    // FAULTED
    ctrl.submit(1, 4).unwrap();
    ctrl.on_watchdog_timeout();
    assert_eq!(ctrl.state(), PreemptState::Faulted);
    sim.telemetry.take();
    sim.gpu.complete_switch();
    ctrl.on_interrupt();
    assert_eq!(ctrl.state(), PreemptState::Faulted);
    assert!(sim.telemetry.take().is_empty());
}

#[test]
fn watchdog_first_then_interrupt() {
    let sim = SimDevice::new(2);
    let ctrl = controller(&sim);
    ctrl.submit(1, 4).unwrap();

    sim.clock.advance(WATCHDOG);
    ctrl.tick();
    assert_eq!(ctrl.state(), PreemptState::Faulted);

    // The switch completes after all; the interrupt loses the race.
    assert!(complete_switch(&sim, &ctrl));
    assert_eq!(ctrl.state(), PreemptState::Faulted);
    assert_eq!(ctrl.cur_ring(), 0);
    assert_eq!(
        sim.recovery.faults(),
        vec![PreemptFault {
            reason: FaultReason::Timeout,
            cur_ring: 0,
            next_ring: Some(1),
        }]
    );
    assert_edges_legal(&sim);
}

#[test]
fn interrupt_first_then_watchdog() {
    let sim = SimDevice::new(2);
    let ctrl = controller(&sim);
    ctrl.submit(1, 4).unwrap();
    let deadline = ctrl.watchdog_deadline_ns().unwrap();

    assert!(complete_switch(&sim, &ctrl));
    assert_eq!(ctrl.state(), PreemptState::None);

    // A timer callback that was already running when the interrupt cancelled the deadline.
    sim.clock.set_ns(deadline);
    ctrl.on_watchdog_timeout();
    ctrl.tick();
    assert_eq!(ctrl.state(), PreemptState::None);
    assert_eq!(ctrl.cur_ring(), 1);
    assert_eq!(sim.recovery.count(), 0);
    assert_eq!(ctrl.stats().timeouts, 0);
    assert_edges_legal(&sim);
}

#[test]
fn each_trigger_rearms_the_watchdog() {
    let sim = SimDevice::new(2);
    let ctrl = controller(&sim);
    ctrl.submit(1, 4).unwrap();

    assert!(complete_switch(&sim, &ctrl));
    assert_eq!(ctrl.watchdog_deadline_ns(), None);

    sim.clock.set_ns(1_000);
    ctrl.submit(0, 4).unwrap();
    assert_eq!(ctrl.state(), PreemptState::Triggered);
    let deadline = ctrl.watchdog_deadline_ns().unwrap();
    assert_eq!(deadline, 1_000 + WATCHDOG.as_nanos() as u64);

    sim.clock.set_ns(deadline - 1);
    ctrl.tick();
    assert_eq!(ctrl.state(), PreemptState::Triggered);

    sim.clock.set_ns(deadline);
    ctrl.tick();
    assert_eq!(ctrl.state(), PreemptState::Faulted);
    assert_eq!(
        sim.recovery.faults(),
        vec![PreemptFault {
            reason: FaultReason::Timeout,
            cur_ring: 1,
            next_ring: Some(0),
        }]
    );
}

#[test]
fn repeated_ticks_request_recovery_once() {
    let sim = SimDevice::new(2);
    let ctrl = controller(&sim);
    ctrl.submit(1, 4).unwrap();

    for _ in 0..5 {
        sim.clock.advance(WATCHDOG);
        ctrl.tick();
    }
    assert_eq!(sim.recovery.count(), 1);
    assert_eq!(ctrl.stats().faults, 1);

    let faults: Vec<_> = sim
        .telemetry
        .take()
        .into_iter()
        .filter(|e| matches!(e, PreemptEvent::Fault { .. }))
        .collect();
    assert_eq!(
        faults,
        vec![PreemptEvent::Fault {
            ring: 1,
            reason: FaultReason::Timeout
        }]
    );
}

#[test]
fn racing_interrupt_and_watchdog_resolve_exactly_once() {
    for _ in 0..200 {
        let sim = SimDevice::new(2);
        let ctrl = Arc::new(controller(&sim));
        ctrl.submit(1, 4).unwrap();
        sim.gpu.complete_switch();

        let barrier = Arc::new(Barrier::new(2));
        let irq = {
            let ctrl = ctrl.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ctrl.on_interrupt();
            })
        };
        let timer = {
            let ctrl = ctrl.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ctrl.on_watchdog_timeout();
            })
        };
        irq.join().unwrap();
        timer.join().unwrap();

        match ctrl.state() {
            PreemptState::Faulted => {
                assert_eq!(sim.recovery.count(), 1);
                assert_eq!(ctrl.cur_ring(), 0);
            }
            PreemptState::None => {
                assert_eq!(sim.recovery.count(), 0);
                assert_eq!(ctrl.cur_ring(), 1);
            }
            other => panic!("unexpected state {other}"),
        }
        assert_eq!(ctrl.next_ring(), None);
        assert_eq!(ctrl.watchdog_deadline_ns(), None);
        assert_edges_legal(&sim);
    }
}
