mod common;

use adreno_preempt::regs::cp;
use adreno_preempt::sim::{drain_ring, SimDevice};
use adreno_preempt::{
    PageTableParams, PreemptController, PreemptEvent, PreemptState, SubmitQueue,
    TriggerExitReason,
};
use pretty_assertions::assert_eq;

use common::{assert_edges_legal, complete_switch, controller, small_config};

#[test]
fn two_ring_switch_end_to_end() {
    let sim = SimDevice::new(2);
    let ctrl = controller(&sim);
    assert_eq!(ctrl.cur_ring(), 0);

    // Ring 1 moves to another process after its records were populated.
    sim.aspaces[1].set(PageTableParams {
        ttbr0: 0x9_0000_0000,
        asid: 42,
    });
    sim.rings[1].memptrs().set_context_idr(0x2a);

    let wptr = ctrl.submit(1, 32).unwrap();
    assert_eq!(wptr, 32);
    assert_eq!(ctrl.state(), PreemptState::Triggered);
    assert_eq!(ctrl.next_ring(), Some(1));
    assert!(sim.gpu.switch_in_progress());
    assert!(ctrl.watchdog_deadline_ns().is_some());

    let records = ctrl.records().unwrap().ring(1).unwrap();
    assert_eq!(records.preempt_record().wptr, 32);
    let smmu = records.smmu_info();
    assert_eq!(
        (smmu.ttbr0, smmu.asid, smmu.context_idr),
        (0x9_0000_0000, 42, 0x2a)
    );

    assert!(complete_switch(&sim, &ctrl));
    assert_eq!(ctrl.state(), PreemptState::None);
    assert_eq!(ctrl.cur_ring(), 1);
    assert_eq!(ctrl.next_ring(), None);
    assert_eq!(ctrl.watchdog_deadline_ns(), None);

    {
        use PreemptState::*;
        assert_eq!(
            sim.telemetry.state_changes(),
            vec![
                // Submission triggers the switch.
                (None, Evaluate),
                (Evaluate, Start),
                (Start, Triggered),
                // Interrupt completes it.
                (Triggered, Pending),
                (Pending, Abort),
                (Abort, None),
                // Chained evaluation finds ring 1 already current.
                (None, Evaluate),
                (Evaluate, Abort),
                (Abort, None),
            ]
        );
    }

    let events = sim.telemetry.take();
    assert!(events.contains(&PreemptEvent::Trigger {
        from: 0,
        to: 1,
        wptr: 32
    }));
    assert!(events.contains(&PreemptEvent::Interrupt { ring: 1 }));
    assert_eq!(
        events.last(),
        Some(&PreemptEvent::TriggerExit {
            reason: TriggerExitReason::NoSwitch,
            new_submission: false,
            state: PreemptState::None,
        })
    );

    let stats = ctrl.stats();
    assert_eq!(stats.triggers, 1);
    assert_eq!(stats.switches, 1);
    assert_eq!(stats.faults, 0);
    assert_eq!(sim.recovery.count(), 0);
}

#[test]
fn submissions_on_current_ring_go_straight_to_hardware() {
    let sim = SimDevice::new(2);
    let ctrl = controller(&sim);

    ctrl.submit(0, 8).unwrap();
    ctrl.submit(0, 8).unwrap();
    assert_eq!(sim.gpu.writes_to(cp::CP_RB_WPTR), vec![8, 16]);
    assert_eq!(ctrl.state(), PreemptState::None);
    assert_eq!(ctrl.stats().triggers, 0);
    assert_edges_legal(&sim);
}

#[test]
fn higher_priority_submission_preempts_running_ring() {
    let sim = SimDevice::new(2);
    let ctrl = controller(&sim);

    ctrl.submit(1, 64).unwrap();
    assert!(complete_switch(&sim, &ctrl));
    assert_eq!(ctrl.cur_ring(), 1);

    // Ring 1 is still busy when ring 0 gets work.
    ctrl.submit(0, 4).unwrap();
    assert_eq!(ctrl.state(), PreemptState::Triggered);
    assert_eq!(ctrl.next_ring(), Some(0));

    assert!(complete_switch(&sim, &ctrl));
    assert_eq!(ctrl.cur_ring(), 0);

    // Once ring 0 drains, ring 1 resumes.
    drain_ring(&sim.rings[0]);
    ctrl.trigger(false);
    assert_eq!(ctrl.next_ring(), Some(1));
    assert!(complete_switch(&sim, &ctrl));
    assert_eq!(ctrl.cur_ring(), 1);
    assert_eq!(ctrl.stats().switches, 3);
    assert_edges_legal(&sim);
}

#[test]
fn three_rings_switch_in_priority_order() {
    let sim = SimDevice::new(3);
    let ctrl = controller(&sim);

    ctrl.submit(2, 4).unwrap();
    // Ring 1 gets work while the switch to ring 2 is in flight.
    ctrl.submit(1, 4).unwrap();
    assert_eq!(ctrl.next_ring(), Some(2));

    // The chained evaluation after the interrupt moves on to ring 1.
    assert!(complete_switch(&sim, &ctrl));
    assert_eq!(ctrl.cur_ring(), 2);
    assert_eq!(ctrl.state(), PreemptState::Triggered);
    assert_eq!(ctrl.next_ring(), Some(1));

    assert!(complete_switch(&sim, &ctrl));
    assert_eq!(ctrl.cur_ring(), 1);
    assert_eq!(ctrl.state(), PreemptState::None);

    // Ring 1's deferred write pointer was restored from its record, not re-written.
    assert!(!sim.rings[1].restore_wptr_pending());
    assert_eq!(ctrl.stats().switches, 2);
    assert_edges_legal(&sim);
}

#[test]
fn single_ring_device_never_preempts() {
    let sim = SimDevice::new(1);
    let ctrl = controller(&sim);

    assert!(!ctrl.preemption_enabled());
    assert!(ctrl.records().is_none());
    assert_eq!(sim.allocator.allocations(), 0);

    ctrl.submit(0, 4).unwrap();
    ctrl.on_interrupt();
    ctrl.on_watchdog_timeout();
    ctrl.tick();
    ctrl.trigger(true);

    let mut queue = SubmitQueue::new(1, 0);
    ctrl.queue_open(&mut queue).unwrap();
    assert!(queue.record().is_none());

    assert_eq!(ctrl.state(), PreemptState::None);
    assert_eq!(sim.gpu.writes_to(cp::CP_RB_WPTR), vec![4]);
    assert!(sim.telemetry.state_changes().is_empty());
    assert_eq!(sim.recovery.count(), 0);
}

#[test]
fn record_allocation_failure_collapses_to_one_ring() {
    // Three ring buffers and the scratch table: fail each in turn.
    for fail_at in 0..4 {
        let sim = SimDevice::new(3);
        sim.allocator.fail_at(fail_at);

        let ctrl = PreemptController::init(sim.device(), small_config()).unwrap();
        assert_eq!(ctrl.nr_rings(), 1, "fail_at={fail_at}");
        assert!(!ctrl.preemption_enabled());
        assert_eq!(sim.allocator.live(), 0, "leak with fail_at={fail_at}");

        // Only ring 0 exists from here on.
        assert!(ctrl.submit(2, 4).is_err());
        ctrl.submit(0, 4).unwrap();
        ctrl.hw_init();
        assert_eq!(ctrl.state(), PreemptState::None);
        assert!(sim.telemetry.state_changes().is_empty());
    }
}

#[test]
fn queue_open_close_round_trip() {
    let sim = SimDevice::new(2);
    let ctrl = controller(&sim);
    let baseline = sim.allocator.live();

    let mut queues: Vec<_> = (0..4).map(|id| SubmitQueue::new(id, id as usize % 2)).collect();
    for queue in &mut queues {
        ctrl.queue_open(queue).unwrap();
    }
    assert_eq!(sim.allocator.live(), baseline + 4);

    let iovas: Vec<u64> = queues.iter().map(|q| q.record().unwrap().iova()).collect();
    let mut unique = iovas.clone();
    unique.dedup();
    assert_eq!(unique.len(), iovas.len());

    for queue in &mut queues {
        ctrl.queue_close(queue);
    }
    assert_eq!(sim.allocator.live(), baseline);
}

#[test]
fn hw_init_after_recovery_restores_baseline() {
    let sim = SimDevice::new(2);
    let ctrl = controller(&sim);

    ctrl.submit(1, 4).unwrap();
    ctrl.on_interrupt(); // switch bit still set: stuck
    assert_eq!(ctrl.state(), PreemptState::Faulted);

    ctrl.hw_init();
    assert_eq!(ctrl.state(), PreemptState::None);
    assert_eq!(ctrl.cur_ring(), 0);
    assert_eq!(ctrl.watchdog_deadline_ns(), None);
    assert!(sim.telemetry.take().contains(&PreemptEvent::Reset {
        from: PreemptState::Faulted
    }));

    // The controller is usable again.
    sim.gpu.complete_switch();
    ctrl.submit(1, 4).unwrap();
    assert_eq!(ctrl.state(), PreemptState::Triggered);
    assert!(complete_switch(&sim, &ctrl));
    assert_eq!(ctrl.cur_ring(), 1);
}
