// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios for the migration master, driven entirely through
//! the public worker surface against scripted capabilities.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use convoy::testing::{
    active_status, passthrough_upload, test_logger, FakeClock, StubDownloader,
    StubFacade, StubGuard, TargetRecorder,
};
use convoy::{Config, Exit, MasterError, Worker};
use convoy_types::{MigrationStatus, MinionReports, Phase};

struct Scenario {
    facade: Arc<StubFacade>,
    guard: Arc<StubGuard>,
    target: Arc<TargetRecorder>,
    clock: Arc<FakeClock>,
}

impl Scenario {
    fn new() -> Self {
        Self::with_clock(FakeClock::new(SystemTime::now()))
    }

    fn with_clock(clock: FakeClock) -> Self {
        Self {
            facade: Arc::new(StubFacade::default()),
            guard: Arc::new(StubGuard::default()),
            target: Arc::new(TargetRecorder::default()),
            clock: Arc::new(clock),
        }
    }

    fn spawn(&self) -> Worker {
        Worker::spawn(Config {
            facade: self.facade.clone(),
            guard: self.guard.clone(),
            api_open: self.target.api_open(),
            upload_binaries: passthrough_upload(),
            charm_downloader: Arc::new(StubDownloader),
            tools_downloader: Arc::new(StubDownloader),
            clock: self.clock.clone(),
            log: test_logger(),
        })
    }

    /// Scripts minion reports that declare every agent successful for
    /// `status`'s phase.
    fn all_minions_succeed(&self, status: &MigrationStatus) {
        self.facade.queue_reports(MinionReports {
            migration_id: status.migration_id(),
            phase: Some(status.phase),
            success_count: 5,
            unknown_count: 0,
            ..Default::default()
        });
    }
}

#[tokio::test]
async fn happy_path_runs_quiesce_to_done() {
    let scenario = Scenario::new();
    let status = active_status(Phase::Quiesce);
    scenario.facade.queue_status(Ok(status.clone()));

    let mut success_status = status.clone();
    success_status.phase = Phase::Success;
    scenario.all_minions_succeed(&success_status);

    let worker = scenario.spawn();
    assert_eq!(worker.wait().await, Exit::Uninstall);

    assert_eq!(
        scenario.facade.phases_set(),
        vec![
            Phase::ReadOnly,
            Phase::Precheck,
            Phase::Import,
            Phase::Validation,
            Phase::Success,
            Phase::LogTransfer,
            Phase::Reap,
            Phase::Done,
        ]
    );
    assert_eq!(scenario.guard.lockdowns(), 1);
    assert_eq!(scenario.target.imports().len(), 1);
    assert_eq!(scenario.target.activated(), vec![status.model_uuid]);
    assert!(scenario.target.aborted().is_empty());
}

#[tokio::test]
async fn failed_export_aborts_the_migration() {
    let scenario = Scenario::new();
    let status = active_status(Phase::Quiesce);
    scenario.facade.queue_status(Ok(status.clone()));
    scenario.facade.set_export(Err(
        convoy::facade::FacadeError::Call("boom".to_owned()),
    ));

    let worker = scenario.spawn();
    assert_eq!(worker.wait().await, Exit::Transient);

    assert_eq!(
        scenario.facade.phases_set(),
        vec![
            Phase::ReadOnly,
            Phase::Precheck,
            Phase::Import,
            Phase::Abort,
            Phase::AbortDone,
        ]
    );
    // The abort was relayed to the target as a best effort.
    assert_eq!(scenario.target.aborted(), vec![status.model_uuid]);
}

#[tokio::test]
async fn minion_timeout_in_success_is_tolerated() {
    // The worker resumes a migration that has sat in SUCCESS for 14m59s,
    // so the minions get one more second before the deadline.
    let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
    let scenario = Scenario::with_clock(
        FakeClock::new(now).with_fire_threshold(Duration::from_secs(1)),
    );
    let mut status = active_status(Phase::Success);
    status.phase_changed_time = now - Duration::from_secs(15 * 60 - 1);
    scenario.facade.queue_status(Ok(status));

    let worker = scenario.spawn();
    assert_eq!(worker.wait().await, Exit::Uninstall);

    assert_eq!(
        scenario.facade.phases_set(),
        vec![Phase::LogTransfer, Phase::Reap, Phase::Done]
    );
    assert_eq!(scenario.clock.sleeps()[0], Duration::from_secs(1));
}

#[tokio::test]
async fn reap_failure_still_counts_as_migrated() {
    let scenario = Scenario::new();
    scenario.facade.queue_status(Ok(active_status(Phase::LogTransfer)));
    scenario.facade.set_reap(Err(convoy::facade::FacadeError::Call(
        "source documents busy".to_owned(),
    )));

    let worker = scenario.spawn();
    assert_eq!(worker.wait().await, Exit::Uninstall);

    assert_eq!(
        scenario.facade.phases_set(),
        vec![Phase::Reap, Phase::ReapFailed]
    );
}

#[tokio::test]
async fn externally_completed_migration_uninstalls_immediately() {
    let scenario = Scenario::new();
    scenario.facade.queue_status(Ok(active_status(Phase::Done)));

    let worker = scenario.spawn();
    assert_eq!(worker.wait().await, Exit::Uninstall);

    // No handler ran: nothing persisted, fortress untouched.
    assert!(scenario.facade.phases_set().is_empty());
    assert_eq!(scenario.guard.lockdowns(), 0);
}

#[tokio::test]
async fn kill_interrupts_a_blocked_lockdown() {
    let scenario = Scenario::new();
    scenario.facade.queue_status(Ok(active_status(Phase::Quiesce)));
    scenario.guard.hang_lockdown_until_cancelled();

    let worker = scenario.spawn();
    // Let the worker reach the fortress gate, then kill it.
    tokio::task::yield_now().await;
    worker.kill();
    assert_eq!(worker.wait().await, Exit::Dying);
    assert!(scenario.facade.phases_set().is_empty());
}

#[tokio::test]
async fn kill_and_wait_compose_across_tasks() {
    let scenario = Scenario::new();
    scenario.facade.queue_status(Ok(active_status(Phase::Quiesce)));
    scenario.guard.hang_lockdown_until_cancelled();

    // One task waits on the shared handle while another kills it.
    let worker = Arc::new(scenario.spawn());
    let waiter = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.wait().await })
    };
    tokio::task::yield_now().await;
    worker.kill();
    assert_eq!(waiter.await.unwrap(), Exit::Dying);

    // Later waits observe the same resolved exit.
    assert_eq!(worker.wait().await, Exit::Dying);
}

#[tokio::test]
async fn lockdown_failure_is_fatal() {
    let scenario = Scenario::new();
    scenario.facade.queue_status(Ok(active_status(Phase::Quiesce)));
    scenario.guard.fail_lockdown("writers refused to drain");

    let worker = scenario.spawn();
    match worker.wait().await {
        Exit::Fatal(MasterError::Lockdown(_)) => {}
        other => panic!("unexpected exit: {:?}", other),
    }
    assert!(scenario.facade.phases_set().is_empty());
}

#[tokio::test]
async fn set_phase_failure_is_fatal() {
    let scenario = Scenario::new();
    scenario.facade.queue_status(Ok(active_status(Phase::Quiesce)));
    scenario.facade.fail_set_phase("connection dropped");

    let worker = scenario.spawn();
    match worker.wait().await {
        Exit::Fatal(MasterError::SetPhase(_)) => {}
        other => panic!("unexpected exit: {:?}", other),
    }
}

#[tokio::test]
async fn resumed_worker_follows_the_same_trajectory() {
    // Run one migration straight through from IMPORT...
    let scenario = Scenario::new();
    let status = active_status(Phase::Import);
    scenario.facade.queue_status(Ok(status.clone()));
    let mut success_status = status.clone();
    success_status.phase = Phase::Success;
    scenario.all_minions_succeed(&success_status);
    let worker = scenario.spawn();
    assert_eq!(worker.wait().await, Exit::Uninstall);
    let live_trace = scenario.facade.phases_set();

    // ...then "crash" immediately after VALIDATION was persisted and let a
    // fresh worker pick it up. The combined trace must match.
    let resumed = Scenario::new();
    let mut resumed_status = status.clone();
    resumed_status.phase = Phase::Validation;
    resumed.facade.queue_status(Ok(resumed_status));
    resumed.all_minions_succeed(&success_status);
    let worker = resumed.spawn();
    assert_eq!(worker.wait().await, Exit::Uninstall);

    let mut combined = vec![Phase::Validation];
    combined.extend(resumed.facade.phases_set());
    assert_eq!(live_trace, combined);
}

#[tokio::test]
async fn every_persisted_trace_is_a_legal_phase_path() {
    // Drive a successful and an aborted migration and check each persisted
    // transition against the phase graph.
    for (export_fails, start) in
        [(false, Phase::Quiesce), (true, Phase::Quiesce)]
    {
        let scenario = Scenario::new();
        let status = active_status(start);
        scenario.facade.queue_status(Ok(status.clone()));
        if export_fails {
            scenario.facade.set_export(Err(
                convoy::facade::FacadeError::Call("boom".to_owned()),
            ));
        } else {
            let mut success_status = status.clone();
            success_status.phase = Phase::Success;
            scenario.all_minions_succeed(&success_status);
        }

        let worker = scenario.spawn();
        worker.wait().await;

        let mut prev = start;
        for next in scenario.facade.phases_set() {
            assert!(
                prev.can_transition_to(next),
                "illegal transition {} -> {}",
                prev,
                next
            );
            prev = next;
        }
        assert!(prev.is_terminal());
    }
}
