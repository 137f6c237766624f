// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting on minion acknowledgement for a migration phase.
//!
//! Minions post per-phase reports to the source controller; the coordinator
//! here watches the aggregate and resolves to success, failure, or timeout.
//! The wait deadline is measured from the controller-recorded phase change
//! time, so a worker that restarts mid-phase does not grant the minions a
//! fresh allowance.

use std::time::Duration;

use convoy_types::{MigrationStatus, MinionReports};
use slog::{error, info, Logger};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::facade::{Facade, FacadeError};

use super::MasterError;

/// The longest the coordinator will wait for minions to report back for a
/// given migration phase, measured from the phase change.
pub(crate) const MAX_MINION_WAIT: Duration = Duration::from_secs(15 * 60);

/// Time between progress updates while waiting for minion reports.
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// How a minion wait treats failure reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WaitPolicy {
    /// Stop waiting at the first failure report. For phases that must abort
    /// as soon as any minion objects (VALIDATION, once minion
    /// acknowledgement gates it).
    FailFast,

    /// Wait for every minion to report (or for the deadline), then fail if
    /// any of them failed.
    WaitForAll,
}

#[derive(Debug, Error, PartialEq)]
pub(crate) enum MinionWaitError {
    #[error("timed out waiting for all minions to report")]
    Timeout,

    #[error("one or more minions failed a migration phase")]
    Failed,

    /// The worker was killed while waiting.
    #[error("worker is shutting down")]
    Shutdown,

    #[error(transparent)]
    Fatal(#[from] MasterError),
}

/// One minion wait, borrowed from the worker that runs it.
pub(crate) struct MinionWait<'a> {
    pub facade: &'a dyn Facade,
    pub clock: &'a dyn Clock,
    pub token: &'a CancellationToken,
    pub log: &'a Logger,
}

impl MinionWait<'_> {
    pub(crate) async fn wait(
        &self,
        status: &MigrationStatus,
        policy: WaitPolicy,
    ) -> Result<(), MinionWaitError> {
        // Anchor the deadline at the authoritative phase change instant,
        // not at whenever this worker entered the wait.
        let elapsed = self
            .clock
            .now()
            .duration_since(status.phase_changed_time)
            .unwrap_or_default();
        let max_wait = MAX_MINION_WAIT.saturating_sub(elapsed);
        info!(
            self.log,
            "waiting for minions to report back for migration phase {} \
             (will wait up to {}s)",
            status.phase,
            max_wait.as_secs()
        );

        let mut watcher =
            self.facade.watch_minion_reports().await.map_err(|e| {
                MinionWaitError::Fatal(MasterError::WatchMinionReports(e))
            })?;

        let mut deadline = self.clock.sleep(max_wait);
        let mut progress = self.clock.sleep(WAIT_LOG_INTERVAL);
        let mut reports = MinionReports::default();

        // One event per iteration: shutdown, deadline, a change to the
        // report aggregate, or the progress tick. The report watcher
        // coalesces rapid changes, so the aggregate is re-fetched in full on
        // every signal rather than trusting anything cached.
        loop {
            tokio::select! {
                // A kill must win over anything else that is ready.
                biased;
                _ = self.token.cancelled() => {
                    return Err(MinionWaitError::Shutdown);
                }

                _ = &mut deadline => {
                    error!(
                        self.log,
                        "{}",
                        format_minion_timeout(&reports, status)
                    );
                    return Err(MinionWaitError::Timeout);
                }

                changed = watcher.changed() => {
                    if changed.is_err() {
                        return Err(MinionWaitError::Fatal(
                            MasterError::WatchMinionReports(
                                FacadeError::WatcherClosed,
                            ),
                        ));
                    }
                    reports =
                        self.facade.minion_reports().await.map_err(|e| {
                            MinionWaitError::Fatal(
                                MasterError::MinionReports(e),
                            )
                        })?;
                    validate_minion_reports(&reports, status)?;

                    let failures = reports.failure_count();
                    if failures > 0 {
                        error!(
                            self.log,
                            "{}",
                            format_minion_failure(&reports, status)
                        );
                        if policy == WaitPolicy::FailFast {
                            return Err(MinionWaitError::Failed);
                        }
                    }
                    if reports.unknown_count == 0 {
                        info!(
                            self.log,
                            "{}",
                            format_minion_wait_done(&reports, status)
                        );
                        if failures > 0 {
                            return Err(MinionWaitError::Failed);
                        }
                        return Ok(());
                    }
                }

                _ = &mut progress => {
                    info!(
                        self.log,
                        "{}",
                        format_minion_wait_update(&reports, status)
                    );
                    progress = self.clock.sleep(WAIT_LOG_INTERVAL);
                }
            }
        }
    }
}

/// Rejects any report aggregate that is not about the current phase of the
/// current migration attempt.
fn validate_minion_reports(
    reports: &MinionReports,
    status: &MigrationStatus,
) -> Result<(), MinionWaitError> {
    let expected = status.migration_id();
    if reports.migration_id != expected {
        return Err(MinionWaitError::Fatal(MasterError::ReportIdMismatch {
            got: reports.migration_id.clone(),
            expected,
        }));
    }
    if reports.phase != Some(status.phase) {
        return Err(MinionWaitError::Fatal(
            MasterError::ReportPhaseMismatch {
                got: reports
                    .phase
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "none".to_owned()),
                expected: status.phase,
            },
        ));
    }
    Ok(())
}

fn format_minion_timeout(
    reports: &MinionReports,
    status: &MigrationStatus,
) -> String {
    if reports.is_zero() {
        return format!(
            "no agents reported in time for migration phase {}",
            status.phase
        );
    }
    let mut msg = format!(
        "{} agents failed to report in time for migration phase {}",
        reports.unknown_count, status.phase
    );
    if !reports.some_unknown_machines.is_empty() {
        msg.push_str(&format!(
            ", including machines: {}",
            reports.some_unknown_machines.join(", ")
        ));
    }
    if !reports.some_unknown_units.is_empty() {
        msg.push_str(&format!(
            ", including units: {}",
            reports.some_unknown_units.join(", ")
        ));
    }
    msg
}

fn format_minion_failure(
    reports: &MinionReports,
    status: &MigrationStatus,
) -> String {
    let mut msg = format!("some agents failed {}: ", status.phase);
    if !reports.failed_machines.is_empty() {
        msg.push_str(&format!(
            "failed machines: {}; ",
            reports.failed_machines.join(", ")
        ));
    }
    if !reports.failed_units.is_empty() {
        msg.push_str(&format!(
            "failed units: {}",
            reports.failed_units.join(", ")
        ));
    }
    msg
}

fn format_minion_wait_update(
    reports: &MinionReports,
    status: &MigrationStatus,
) -> String {
    if reports.is_zero() {
        return format!("no reports from minions yet for {}", status.phase);
    }
    let mut msg = format!(
        "waiting for minions to report for {}: {} succeeded, {} still to \
         report",
        status.phase, reports.success_count, reports.unknown_count
    );
    let failed = reports.failure_count();
    if failed > 0 {
        msg.push_str(&format!(", {} failed", failed));
    }
    msg
}

fn format_minion_wait_done(
    reports: &MinionReports,
    status: &MigrationStatus,
) -> String {
    format!(
        "completed waiting for minions to report for {}: {} succeeded, {} \
         failed",
        status.phase,
        reports.success_count,
        reports.failure_count()
    )
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::SystemTime;

    use convoy_types::Phase;

    use crate::testing::{test_logger, FakeClock, StubFacade};

    fn success_status(phase_changed_time: SystemTime) -> MigrationStatus {
        let mut status = crate::testing::active_status(Phase::Success);
        status.phase_changed_time = phase_changed_time;
        status
    }

    fn reports_for(
        status: &MigrationStatus,
        unknown: usize,
        failed_machines: &[&str],
    ) -> MinionReports {
        MinionReports {
            migration_id: status.migration_id(),
            phase: Some(status.phase),
            success_count: 3,
            unknown_count: unknown,
            failed_machines: failed_machines
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..Default::default()
        }
    }

    async fn run_wait(
        facade: &StubFacade,
        clock: &FakeClock,
        status: &MigrationStatus,
        policy: WaitPolicy,
    ) -> Result<(), MinionWaitError> {
        let token = CancellationToken::new();
        let log = test_logger();
        let wait = MinionWait {
            facade,
            clock,
            token: &token,
            log: &log,
        };
        wait.wait(status, policy).await
    }

    #[tokio::test]
    async fn resolves_once_all_minions_report() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let clock = FakeClock::new(now);
        let status = success_status(now);
        let facade = StubFacade::default();
        facade.queue_reports(reports_for(&status, 2, &[]));
        facade.queue_reports(reports_for(&status, 0, &[]));

        run_wait(&facade, &clock, &status, WaitPolicy::WaitForAll)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_all_reports_failure_only_at_the_end() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let clock = FakeClock::new(now);
        let status = success_status(now);
        let facade = StubFacade::default();
        // A failure arrives while another minion is still unknown; the
        // wait keeps going until nobody is unknown.
        facade.queue_reports(reports_for(&status, 1, &["3"]));
        facade.queue_reports(reports_for(&status, 0, &["3"]));

        let err = run_wait(&facade, &clock, &status, WaitPolicy::WaitForAll)
            .await
            .unwrap_err();
        assert_eq!(err, MinionWaitError::Failed);
        assert_eq!(facade.reports_fetched(), 2);
    }

    #[tokio::test]
    async fn fail_fast_stops_at_first_failure() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let clock = FakeClock::new(now);
        let status = success_status(now);
        let facade = StubFacade::default();
        facade.queue_reports(reports_for(&status, 5, &["3"]));

        let err = run_wait(&facade, &clock, &status, WaitPolicy::FailFast)
            .await
            .unwrap_err();
        assert_eq!(err, MinionWaitError::Failed);
        assert_eq!(facade.reports_fetched(), 1);
    }

    #[tokio::test]
    async fn deadline_is_anchored_to_the_phase_change() {
        let phase_changed = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        // The worker starts waiting 14m59s after the phase changed, so only
        // one second of allowance remains.
        let now = phase_changed + (MAX_MINION_WAIT - Duration::from_secs(1));
        let clock =
            FakeClock::new(now).with_fire_threshold(Duration::from_secs(1));
        let status = success_status(phase_changed);
        let facade = StubFacade::default();

        let err = run_wait(&facade, &clock, &status, WaitPolicy::WaitForAll)
            .await
            .unwrap_err();
        assert_eq!(err, MinionWaitError::Timeout);
        assert_eq!(clock.sleeps()[0], Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stale_deadline_fires_immediately() {
        let phase_changed = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let now = phase_changed + MAX_MINION_WAIT + Duration::from_secs(30);
        let clock = FakeClock::new(now);
        let status = success_status(phase_changed);
        let facade = StubFacade::default();

        let err = run_wait(&facade, &clock, &status, WaitPolicy::WaitForAll)
            .await
            .unwrap_err();
        assert_eq!(err, MinionWaitError::Timeout);
        assert_eq!(clock.sleeps()[0], Duration::ZERO);
    }

    #[tokio::test]
    async fn rejects_reports_for_another_migration() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let clock = FakeClock::new(now);
        let status = success_status(now);
        let facade = StubFacade::default();
        let mut reports = reports_for(&status, 0, &[]);
        reports.migration_id = "someone-else:9".to_owned();
        facade.queue_reports(reports);

        let err = run_wait(&facade, &clock, &status, WaitPolicy::WaitForAll)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MinionWaitError::Fatal(MasterError::ReportIdMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_reports_for_another_phase() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let clock = FakeClock::new(now);
        let status = success_status(now);
        let facade = StubFacade::default();
        let mut reports = reports_for(&status, 0, &[]);
        reports.phase = Some(Phase::Quiesce);
        facade.queue_reports(reports);

        let err = run_wait(&facade, &clock, &status, WaitPolicy::WaitForAll)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MinionWaitError::Fatal(MasterError::ReportPhaseMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_wins_over_pending_reports() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let clock = FakeClock::new(now);
        let status = success_status(now);
        let facade = StubFacade::default();

        let token = CancellationToken::new();
        token.cancel();
        let log = test_logger();
        let wait = MinionWait {
            facade: &facade,
            clock: &clock,
            token: &token,
            log: &log,
        };
        let err = wait
            .wait(&status, WaitPolicy::WaitForAll)
            .await
            .unwrap_err();
        assert_eq!(err, MinionWaitError::Shutdown);
    }

    #[test]
    fn timeout_diagnostic_names_silent_agents() {
        let status = crate::testing::active_status(Phase::Success);
        assert_eq!(
            format_minion_timeout(&MinionReports::default(), &status),
            "no agents reported in time for migration phase SUCCESS"
        );

        let reports = MinionReports {
            migration_id: status.migration_id(),
            phase: Some(Phase::Success),
            unknown_count: 3,
            some_unknown_machines: vec!["3".to_owned(), "4".to_owned()],
            some_unknown_units: vec!["app/2".to_owned()],
            ..Default::default()
        };
        assert_eq!(
            format_minion_timeout(&reports, &status),
            "3 agents failed to report in time for migration phase SUCCESS, \
             including machines: 3, 4, including units: app/2"
        );
    }

    #[test]
    fn failure_diagnostic_names_failed_agents() {
        let status = crate::testing::active_status(Phase::Success);
        let reports = MinionReports {
            migration_id: status.migration_id(),
            phase: Some(Phase::Success),
            failed_machines: vec!["1".to_owned(), "2".to_owned()],
            failed_units: vec!["db/0".to_owned()],
            ..Default::default()
        };
        assert_eq!(
            format_minion_failure(&reports, &status),
            "some agents failed SUCCESS: failed machines: 1, 2; \
             failed units: db/0"
        );
    }

    #[test]
    fn progress_line_counts_stragglers() {
        let status = crate::testing::active_status(Phase::Success);
        assert_eq!(
            format_minion_wait_update(&MinionReports::default(), &status),
            "no reports from minions yet for SUCCESS"
        );

        let reports = MinionReports {
            migration_id: status.migration_id(),
            phase: Some(Phase::Success),
            success_count: 4,
            unknown_count: 2,
            failed_units: vec!["db/0".to_owned()],
            ..Default::default()
        };
        assert_eq!(
            format_minion_wait_update(&reports, &status),
            "waiting for minions to report for SUCCESS: 4 succeeded, \
             2 still to report, 1 failed"
        );
        assert_eq!(
            format_minion_wait_done(&reports, &status),
            "completed waiting for minions to report for SUCCESS: \
             4 succeeded, 1 failed"
        );
    }
}
