// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The phase driver.
//!
//! Drives one migration to completion: reads the persisted phase, invokes
//! the handler for it, persists the phase the handler returns, and loops
//! until a terminal phase is reached. Handlers return the next phase even
//! on logical failure (IMPORT maps its errors to ABORT rather than
//! propagating them); an error out of a handler is fatal to the worker and
//! leaves restart to the supervisor.

use convoy_types::{MigrationStatus, Phase, SerializedModel};
use slog::{error, info, o, Logger};
use tokio_util::sync::CancellationToken;

use crate::connect::{ConnectError, ConnectInfo, Connection, DialOpts};
use crate::facade::FacadeError;
use crate::guard::GuardError;
use crate::upload::UploadBinariesConfig;

use super::minions::{MinionWait, MinionWaitError, WaitPolicy};
use super::{Config, Exit, MasterError};

pub(super) struct Driver {
    config: Config,
    token: CancellationToken,
    log: Logger,
}

impl Driver {
    pub(super) fn new(config: Config, token: CancellationToken) -> Self {
        let log = config.log.new(o!("worker" => "convoy"));
        Self { config, token, log }
    }

    pub(super) async fn run(mut self) -> Exit {
        let status = match self.wait_for_active_migration().await {
            Ok(status) => status,
            Err(exit) => return exit,
        };
        self.log = self.config.log.new(o!(
            "worker" => "convoy",
            "model_uuid" => status.model_uuid.to_string(),
            "attempt" => status.attempt
        ));

        // Nothing may mutate the local model while it is being shipped out.
        match self.config.guard.lockdown(&self.token).await {
            Ok(()) => {}
            Err(GuardError::Aborted) => return Exit::Dying,
            Err(err) => return Exit::Fatal(MasterError::Lockdown(err)),
        }

        self.drive(status).await
    }

    /// Blocks until the controller reports a live migration for this model.
    ///
    /// Statuses in a terminal phase are skipped (a fresh attempt will show
    /// up on a later tick), except that a model which has already migrated
    /// means this worker has nothing left to do at all.
    async fn wait_for_active_migration(
        &self,
    ) -> Result<MigrationStatus, Exit> {
        let mut watcher = self
            .config
            .facade
            .watch()
            .await
            .map_err(|e| Exit::Fatal(MasterError::Watch(e)))?;

        loop {
            tokio::select! {
                // A kill must win over pending watch events.
                biased;
                _ = self.token.cancelled() => return Err(Exit::Dying),
                changed = watcher.changed() => {
                    if changed.is_err() {
                        return Err(Exit::Fatal(MasterError::Watch(
                            FacadeError::WatcherClosed,
                        )));
                    }
                }
            }

            let status = match self.config.facade.migration_status().await {
                Ok(status) => status,
                Err(err) if err.is_not_found() => {
                    // No migration active. A previous attempt may have left
                    // the fortress locked; let local writers resume until a
                    // new attempt shows up.
                    self.config
                        .guard
                        .unlock()
                        .await
                        .map_err(|e| Exit::Fatal(MasterError::Unlock(e)))?;
                    continue;
                }
                Err(err) => return Err(Exit::Fatal(MasterError::Status(err))),
            };

            if status.phase.model_has_migrated() {
                // The migration completed elsewhere.
                return Err(Exit::Uninstall);
            }
            if !status.phase.is_terminal() {
                return Ok(status);
            }
        }
    }

    async fn drive(&self, mut status: MigrationStatus) -> Exit {
        let mut phase = status.phase;
        loop {
            let next = match self.step(phase, &status).await {
                Ok(next) => next,
                Err(exit) => return exit,
            };

            if self.token.is_cancelled() {
                return Exit::Dying;
            }

            info!(self.log, "setting migration phase to {}", next);
            if let Err(err) = self.config.facade.set_phase(next).await {
                return Exit::Fatal(MasterError::SetPhase(err));
            }
            status.phase = next;

            if next.model_has_migrated() {
                return Exit::Uninstall;
            }
            if next.is_terminal() {
                // Some other terminal phase; done for now. Restart and poll
                // for a future attempt.
                return Exit::Transient;
            }
            phase = next;
        }
    }

    async fn step(
        &self,
        phase: Phase,
        status: &MigrationStatus,
    ) -> Result<Phase, Exit> {
        match phase {
            Phase::Quiesce => self.quiesce().await,
            Phase::ReadOnly => self.read_only().await,
            Phase::Precheck => self.precheck().await,
            Phase::Import => self.import(status).await,
            Phase::Validation => self.validation(status).await,
            Phase::Success => self.success(status).await,
            Phase::LogTransfer => self.log_transfer().await,
            Phase::Reap => self.reap().await,
            Phase::Abort => self.abort(status).await,
            Phase::ReapFailed | Phase::Done | Phase::AbortDone => {
                Err(Exit::Fatal(MasterError::UnknownPhase {
                    phase,
                    index: phase as i32,
                }))
            }
        }
    }

    async fn quiesce(&self) -> Result<Phase, Exit> {
        // TODO: wait for minion acknowledgement once agents report QUIESCE.
        Ok(Phase::ReadOnly)
    }

    async fn read_only(&self) -> Result<Phase, Exit> {
        // Pass-through; kept so pre-flight checks can slot in without
        // perturbing phase order.
        Ok(Phase::Precheck)
    }

    async fn precheck(&self) -> Result<Phase, Exit> {
        // Pass-through, as above.
        Ok(Phase::Import)
    }

    async fn import(
        &self,
        status: &MigrationStatus,
    ) -> Result<Phase, Exit> {
        info!(self.log, "exporting model");
        let serialized = match self.config.facade.export().await {
            Ok(serialized) => serialized,
            Err(err) => {
                error!(self.log, "model export failed: {}", err);
                return Ok(Phase::Abort);
            }
        };

        info!(self.log, "opening API connection to target controller");
        let conn = match self.open_target_conn(status).await {
            Ok(conn) => conn,
            Err(err) => {
                error!(
                    self.log,
                    "failed to connect to target controller: {}", err
                );
                return Ok(Phase::Abort);
            }
        };

        info!(self.log, "importing model into target controller");
        if let Err(err) = conn.import_model(&serialized.bytes).await {
            error!(
                self.log,
                "failed to import model into target controller: {}", err
            );
            return Ok(Phase::Abort);
        }

        info!(self.log, "opening API connection for target model");
        let model_conn = match self.open_target_model_conn(status).await {
            Ok(conn) => conn,
            Err(err) => {
                error!(
                    self.log,
                    "failed to open connection to target model: {}", err
                );
                return Ok(Phase::Abort);
            }
        };

        info!(self.log, "uploading binaries into target model");
        if let Err(err) =
            self.upload_binaries(&serialized, model_conn.as_ref()).await
        {
            error!(self.log, "failed migrating binaries: {}", err);
            return Ok(Phase::Abort);
        }

        Ok(Phase::Validation)
    }

    async fn upload_binaries(
        &self,
        serialized: &SerializedModel,
        model_conn: &dyn Connection,
    ) -> Result<(), crate::upload::UploadError> {
        (self.config.upload_binaries)(UploadBinariesConfig {
            charms: &serialized.charms,
            charm_downloader: self.config.charm_downloader.as_ref(),
            charm_uploader: model_conn,
            tools: &serialized.tools,
            tools_downloader: self.config.tools_downloader.as_ref(),
            tools_uploader: model_conn,
        })
        .await
    }

    async fn validation(
        &self,
        status: &MigrationStatus,
    ) -> Result<Phase, Exit> {
        // TODO: gate activation on minion acknowledgement (FailFast) once
        // agents report VALIDATION.
        if let Err(err) = self.activate_model(status).await {
            error!(self.log, "failed to activate imported model: {}", err);
            return Ok(Phase::Abort);
        }
        Ok(Phase::Success)
    }

    async fn activate_model(
        &self,
        status: &MigrationStatus,
    ) -> Result<(), ConnectError> {
        let conn = self.open_target_conn(status).await?;
        conn.activate_model(status.model_uuid).await
    }

    async fn success(
        &self,
        status: &MigrationStatus,
    ) -> Result<Phase, Exit> {
        match self.wait_for_minions(status, WaitPolicy::WaitForAll).await {
            Ok(())
            | Err(MinionWaitError::Timeout)
            | Err(MinionWaitError::Failed) => {
                // There is no turning back from SUCCESS; any problem should
                // have surfaced in VALIDATION. The migration can only move
                // on to LOGTRANSFER.
                Ok(Phase::LogTransfer)
            }
            Err(MinionWaitError::Shutdown) => Err(Exit::Dying),
            Err(MinionWaitError::Fatal(err)) => Err(Exit::Fatal(err)),
        }
    }

    async fn wait_for_minions(
        &self,
        status: &MigrationStatus,
        policy: WaitPolicy,
    ) -> Result<(), MinionWaitError> {
        MinionWait {
            facade: self.config.facade.as_ref(),
            clock: self.config.clock.as_ref(),
            token: &self.token,
            log: &self.log,
        }
        .wait(status, policy)
        .await
    }

    async fn log_transfer(&self) -> Result<Phase, Exit> {
        // The retained log stream is shipped by its own subsystem; only the
        // phase is sequenced here.
        Ok(Phase::Reap)
    }

    async fn reap(&self) -> Result<Phase, Exit> {
        info!(self.log, "removing model from source controller");
        if let Err(err) = self.config.facade.reap().await {
            // The migration itself has succeeded; only the source is stuck
            // with state it cannot delete.
            error!(self.log, "model reap failed: {}", err);
            return Ok(Phase::ReapFailed);
        }
        Ok(Phase::Done)
    }

    async fn abort(&self, status: &MigrationStatus) -> Result<Phase, Exit> {
        if let Err(err) = self.remove_imported_model(status).await {
            // Best effort only; the source retains authoritative state.
            error!(self.log, "failed to reverse model import: {}", err);
        }
        Ok(Phase::AbortDone)
    }

    async fn remove_imported_model(
        &self,
        status: &MigrationStatus,
    ) -> Result<(), ConnectError> {
        let conn = self.open_target_conn(status).await?;
        conn.abort_model(status.model_uuid).await
    }

    async fn open_target_conn(
        &self,
        status: &MigrationStatus,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        self.dial(ConnectInfo::for_cluster(&status.target_info)).await
    }

    async fn open_target_model_conn(
        &self,
        status: &MigrationStatus,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        self.dial(ConnectInfo::for_model(
            &status.target_info,
            status.model_uuid,
        ))
        .await
    }

    async fn dial(
        &self,
        info: ConnectInfo,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        // Dial with no retry budget: the worker must stay responsive to
        // kill requests, so it cannot sit inside transport retries.
        (self.config.api_open)(info, DialOpts::default()).await
    }
}
