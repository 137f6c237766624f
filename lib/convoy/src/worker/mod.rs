// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The migration master worker.
//!
//! One worker instance exists per active migration. It waits until the
//! source controller reports an active migration for its model, locks down
//! the local fortress, and then drives the migration phase machine to a
//! terminal outcome, persisting every transition controller-side so a
//! restarted worker resumes exactly where its predecessor died.

use std::sync::Arc;

use convoy_types::Phase;
use futures::future::BoxFuture;
use slog::Logger;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::connect::ApiOpenFn;
use crate::facade::{Facade, FacadeError};
use crate::guard::{Guard, GuardError};
use crate::upload::{
    CharmDownloader, ToolsDownloader, UploadBinariesConfig, UploadError,
};

mod driver;
mod minions;

use driver::Driver;

/// Batch uploader for the binaries referenced by a serialized model.
/// [`crate::upload::upload_binaries`] is the canonical implementation.
pub type UploadBinariesFn = Box<
    dyn for<'a> Fn(
            UploadBinariesConfig<'a>,
        ) -> BoxFuture<'a, Result<(), UploadError>>
        + Send
        + Sync,
>;

/// Capabilities a worker is built from. Every field is required; the type
/// system stands in for the nil checks the worker would otherwise perform
/// before starting.
pub struct Config {
    /// The source controller's migration facade.
    pub facade: Arc<dyn Facade>,

    /// The fortress over local mutating work.
    pub guard: Arc<dyn Guard>,

    /// Dialer for the target controller.
    pub api_open: ApiOpenFn,

    /// Batch uploader for charm and tools binaries.
    pub upload_binaries: UploadBinariesFn,

    /// Source-side charm fetcher.
    pub charm_downloader: Arc<dyn CharmDownloader>,

    /// Source-side tools fetcher.
    pub tools_downloader: Arc<dyn ToolsDownloader>,

    /// Time source for minion wait deadlines and progress ticks.
    pub clock: Arc<dyn Clock>,

    /// Base logger; the worker scopes it with model context once a
    /// migration is active.
    pub log: Logger,
}

/// Infrastructure failures that kill the worker. Anything here means the
/// worker could not keep driving the migration and expects its supervisor
/// to restart it.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MasterError {
    #[error("watching for migration: {0}")]
    Watch(#[source] FacadeError),

    #[error("retrieving migration status: {0}")]
    Status(#[source] FacadeError),

    #[error("failed to set phase: {0}")]
    SetPhase(#[source] FacadeError),

    #[error("fortress lockdown failed: {0}")]
    Lockdown(#[source] GuardError),

    #[error("fortress unlock failed: {0}")]
    Unlock(#[source] GuardError),

    #[error("watching minion reports: {0}")]
    WatchMinionReports(#[source] FacadeError),

    #[error("retrieving minion reports: {0}")]
    MinionReports(#[source] FacadeError),

    #[error(
        "unexpected migration id in minion reports, got {got}, \
         expected {expected}"
    )]
    ReportIdMismatch { got: String, expected: String },

    #[error(
        "minion reports phase ({got}) does not match migration phase \
         ({expected})"
    )]
    ReportPhaseMismatch { got: String, expected: Phase },

    #[error("unknown phase: {phase} [{index}]")]
    UnknownPhase { phase: Phase, index: i32 },
}

/// How a finished worker left things. The supervisor pattern-matches on
/// this instead of inspecting error identities.
#[derive(Clone, Debug, PartialEq)]
pub enum Exit {
    /// The model has migrated (DONE or REAPFAILED). Drop this worker and do
    /// not restart it; there is nothing left to drive.
    Uninstall,

    /// A non-success terminal phase was reached (e.g. ABORTDONE). Done for
    /// now: restart later and poll for a future migration attempt.
    Transient,

    /// The worker was killed.
    Dying,

    /// An infrastructure failure; restart and resume from the persisted
    /// phase.
    Fatal(MasterError),
}

enum WaitState {
    Running(tokio::task::JoinHandle<Exit>),
    Finished(Exit),
}

/// Handle to a running migration master.
///
/// `kill` and `wait` both take a shared reference, so the handle can sit
/// behind an `Arc` with one task killing and another waiting.
pub struct Worker {
    token: CancellationToken,
    state: tokio::sync::Mutex<WaitState>,
}

impl Worker {
    /// Starts a migration master driven by `config`.
    pub fn spawn(config: Config) -> Self {
        let token = CancellationToken::new();
        let driver = Driver::new(config, token.clone());
        let task = tokio::spawn(driver.run());
        Self {
            token,
            state: tokio::sync::Mutex::new(WaitState::Running(task)),
        }
    }

    /// Requests termination. Idempotent; safe to call from any task. The
    /// worker exits at its next suspension point without persisting any
    /// further phase.
    pub fn kill(&self) {
        self.token.cancel();
    }

    /// Blocks until the worker finishes and yields its exit disposition.
    /// Safe to call from any task, any number of times; every caller
    /// observes the same resolved exit.
    pub async fn wait(&self) -> Exit {
        let mut state = self.state.lock().await;
        let exit = match &mut *state {
            WaitState::Finished(exit) => return exit.clone(),
            WaitState::Running(task) => match task.await {
                Ok(exit) => exit,
                Err(err) if err.is_panic() => {
                    std::panic::resume_unwind(err.into_panic())
                }
                // The task is never aborted directly; a cancelled join can
                // only mean the runtime is shutting down around us.
                Err(_) => Exit::Dying,
            },
        };
        *state = WaitState::Finished(exit.clone());
        exit
    }
}
