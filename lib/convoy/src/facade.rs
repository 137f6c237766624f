// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capability surface the worker needs from the source controller.
//!
//! The worker never talks to the controller directly; everything goes
//! through a [`Facade`]. The crate ships one real realization
//! ([`crate::client::ApiFacade`]) and tests supply deterministic doubles.

use async_trait::async_trait;
use convoy_types::{MigrationStatus, MinionReports, Phase, SerializedModel};
use thiserror::Error;

/// Delivers a notification whenever the watched entity changes.
///
/// A watcher signals as soon as there is something to observe, and again on
/// every subsequent change, so a fresh subscriber never races a quiescent
/// channel. If the sender side goes away the subscription is dead and the
/// worker treats it as an infrastructure failure.
pub type NotifyWatcher = tokio::sync::watch::Receiver<()>;

/// Errors surfaced by facade calls.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FacadeError {
    /// No migration is currently active for the model.
    #[error("migration not found")]
    NotFound,

    /// A watch subscription's sender side went away.
    #[error("watcher closed")]
    WatcherClosed,

    /// Any other failure to complete the call.
    #[error("{0}")]
    Call(String),
}

impl FacadeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FacadeError::NotFound)
    }
}

/// Source-controller functionality used by the migration master.
#[async_trait]
pub trait Facade: Send + Sync {
    /// Returns a watcher which notifies when a migration is active for the
    /// model associated with the connection.
    async fn watch(&self) -> Result<NotifyWatcher, FacadeError>;

    /// Returns the details and progress of the latest model migration.
    /// [`FacadeError::NotFound`] means no migration currently exists.
    async fn migration_status(&self) -> Result<MigrationStatus, FacadeError>;

    /// Persists a phase transition for the currently active migration.
    async fn set_phase(&self, phase: Phase) -> Result<(), FacadeError>;

    /// Returns a serialized representation of the model.
    async fn export(&self) -> Result<SerializedModel, FacadeError>;

    /// Removes all source-side documents of the model.
    async fn reap(&self) -> Result<(), FacadeError>;

    /// Returns a watcher which notifies when a minion has made a report for
    /// the current migration phase.
    async fn watch_minion_reports(&self) -> Result<NotifyWatcher, FacadeError>;

    /// Returns the aggregate of minion reports for the current phase.
    async fn minion_reports(&self) -> Result<MinionReports, FacadeError>;
}
