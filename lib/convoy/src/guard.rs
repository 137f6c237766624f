// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fortress: a two-state gate over mutating work in the local model.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum GuardError {
    /// The lockdown was cancelled before all writers drained.
    #[error("fortress lockdown aborted")]
    Aborted,

    #[error("{0}")]
    Gate(String),
}

/// A gate that admits or blocks mutating work against the local model.
///
/// Once `lockdown` returns successfully, no mutating operation may commence
/// until `unlock` is called.
#[async_trait]
pub trait Guard: Send + Sync {
    /// Blocks new mutating work and waits until no writers remain. Returns
    /// [`GuardError::Aborted`] if `cancel` fires before the gate is clear.
    async fn lockdown(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), GuardError>;

    /// Reopens the gate to mutating work.
    async fn unlock(&self) -> Result<(), GuardError>;
}
