// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types describing a model migration.
//!
//! These are shared by the migration master worker, the facade client that
//! talks to the source controller, and any server-side realization, so that
//! all of them agree on the phase machine and on what a migration status
//! looks like without any layering oddities.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A phase of the model migration state machine.
///
/// Phases are totally ordered and each phase knows the set of phases it may
/// legally move to next; see [`Phase::successors`]. The last three variants
/// are terminal.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Phase {
    /// Local agents are asked to stop initiating new work.
    Quiesce,
    /// The local model refuses writes.
    ReadOnly,
    /// Target-side readiness is verified before anything is shipped.
    Precheck,
    /// Model state is serialized, shipped, and installed on the target.
    Import,
    /// Minions confirm health of the imported model; the target model is
    /// activated.
    Validation,
    /// The point of no return; source minions are given a chance to report.
    Success,
    /// The retained log stream is shipped to the target.
    LogTransfer,
    /// Source-side model state is deleted.
    Reap,
    /// Reaping failed; the migration itself still succeeded.
    ReapFailed,
    /// The migration completed and the source was cleaned up.
    Done,
    /// Best-effort undo of whatever made it to the target.
    Abort,
    /// The undo finished (or was abandoned).
    AbortDone,
}

impl Phase {
    /// True if the migration can make no further progress from this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::ReapFailed | Phase::Done | Phase::AbortDone)
    }

    /// True if the model now lives on the target controller. `ReapFailed`
    /// counts: the source is merely stuck, the migration itself succeeded.
    pub fn model_has_migrated(&self) -> bool {
        matches!(self, Phase::Done | Phase::ReapFailed)
    }

    /// The phases this phase may legally move to.
    pub fn successors(&self) -> &'static [Phase] {
        match self {
            Phase::Quiesce => &[Phase::ReadOnly, Phase::Abort],
            Phase::ReadOnly => &[Phase::Precheck, Phase::Abort],
            Phase::Precheck => &[Phase::Import, Phase::Abort],
            Phase::Import => &[Phase::Validation, Phase::Abort],
            Phase::Validation => &[Phase::Success, Phase::Abort],
            // There is no way back once the target has been told the
            // migration succeeded.
            Phase::Success => &[Phase::LogTransfer],
            Phase::LogTransfer => &[Phase::Reap],
            Phase::Reap => &[Phase::Done, Phase::ReapFailed],
            Phase::Abort => &[Phase::AbortDone],
            Phase::ReapFailed | Phase::Done | Phase::AbortDone => &[],
        }
    }

    /// True if moving from this phase to `next` is a legal transition.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Quiesce => "QUIESCE",
            Phase::ReadOnly => "READONLY",
            Phase::Precheck => "PRECHECK",
            Phase::Import => "IMPORT",
            Phase::Validation => "VALIDATION",
            Phase::Success => "SUCCESS",
            Phase::LogTransfer => "LOGTRANSFER",
            Phase::Reap => "REAP",
            Phase::ReapFailed => "REAPFAILED",
            Phase::Done => "DONE",
            Phase::Abort => "ABORT",
            Phase::AbortDone => "ABORTDONE",
        };
        f.write_str(name)
    }
}

/// Error raised when decoding a phase name off the wire.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("unrecognized migration phase {0:?}")]
pub struct ParsePhaseError(pub String);

impl FromStr for Phase {
    type Err = ParsePhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUIESCE" => Ok(Phase::Quiesce),
            "READONLY" => Ok(Phase::ReadOnly),
            "PRECHECK" => Ok(Phase::Precheck),
            "IMPORT" => Ok(Phase::Import),
            "VALIDATION" => Ok(Phase::Validation),
            "SUCCESS" => Ok(Phase::Success),
            "LOGTRANSFER" => Ok(Phase::LogTransfer),
            "REAP" => Ok(Phase::Reap),
            "REAPFAILED" => Ok(Phase::ReapFailed),
            "DONE" => Ok(Phase::Done),
            "ABORT" => Ok(Phase::Abort),
            "ABORTDONE" => Ok(Phase::AbortDone),
            _ => Err(ParsePhaseError(s.to_owned())),
        }
    }
}

/// Everything needed to dial and authenticate against the target controller.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TargetInfo {
    /// Controller addresses in `host:port` form, in preference order.
    pub addrs: Vec<String>,

    /// CA certificate (PEM) the target's TLS certificates chain to.
    pub ca_cert: String,

    /// The tag of the entity to authenticate as.
    pub auth_tag: String,

    /// Password for `auth_tag`.
    pub password: String,
}

/// Error raised when a [`TargetInfo`] is not usable for dialing.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TargetInfoError {
    #[error("empty target controller address list")]
    NoAddrs,

    #[error("empty target CA certificate")]
    NoCaCert,

    #[error("empty target auth tag")]
    NoAuthTag,
}

impl TargetInfo {
    /// Checks that the info identifies and authenticates a dialable target.
    pub fn validate(&self) -> Result<(), TargetInfoError> {
        if self.addrs.is_empty() {
            return Err(TargetInfoError::NoAddrs);
        }
        if self.ca_cert.is_empty() {
            return Err(TargetInfoError::NoCaCert);
        }
        if self.auth_tag.is_empty() {
            return Err(TargetInfoError::NoAuthTag);
        }
        Ok(())
    }
}

/// Snapshot of the active migration attempt as recorded by the source
/// controller.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MigrationStatus {
    /// The model being migrated.
    pub model_uuid: Uuid,

    /// Distinguishes successive migrations of the same model. Incremented by
    /// the controller each time a new migration is started.
    pub attempt: u64,

    /// The phase the migration currently sits in.
    pub phase: Phase,

    /// The wall-clock instant at which the controller last recorded a phase
    /// transition. Minion wait deadlines are measured from here, not from
    /// when a worker happened to start waiting.
    pub phase_changed_time: SystemTime,

    /// How to reach the destination controller.
    pub target_info: TargetInfo,
}

impl MigrationStatus {
    /// The identifier minions use to tag their reports.
    ///
    /// The controller does not yet return the migration id in the status
    /// response, so it is derived here from the model and the attempt.
    pub fn migration_id(&self) -> String {
        format!("{}:{}", self.model_uuid, self.attempt)
    }
}

/// Aggregate of what source-side minions have reported for the current phase
/// of the current migration attempt.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct MinionReports {
    /// The migration the reports are for. Reports tagged with any other id
    /// must be rejected by consumers.
    pub migration_id: String,

    /// The phase the reports are for.
    pub phase: Option<Phase>,

    /// Number of minions that reported success.
    pub success_count: usize,

    /// Number of minions that have not reported at all.
    pub unknown_count: usize,

    /// Machine agents that reported failure.
    pub failed_machines: Vec<String>,

    /// Unit agents that reported failure.
    pub failed_units: Vec<String>,

    /// A bounded sample of machine agents that have not reported.
    pub some_unknown_machines: Vec<String>,

    /// A bounded sample of unit agents that have not reported.
    pub some_unknown_units: Vec<String>,
}

impl MinionReports {
    /// True if no reports have arrived yet.
    pub fn is_zero(&self) -> bool {
        self.migration_id.is_empty() && self.phase.is_none()
    }

    /// Total number of agents that reported failure.
    pub fn failure_count(&self) -> usize {
        self.failed_machines.len() + self.failed_units.len()
    }
}

/// Reference to a tools (agent binary) version used by the model.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ToolsRef {
    /// Version string, e.g. `"2.9.1-ubuntu-amd64"`.
    pub version: String,

    /// Source-relative URI the binary can be fetched from.
    pub uri: String,
}

/// The serialized representation of a model, as produced by the source
/// controller's export and consumed by the target's import.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SerializedModel {
    /// The opaque model description blob.
    pub bytes: Vec<u8>,

    /// Charm artifacts referenced by the model, by identifier.
    pub charms: Vec<String>,

    /// Tools versions referenced by the model.
    pub tools: Vec<ToolsRef>,
}
