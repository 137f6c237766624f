// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed facade client over an established source-controller connection.
//!
//! [`ApiFacade`] is the real realization of the [`Facade`] contract: a thin
//! adapter that issues named calls through an injected [`Caller`], decodes
//! the wire structs, and validates what comes back before the worker ever
//! sees it. Watch subscriptions are handed out by the transport as notify
//! channels.

use std::str::FromStr;
use std::time::SystemTime;

use async_trait::async_trait;
use convoy_types::{
    MigrationStatus, MinionReports, Phase, SerializedModel, TargetInfo,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::facade::{Facade, FacadeError, NotifyWatcher};

/// Transport capability the facade client needs: named request/response
/// calls plus registration on named watch streams.
#[async_trait]
pub trait Caller: Send + Sync {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, FacadeError>;

    async fn watch(&self, stream: &str) -> Result<NotifyWatcher, FacadeError>;
}

/// Facade methods served by the source controller.
const METHOD_STATUS: &str = "MigrationStatus";
const METHOD_SET_PHASE: &str = "SetPhase";
const METHOD_EXPORT: &str = "Export";
const METHOD_REAP: &str = "Reap";
const METHOD_MINION_REPORTS: &str = "MinionReports";

/// Watch streams served by the source controller.
const STREAM_MIGRATION: &str = "migration-status";
const STREAM_MINION_REPORTS: &str = "minion-reports";

#[derive(Debug, Deserialize)]
struct StatusResult {
    model_uuid: Uuid,
    attempt: u64,
    phase: String,
    phase_changed_time: SystemTime,
    target: TargetInfo,
}

#[derive(Debug, Deserialize)]
struct MinionReportsResult {
    migration_id: String,
    phase: String,
    success_count: usize,
    unknown_count: usize,
    failed_machines: Vec<String>,
    failed_units: Vec<String>,
    some_unknown_machines: Vec<String>,
    some_unknown_units: Vec<String>,
}

/// The real [`Facade`] realization.
pub struct ApiFacade<C> {
    caller: C,
}

impl<C: Caller> ApiFacade<C> {
    pub fn new(caller: C) -> Self {
        Self { caller }
    }

    fn decode<'a, T: Deserialize<'a>>(
        raw: serde_json::Value,
        what: &str,
    ) -> Result<T, FacadeError> {
        T::deserialize(raw)
            .map_err(|e| FacadeError::Call(format!("decoding {}: {}", what, e)))
    }

    fn decode_phase(raw: &str, what: &str) -> Result<Phase, FacadeError> {
        Phase::from_str(raw)
            .map_err(|e| FacadeError::Call(format!("decoding {}: {}", what, e)))
    }
}

#[async_trait]
impl<C: Caller> Facade for ApiFacade<C> {
    async fn watch(&self) -> Result<NotifyWatcher, FacadeError> {
        self.caller.watch(STREAM_MIGRATION).await
    }

    async fn migration_status(&self) -> Result<MigrationStatus, FacadeError> {
        let raw = self.caller.call(METHOD_STATUS, json!({})).await?;
        let wire: StatusResult = Self::decode(raw, "migration status")?;
        let phase = Self::decode_phase(&wire.phase, "migration status")?;
        wire.target.validate().map_err(|e| {
            FacadeError::Call(format!("migration status target: {}", e))
        })?;
        Ok(MigrationStatus {
            model_uuid: wire.model_uuid,
            attempt: wire.attempt,
            phase,
            phase_changed_time: wire.phase_changed_time,
            target_info: wire.target,
        })
    }

    async fn set_phase(&self, phase: Phase) -> Result<(), FacadeError> {
        self.caller
            .call(METHOD_SET_PHASE, json!({ "phase": phase.to_string() }))
            .await?;
        Ok(())
    }

    async fn export(&self) -> Result<SerializedModel, FacadeError> {
        let raw = self.caller.call(METHOD_EXPORT, json!({})).await?;
        Self::decode(raw, "serialized model")
    }

    async fn reap(&self) -> Result<(), FacadeError> {
        self.caller.call(METHOD_REAP, json!({})).await?;
        Ok(())
    }

    async fn watch_minion_reports(
        &self,
    ) -> Result<NotifyWatcher, FacadeError> {
        self.caller.watch(STREAM_MINION_REPORTS).await
    }

    async fn minion_reports(&self) -> Result<MinionReports, FacadeError> {
        let raw = self.caller.call(METHOD_MINION_REPORTS, json!({})).await?;
        let wire: MinionReportsResult = Self::decode(raw, "minion reports")?;
        let phase = Self::decode_phase(&wire.phase, "minion reports")?;
        Ok(MinionReports {
            migration_id: wire.migration_id,
            phase: Some(phase),
            success_count: wire.success_count,
            unknown_count: wire.unknown_count,
            failed_machines: wire.failed_machines,
            failed_units: wire.failed_units,
            some_unknown_machines: wire.some_unknown_machines,
            some_unknown_units: wire.some_unknown_units,
        })
    }
}
