// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deterministic doubles for every capability the worker consumes.
//!
//! The facade contract deliberately has two realizations: the RPC client in
//! [`crate::client`] and the scripted [`StubFacade`] here, which replays
//! queued statuses and report aggregates and records everything the worker
//! does to it. The other doubles follow the same shape: script the inputs,
//! record the outputs, decide nothing at runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use convoy_types::{
    MigrationStatus, MinionReports, Phase, SerializedModel, TargetInfo,
    ToolsRef,
};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::connect::{ApiOpenFn, ConnectError, ConnectInfo, Connection, DialOpts};
use crate::facade::{Facade, FacadeError, NotifyWatcher};
use crate::guard::{Guard, GuardError};
use crate::upload::{
    upload_binaries, CharmDownloader, CharmUploader, ToolsDownloader,
    ToolsUploader, UploadError,
};
use crate::worker::UploadBinariesFn;

/// A root logger that swallows everything.
pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// A plausible in-flight migration status at `phase`, changed just now.
pub fn active_status(phase: Phase) -> MigrationStatus {
    MigrationStatus {
        model_uuid: "1f2e3d4c-0000-4000-8000-9a8b7c6d5e4f".parse().unwrap(),
        attempt: 1,
        phase,
        phase_changed_time: SystemTime::now(),
        target_info: TargetInfo {
            addrs: vec!["10.11.12.13:17070".to_owned()],
            ca_cert: "-----BEGIN CERTIFICATE-----".to_owned(),
            auth_tag: "user-admin".to_owned(),
            password: "sekrit".to_owned(),
        },
    }
}

/// A clock with a fixed `now` whose sleeps complete only when the requested
/// duration is at or below a configured threshold; everything longer pends
/// forever. Requested durations are recorded.
pub struct FakeClock {
    now: SystemTime,
    fire_at_or_below: Duration,
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now,
            fire_at_or_below: Duration::ZERO,
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Sleeps of at most `threshold` complete immediately.
    pub fn with_fire_threshold(mut self, threshold: Duration) -> Self {
        self.fire_at_or_below = threshold;
        self
    }

    /// Every sleep duration requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        self.now
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.sleeps.lock().unwrap().push(duration);
        if duration <= self.fire_at_or_below {
            Box::pin(async {})
        } else {
            Box::pin(futures::future::pending())
        }
    }
}

#[derive(Default)]
struct FacadeScript {
    statuses: VecDeque<Result<MigrationStatus, FacadeError>>,
    reports: VecDeque<MinionReports>,
    export: Option<Result<SerializedModel, FacadeError>>,
    reap: Option<Result<(), FacadeError>>,
    set_phase: Option<FacadeError>,
    phases_set: Vec<Phase>,
}

/// Scripted [`Facade`].
///
/// Queued statuses and report aggregates are consumed front to back; the
/// last entry is sticky so repeated fetches keep observing it. Consuming an
/// entry tickles the matching watcher so the worker comes back for the next
/// one. The minion-report watcher stays silent while no reports are
/// scripted, which is how tests model agents that never say anything.
pub struct StubFacade {
    script: Mutex<FacadeScript>,
    reports_fetched: AtomicUsize,
    migration_tx: tokio::sync::watch::Sender<()>,
    reports_tx: tokio::sync::watch::Sender<()>,
}

impl Default for StubFacade {
    fn default() -> Self {
        let (migration_tx, _) = tokio::sync::watch::channel(());
        let (reports_tx, _) = tokio::sync::watch::channel(());
        Self {
            script: Mutex::new(FacadeScript::default()),
            reports_fetched: AtomicUsize::new(0),
            migration_tx,
            reports_tx,
        }
    }
}

impl StubFacade {
    pub fn queue_status(
        &self,
        status: Result<MigrationStatus, FacadeError>,
    ) {
        self.script.lock().unwrap().statuses.push_back(status);
    }

    pub fn queue_reports(&self, reports: MinionReports) {
        self.script.lock().unwrap().reports.push_back(reports);
        self.reports_tx.send_replace(());
    }

    pub fn set_export(&self, result: Result<SerializedModel, FacadeError>) {
        self.script.lock().unwrap().export = Some(result);
    }

    pub fn set_reap(&self, result: Result<(), FacadeError>) {
        self.script.lock().unwrap().reap = Some(result);
    }

    pub fn fail_set_phase(&self, message: &str) {
        self.script.lock().unwrap().set_phase =
            Some(FacadeError::Call(message.to_owned()));
    }

    /// Every phase the worker has persisted, in order.
    pub fn phases_set(&self) -> Vec<Phase> {
        self.script.lock().unwrap().phases_set.clone()
    }

    pub fn reports_fetched(&self) -> usize {
        self.reports_fetched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Facade for StubFacade {
    async fn watch(&self) -> Result<NotifyWatcher, FacadeError> {
        let rx = self.migration_tx.subscribe();
        self.migration_tx.send_replace(());
        Ok(rx)
    }

    async fn migration_status(&self) -> Result<MigrationStatus, FacadeError> {
        let mut script = self.script.lock().unwrap();
        if script.statuses.len() > 1 {
            let result = script.statuses.pop_front().unwrap();
            self.migration_tx.send_replace(());
            result
        } else {
            script
                .statuses
                .front()
                .cloned()
                .expect("no migration status scripted")
        }
    }

    async fn set_phase(&self, phase: Phase) -> Result<(), FacadeError> {
        let mut script = self.script.lock().unwrap();
        if let Some(err) = &script.set_phase {
            return Err(err.clone());
        }
        script.phases_set.push(phase);
        Ok(())
    }

    async fn export(&self) -> Result<SerializedModel, FacadeError> {
        self.script
            .lock()
            .unwrap()
            .export
            .clone()
            .unwrap_or_else(|| Ok(SerializedModel::default()))
    }

    async fn reap(&self) -> Result<(), FacadeError> {
        self.script.lock().unwrap().reap.clone().unwrap_or(Ok(()))
    }

    async fn watch_minion_reports(
        &self,
    ) -> Result<NotifyWatcher, FacadeError> {
        let rx = self.reports_tx.subscribe();
        if !self.script.lock().unwrap().reports.is_empty() {
            self.reports_tx.send_replace(());
        }
        Ok(rx)
    }

    async fn minion_reports(&self) -> Result<MinionReports, FacadeError> {
        self.reports_fetched.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if script.reports.len() > 1 {
            let reports = script.reports.pop_front().unwrap();
            self.reports_tx.send_replace(());
            Ok(reports)
        } else {
            script
                .reports
                .front()
                .cloned()
                .ok_or_else(|| {
                    FacadeError::Call("no minion reports scripted".to_owned())
                })
        }
    }
}

/// Scripted [`Guard`] that counts gate operations.
#[derive(Default)]
pub struct StubGuard {
    lockdowns: AtomicUsize,
    unlocks: AtomicUsize,
    hang_until_cancel: AtomicBool,
    lockdown_error: Mutex<Option<GuardError>>,
}

impl StubGuard {
    /// Makes `lockdown` park until the worker is killed, then report
    /// [`GuardError::Aborted`] the way a real fortress would.
    pub fn hang_lockdown_until_cancelled(&self) {
        self.hang_until_cancel.store(true, Ordering::SeqCst);
    }

    pub fn fail_lockdown(&self, message: &str) {
        *self.lockdown_error.lock().unwrap() =
            Some(GuardError::Gate(message.to_owned()));
    }

    pub fn lockdowns(&self) -> usize {
        self.lockdowns.load(Ordering::SeqCst)
    }

    pub fn unlocks(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Guard for StubGuard {
    async fn lockdown(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), GuardError> {
        self.lockdowns.fetch_add(1, Ordering::SeqCst);
        if self.hang_until_cancel.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(GuardError::Aborted);
        }
        match self.lockdown_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn unlock(&self) -> Result<(), GuardError> {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One observed dial of the target controller.
#[derive(Clone, Debug)]
pub struct DialRecord {
    pub info: ConnectInfo,
    pub opts: DialOpts,
}

/// Records every dial and every call made against the target controller,
/// with scripted failure points.
#[derive(Default)]
pub struct TargetRecorder {
    dials: Mutex<Vec<DialRecord>>,
    imports: Mutex<Vec<Vec<u8>>>,
    activated: Mutex<Vec<Uuid>>,
    aborted: Mutex<Vec<Uuid>>,
    uploads: Mutex<Vec<String>>,
    dial_error: Mutex<Option<String>>,
    import_error: Mutex<Option<String>>,
    activate_error: Mutex<Option<String>>,
    abort_error: Mutex<Option<String>>,
}

impl TargetRecorder {
    /// A dialer that hands out connections backed by this recorder.
    pub fn api_open(self: &Arc<Self>) -> ApiOpenFn {
        let recorder = Arc::clone(self);
        Box::new(move |info, opts| {
            let recorder = Arc::clone(&recorder);
            Box::pin(async move {
                recorder
                    .dials
                    .lock()
                    .unwrap()
                    .push(DialRecord { info, opts });
                if let Some(msg) = recorder.dial_error.lock().unwrap().clone()
                {
                    return Err(ConnectError::Dial(msg));
                }
                Ok(Box::new(StubConnection { recorder })
                    as Box<dyn Connection>)
            })
        })
    }

    pub fn fail_dial(&self, message: &str) {
        *self.dial_error.lock().unwrap() = Some(message.to_owned());
    }

    pub fn fail_import(&self, message: &str) {
        *self.import_error.lock().unwrap() = Some(message.to_owned());
    }

    pub fn fail_activate(&self, message: &str) {
        *self.activate_error.lock().unwrap() = Some(message.to_owned());
    }

    pub fn fail_abort(&self, message: &str) {
        *self.abort_error.lock().unwrap() = Some(message.to_owned());
    }

    pub fn dials(&self) -> Vec<DialRecord> {
        self.dials.lock().unwrap().clone()
    }

    pub fn imports(&self) -> Vec<Vec<u8>> {
        self.imports.lock().unwrap().clone()
    }

    pub fn activated(&self) -> Vec<Uuid> {
        self.activated.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<Uuid> {
        self.aborted.lock().unwrap().clone()
    }

    /// Binary uploads observed, as `"charm <id>"` / `"tools <version>"`.
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

struct StubConnection {
    recorder: Arc<TargetRecorder>,
}

#[async_trait]
impl Connection for StubConnection {
    async fn import_model(&self, bytes: &[u8]) -> Result<(), ConnectError> {
        if let Some(msg) = self.recorder.import_error.lock().unwrap().clone()
        {
            return Err(ConnectError::Call(msg));
        }
        self.recorder.imports.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn activate_model(&self, model: Uuid) -> Result<(), ConnectError> {
        if let Some(msg) =
            self.recorder.activate_error.lock().unwrap().clone()
        {
            return Err(ConnectError::Call(msg));
        }
        self.recorder.activated.lock().unwrap().push(model);
        Ok(())
    }

    async fn abort_model(&self, model: Uuid) -> Result<(), ConnectError> {
        if let Some(msg) = self.recorder.abort_error.lock().unwrap().clone()
        {
            return Err(ConnectError::Call(msg));
        }
        self.recorder.aborted.lock().unwrap().push(model);
        Ok(())
    }
}

#[async_trait]
impl CharmUploader for StubConnection {
    async fn upload_charm(
        &self,
        charm_id: String,
        _content: Vec<u8>,
    ) -> Result<(), UploadError> {
        self.recorder
            .uploads
            .lock()
            .unwrap()
            .push(format!("charm {}", charm_id));
        Ok(())
    }
}

#[async_trait]
impl ToolsUploader for StubConnection {
    async fn upload_tools(
        &self,
        tools: ToolsRef,
        _content: Vec<u8>,
    ) -> Result<(), UploadError> {
        self.recorder
            .uploads
            .lock()
            .unwrap()
            .push(format!("tools {}", tools.version));
        Ok(())
    }
}

/// Downloader that hands back the artifact identifier as its content.
pub struct StubDownloader;

#[async_trait]
impl CharmDownloader for StubDownloader {
    async fn download_charm(
        &self,
        charm_id: String,
    ) -> Result<Vec<u8>, UploadError> {
        Ok(charm_id.into_bytes())
    }
}

#[async_trait]
impl ToolsDownloader for StubDownloader {
    async fn download_tools(
        &self,
        tools: ToolsRef,
    ) -> Result<Vec<u8>, UploadError> {
        Ok(tools.version.into_bytes())
    }
}

fn passthrough(
    config: crate::upload::UploadBinariesConfig<'_>,
) -> BoxFuture<'_, Result<(), UploadError>> {
    Box::pin(upload_binaries(config))
}

/// The canonical uploader wired into a worker config.
pub fn passthrough_upload() -> UploadBinariesFn {
    Box::new(passthrough)
}
