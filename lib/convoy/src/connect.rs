// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dialing the target controller.
//!
//! The worker opens two kinds of connection during a migration: a
//! cluster-scoped one (to import, activate, or abort the model as a whole)
//! and a model-scoped one (to upload binaries into the imported model). The
//! transport itself is injected through [`ApiOpenFn`]; this module fixes the
//! shape of what gets dialed and what a live connection can do.

use std::time::Duration;

use async_trait::async_trait;
use convoy_types::TargetInfo;
use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

/// Everything needed to dial and authenticate one connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectInfo {
    /// Controller addresses in `host:port` form, in preference order.
    pub addrs: Vec<String>,

    /// CA certificate (PEM) the controller's TLS certificates chain to.
    pub ca_cert: String,

    /// The tag of the entity to authenticate as.
    pub auth_tag: String,

    /// Password for `auth_tag`.
    pub password: String,

    /// Model to scope the connection to; `None` addresses the cluster.
    pub model: Option<Uuid>,
}

impl ConnectInfo {
    /// Connection info for cluster-level operations on the target.
    pub fn for_cluster(target: &TargetInfo) -> Self {
        Self::new(target, None)
    }

    /// Connection info scoped to one model on the target.
    pub fn for_model(target: &TargetInfo, model: Uuid) -> Self {
        Self::new(target, Some(model))
    }

    fn new(target: &TargetInfo, model: Option<Uuid>) -> Self {
        Self {
            addrs: target.addrs.clone(),
            ca_cert: target.ca_cert.clone(),
            auth_tag: target.auth_tag.clone(),
            password: target.password.clone(),
            model,
        }
    }
}

/// Transport retry budget for one dial attempt.
///
/// The default carries no retries at all. The worker must stay responsive
/// to its supervisor's kill signal, so it is never allowed to sit inside
/// transport retries; long waits belong to the minion coordinator.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DialOpts {
    pub retry_limit: u32,
    pub retry_delay: Duration,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConnectError {
    #[error("failed to dial target controller: {0}")]
    Dial(String),

    #[error("{0}")]
    Call(String),
}

/// A live, authenticated connection to the target controller.
///
/// Model-scoped connections double as the upload sink for charm and tools
/// binaries. Dropping a connection closes it.
#[async_trait]
pub trait Connection:
    crate::upload::CharmUploader + crate::upload::ToolsUploader
{
    /// Installs a serialized model into the target controller.
    async fn import_model(&self, bytes: &[u8]) -> Result<(), ConnectError>;

    /// Marks a previously imported model live on the target.
    async fn activate_model(&self, model: Uuid) -> Result<(), ConnectError>;

    /// Removes a previously imported model from the target.
    async fn abort_model(&self, model: Uuid) -> Result<(), ConnectError>;
}

/// Dialer for target controllers.
pub type ApiOpenFn = Box<
    dyn Fn(
            ConnectInfo,
            DialOpts,
        ) -> BoxFuture<'static, Result<Box<dyn Connection>, ConnectError>>
        + Send
        + Sync,
>;
