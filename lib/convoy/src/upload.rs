// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer of large binary artifacts referenced by a serialized model.
//!
//! The model description shipped to the target carries references to charm
//! archives and agent tools by identifier only; the artifacts themselves are
//! pulled from the source and pushed into the target model through the
//! capabilities below. [`upload_binaries`] is the canonical sequencing; the
//! worker takes it as a config field so tests and callers can interpose.

use async_trait::async_trait;
use convoy_types::ToolsRef;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum UploadError {
    #[error("transferring charm {0}: {1}")]
    Charm(String, String),

    #[error("transferring tools {0}: {1}")]
    Tools(String, String),
}

/// Fetches charm archives from the source model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CharmDownloader: Send + Sync {
    async fn download_charm(
        &self,
        charm_id: String,
    ) -> Result<Vec<u8>, UploadError>;
}

/// Stores charm archives into the target model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CharmUploader: Send + Sync {
    async fn upload_charm(
        &self,
        charm_id: String,
        content: Vec<u8>,
    ) -> Result<(), UploadError>;
}

/// Fetches agent tools archives from the source controller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolsDownloader: Send + Sync {
    async fn download_tools(
        &self,
        tools: ToolsRef,
    ) -> Result<Vec<u8>, UploadError>;
}

/// Stores agent tools archives into the target model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolsUploader: Send + Sync {
    async fn upload_tools(
        &self,
        tools: ToolsRef,
        content: Vec<u8>,
    ) -> Result<(), UploadError>;
}

/// Everything needed to move one model's binaries between controllers.
pub struct UploadBinariesConfig<'a> {
    pub charms: &'a [String],
    pub charm_downloader: &'a dyn CharmDownloader,
    pub charm_uploader: &'a dyn CharmUploader,
    pub tools: &'a [ToolsRef],
    pub tools_downloader: &'a dyn ToolsDownloader,
    pub tools_uploader: &'a dyn ToolsUploader,
}

/// Moves every referenced charm and tools version from the source to the
/// target model, charms first, stopping at the first error. Each artifact is
/// buffered whole between download and upload.
pub async fn upload_binaries(
    config: UploadBinariesConfig<'_>,
) -> Result<(), UploadError> {
    for charm_id in config.charms {
        let content =
            config.charm_downloader.download_charm(charm_id.clone()).await?;
        config
            .charm_uploader
            .upload_charm(charm_id.clone(), content)
            .await?;
    }
    for tools in config.tools {
        let content =
            config.tools_downloader.download_tools(tools.clone()).await?;
        config.tools_uploader.upload_tools(tools.clone(), content).await?;
    }
    Ok(())
}
