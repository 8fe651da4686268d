// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: accepts jobs and drives each one to a terminal outcome.

use std::path::Path;
use std::sync::Arc;

use crate::classify::{resolve_extension, ContentClassifier, MagicClassifier};
use crate::config::Config;
use crate::storage::{discard_temp, Storage, StoredFile, ORPHAN_AGE};
use crate::upstream::{http_client, mirror::MirrorResolver, LinkResolver};

use super::error::DownloadError;
use super::registry::DownloadRegistry;
use super::transfer::{CancelContext, ProgressSink, TransferExecutor, TransferReport};
use super::types::{
    CancelResult, DownloadJob, DownloadRequest, FinishedFile, JobId, JobOutcome, JobSnapshot,
    JobStatus,
};

/// Reason recorded when the mirror yields no usable link.
pub const LINK_NOT_FOUND: &str = "link not found";

/// Manager for background downloads.
///
/// Cheap to clone; clones share the registry and collaborators.
#[derive(Clone)]
pub struct DownloadManager {
    registry: Arc<DownloadRegistry>,
    storage: Arc<Storage>,
    resolver: Arc<dyn LinkResolver>,
    classifier: Arc<dyn ContentClassifier>,
    executor: Arc<TransferExecutor>,
}

impl DownloadManager {
    /// Create a manager with a fresh registry.
    ///
    /// Partial files abandoned by a previous run (older than
    /// [`ORPHAN_AGE`]) are removed first.
    pub fn new(
        storage: Storage,
        resolver: Arc<dyn LinkResolver>,
        classifier: Arc<dyn ContentClassifier>,
        executor: TransferExecutor,
    ) -> Self {
        match storage.sweep_orphans(ORPHAN_AGE) {
            Ok(0) => {}
            Ok(n) => tracing::info!(removed = n, "Removed orphaned partial downloads"),
            Err(e) => tracing::warn!("Failed to sweep partial downloads: {:#}", e),
        }
        Self {
            registry: Arc::new(DownloadRegistry::new()),
            storage: Arc::new(storage),
            resolver,
            classifier,
            executor: Arc::new(executor),
        }
    }

    /// Wire storage, the mirror resolver and the executor from config.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = http_client(&config.user_agent, config.request_timeout())?;
        let storage = Storage::open(&config.storage_dir)?;
        Ok(Self::new(
            storage,
            Arc::new(MirrorResolver::new(client, config.mirror_base_url.clone())),
            Arc::new(MagicClassifier),
            TransferExecutor::new(config.transfer_settings())?,
        ))
    }

    /// Use an externally owned registry.
    pub fn with_registry(mut self, registry: Arc<DownloadRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<DownloadRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Accept a download and start it in the background.
    ///
    /// Returns as soon as the job is registered at 0%; no network I/O happens
    /// on the caller's task. Must be called from within a tokio runtime.
    pub fn start_download(&self, request: DownloadRequest) -> Result<JobId, DownloadError> {
        let job = request.into_job()?;
        self.registry.register(&job)?;

        tracing::info!(
            job_id = %job.id,
            content_key = %job.content_key,
            title = %job.display_name,
            "Download accepted"
        );

        let id = job.id.clone();
        let worker = self.clone();
        tokio::spawn(async move { worker.run(job).await });
        Ok(id)
    }

    /// Progress of a running job, `None` once it is unknown or terminal.
    pub fn get_progress(&self, id: &JobId) -> Option<u8> {
        self.registry.get(id)
    }

    /// Cancel a running job. Idempotent: unknown and finished ids are
    /// `NotFound`.
    pub fn cancel(&self, id: &JobId) -> CancelResult {
        if self.registry.cancel(id) {
            tracing::info!(job_id = %id, "Download cancelled");
            CancelResult::Cancelled
        } else {
            CancelResult::NotFound
        }
    }

    /// Running status or retained terminal outcome.
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.registry.status(id)
    }

    /// Wait for a job to reach its terminal outcome.
    pub async fn wait(&self, id: &JobId) -> Option<JobOutcome> {
        self.registry.wait(id).await
    }

    pub fn active_downloads(&self) -> Vec<JobSnapshot> {
        self.registry.active()
    }

    /// Delete a finalized file by its stored name.
    pub fn delete_file(&self, name: &str) -> Result<(), DownloadError> {
        self.storage.delete(name)?;
        tracing::info!(file = %name, "Deleted stored file");
        Ok(())
    }

    pub fn list_files(&self) -> Result<Vec<StoredFile>, DownloadError> {
        self.storage.list()
    }

    /// Bytes of a stored file for serving.
    pub async fn open_file(&self, name: &str) -> Result<Vec<u8>, DownloadError> {
        self.storage.read(name).await
    }

    async fn run(self, job: DownloadJob) {
        let ctx = CancelContext::new(job.id.clone(), self.registry.clone());

        match self.execute(&job, &ctx).await {
            Ok(Some(file)) => {
                tracing::info!(
                    job_id = %job.id,
                    file = %file.filename,
                    detected = %file.detected_kind,
                    "Download finished"
                );
            }
            Ok(None) => {
                tracing::info!(job_id = %job.id, "Download stopped after cancellation");
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, content_key = %job.content_key, "Download failed: {}", e);
                // No-op if finalize already recorded the failure or a cancel won.
                self.registry.conclude(
                    &job.id,
                    JobOutcome::Failed {
                        reason: e.reason().to_string(),
                    },
                );
            }
        }
    }

    /// Returns `Ok(None)` when the job was cancelled along the way.
    async fn execute(
        &self,
        job: &DownloadJob,
        ctx: &CancelContext,
    ) -> Result<Option<FinishedFile>, DownloadError> {
        let url = match self.resolver.resolve(&job.content_key).await {
            Ok(Some(url)) => url,
            Ok(None) => return Err(DownloadError::Resolution(LINK_NOT_FOUND.to_string())),
            Err(e) => {
                tracing::debug!(job_id = %job.id, "Link resolution error: {:#}", e);
                return Err(DownloadError::Resolution(LINK_NOT_FOUND.to_string()));
            }
        };
        if ctx.is_cancelled() {
            return Ok(None);
        }

        let temp = self.storage.temp_path(&job.content_key, &job.id);
        match self.executor.fetch(&url, &temp, ctx).await? {
            TransferReport::Cancelled { bytes } => {
                tracing::debug!(job_id = %job.id, bytes, "Transfer aborted");
                return Ok(None);
            }
            TransferReport::Completed { bytes } => {
                tracing::debug!(job_id = %job.id, bytes, "Transfer complete");
            }
        }

        let finished = self.finalize(job, &temp).await;
        if !matches!(finished, Ok(Some(_))) {
            discard_temp(&temp).await;
        }
        finished
    }

    async fn finalize(
        &self,
        job: &DownloadJob,
        temp: &Path,
    ) -> Result<Option<FinishedFile>, DownloadError> {
        let classifier = self.classifier.clone();
        let path = temp.to_path_buf();
        let detected = tokio::task::spawn_blocking(move || classifier.classify(&path))
            .await
            .map_err(|e| DownloadError::Storage(format!("classifier task failed: {}", e)))??;

        let final_extension = resolve_extension(detected, job.preferred_kind.as_deref());
        let filename = format!("{}.{}", job.display_name, final_extension);

        let promoted = self.registry.finalize(&job.id, || {
            self.storage.promote(temp, &filename)?;
            Ok(FinishedFile {
                filename: filename.clone(),
                detected_kind: detected,
                final_extension: final_extension.clone(),
            })
        });

        match promoted {
            None => Ok(None),
            Some(result) => result.map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::transfer::TransferSettings;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoLink;

    #[async_trait]
    impl LinkResolver for NoLink {
        async fn resolve(&self, _content_key: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    struct BrokenMirror;

    #[async_trait]
    impl LinkResolver for BrokenMirror {
        async fn resolve(&self, _content_key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("connection refused")
        }
    }

    /// Never answers, so the job stays running until cancelled.
    struct Stalled;

    #[async_trait]
    impl LinkResolver for Stalled {
        async fn resolve(&self, _content_key: &str) -> anyhow::Result<Option<String>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Some("http://127.0.0.1:9/never".to_string()))
        }
    }

    fn manager(resolver: Arc<dyn LinkResolver>) -> (tempfile::TempDir, DownloadManager) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let manager = DownloadManager::new(
            storage,
            resolver,
            Arc::new(MagicClassifier),
            TransferExecutor::new(TransferSettings::default()).unwrap(),
        );
        (dir, manager)
    }

    async fn settle(manager: &DownloadManager, id: &JobId) -> Option<JobOutcome> {
        tokio::time::timeout(Duration::from_secs(10), manager.wait(id))
            .await
            .expect("job did not settle")
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_request() {
        let (_dir, manager) = manager(Arc::new(NoLink));
        let err = manager
            .start_download(DownloadRequest::new("", "Title", None))
            .unwrap_err();
        assert!(matches!(err, DownloadError::Validation(_)));
        assert!(manager.active_downloads().is_empty());
    }

    #[tokio::test]
    async fn test_missing_link_fails_job() {
        let (_dir, manager) = manager(Arc::new(NoLink));
        let id = manager
            .start_download(DownloadRequest::new("abc123", "My Book", None))
            .unwrap();

        let outcome = settle(&manager, &id).await;
        assert_eq!(
            outcome,
            Some(JobOutcome::Failed {
                reason: LINK_NOT_FOUND.to_string()
            })
        );
        assert_eq!(manager.get_progress(&id), None);
    }

    #[tokio::test]
    async fn test_resolver_error_is_link_not_found() {
        let (_dir, manager) = manager(Arc::new(BrokenMirror));
        let id = manager
            .start_download(DownloadRequest::new("abc123", "My Book", None))
            .unwrap();

        assert!(matches!(
            settle(&manager, &id).await,
            Some(JobOutcome::Failed { reason }) if reason == LINK_NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_transfer() {
        let (dir, manager) = manager(Arc::new(Stalled));
        let id = manager
            .start_download(DownloadRequest::new("abc123", "My Book", None))
            .unwrap();

        assert_eq!(manager.get_progress(&id), Some(0));
        assert_eq!(manager.cancel(&id), CancelResult::Cancelled);
        assert_eq!(manager.cancel(&id), CancelResult::NotFound);
        assert_eq!(manager.get_progress(&id), None);

        // Let the task observe the cancellation.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.status(&id), Some(JobStatus::Cancelled));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_id() {
        let (_dir, manager) = manager(Arc::new(NoLink));
        assert_eq!(manager.cancel(&JobId::from("missing")), CancelResult::NotFound);
    }

    #[tokio::test]
    async fn test_delete_file_rejects_traversal() {
        let (dir, manager) = manager(Arc::new(NoLink));
        std::fs::write(dir.path().join("Book.pdf"), b"%PDF-1.4").unwrap();

        assert!(matches!(
            manager.delete_file("../../etc/passwd"),
            Err(DownloadError::NotFound(_))
        ));
        manager.delete_file("Book.pdf").unwrap();
        assert!(matches!(manager.delete_file("Book.pdf"), Err(DownloadError::NotFound(_))));
    }
}
