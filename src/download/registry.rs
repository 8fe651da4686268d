// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download registry: the shared table of running jobs.
//!
//! Membership in the live table is what "running" means. Every terminal
//! transition (completion, cancel, failure) removes the entry under the write
//! lock and records the outcome in a bounded table of completion slots, so a
//! job reaches exactly one terminal outcome and `update` can never bring a
//! removed job back.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::error::DownloadError;
use super::types::{DownloadJob, FinishedFile, JobId, JobOutcome, JobSnapshot, JobStatus};
use crate::security::{resilient_read, resilient_write};

/// Number of terminal outcomes retained for status queries.
pub const MAX_RETAINED_OUTCOMES: usize = 256;

#[derive(Debug, Clone)]
struct LiveJob {
    percent: u8,
    content_key: String,
    display_name: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    live: HashMap<JobId, LiveJob>,
    outcomes: HashMap<JobId, JobOutcome>,
    /// Insertion order of `outcomes`, oldest first.
    order: VecDeque<JobId>,
}

impl Tables {
    fn settle(&mut self, id: &JobId, outcome: JobOutcome) -> bool {
        if self.live.remove(id).is_none() {
            return false;
        }
        if self.outcomes.insert(id.clone(), outcome).is_none() {
            self.order.push_back(id.clone());
        }
        while self.order.len() > MAX_RETAINED_OUTCOMES {
            if let Some(oldest) = self.order.pop_front() {
                self.outcomes.remove(&oldest);
            }
        }
        true
    }
}

/// Concurrency-safe job table shared by the manager, its tasks and the API.
#[derive(Debug, Default)]
pub struct DownloadRegistry {
    tables: RwLock<Tables>,
    settled: Notify,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job at 0%.
    pub fn register(&self, job: &DownloadJob) -> Result<(), DownloadError> {
        let mut tables = resilient_write(&self.tables);
        if tables.live.contains_key(&job.id) || tables.outcomes.contains_key(&job.id) {
            return Err(DownloadError::DuplicateJob(job.id.to_string()));
        }
        tables.live.insert(
            job.id.clone(),
            LiveJob {
                percent: 0,
                content_key: job.content_key.clone(),
                display_name: job.display_name.clone(),
                started_at: job.created_at,
            },
        );
        Ok(())
    }

    /// Record progress for a running job.
    ///
    /// Returns false if the job is no longer registered, which the caller
    /// must treat as a request to abort. Values are clamped to 100 and never
    /// move backwards.
    pub fn update(&self, id: &JobId, percent: u8) -> bool {
        let mut tables = resilient_write(&self.tables);
        match tables.live.get_mut(id) {
            Some(job) => {
                job.percent = job.percent.max(percent.min(100));
                true
            }
            None => false,
        }
    }

    /// Drop a live entry without recording an outcome. Idempotent.
    pub fn remove(&self, id: &JobId) -> bool {
        let removed = resilient_write(&self.tables).live.remove(id).is_some();
        if removed {
            self.settled.notify_waiters();
        }
        removed
    }

    /// Current percent of a running job.
    pub fn get(&self, id: &JobId) -> Option<u8> {
        resilient_read(&self.tables).live.get(id).map(|job| job.percent)
    }

    /// Returns true while the job is running.
    pub fn contains(&self, id: &JobId) -> bool {
        resilient_read(&self.tables).live.contains_key(id)
    }

    /// Cancel a running job. Returns false if it was not running.
    pub fn cancel(&self, id: &JobId) -> bool {
        self.conclude(id, JobOutcome::Cancelled)
    }

    /// Remove a running job and record its terminal outcome.
    ///
    /// Returns false (and records nothing) if another terminal event already
    /// removed the entry.
    pub fn conclude(&self, id: &JobId, outcome: JobOutcome) -> bool {
        let settled = resilient_write(&self.tables).settle(id, outcome);
        if settled {
            self.settled.notify_waiters();
        }
        settled
    }

    /// Run the promotion step for a completed transfer atomically with
    /// respect to cancellation.
    ///
    /// If the job is still registered, `promote` runs while the write lock is
    /// held, the entry is removed and `Finished` or `Failed` is recorded.
    /// Returns `None` without calling `promote` if the job was cancelled.
    ///
    /// `promote` does synchronous file I/O; every reader of the registry
    /// blocks until it returns, so keep it to a rename and a chmod.
    pub fn finalize<F>(&self, id: &JobId, promote: F) -> Option<Result<FinishedFile, DownloadError>>
    where
        F: FnOnce() -> Result<FinishedFile, DownloadError>,
    {
        let result = {
            let mut tables = resilient_write(&self.tables);
            if !tables.live.contains_key(id) {
                return None;
            }
            let result = promote();
            let outcome = match &result {
                Ok(file) => JobOutcome::Finished(file.clone()),
                Err(e) => JobOutcome::Failed {
                    reason: e.reason().to_string(),
                },
            };
            tables.settle(id, outcome);
            result
        };
        self.settled.notify_waiters();
        Some(result)
    }

    /// Terminal outcome of a job, if it has one and it is still retained.
    pub fn outcome(&self, id: &JobId) -> Option<JobOutcome> {
        resilient_read(&self.tables).outcomes.get(id).cloned()
    }

    /// Running status, or the retained terminal outcome.
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        let tables = resilient_read(&self.tables);
        if let Some(job) = tables.live.get(id) {
            return Some(JobStatus::Running {
                percent: job.percent,
            });
        }
        tables.outcomes.get(id).cloned().map(JobStatus::from)
    }

    /// Snapshot of every running job, oldest first.
    pub fn active(&self) -> Vec<JobSnapshot> {
        let tables = resilient_read(&self.tables);
        let mut jobs: Vec<JobSnapshot> = tables
            .live
            .iter()
            .map(|(id, job)| JobSnapshot {
                id: id.clone(),
                content_key: job.content_key.clone(),
                display_name: job.display_name.clone(),
                percent: job.percent,
                started_at: job.started_at,
            })
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Number of running jobs.
    pub fn active_count(&self) -> usize {
        resilient_read(&self.tables).live.len()
    }

    /// Wait until the job leaves the live table.
    ///
    /// Resolves to its outcome, or `None` if the id is unknown or the entry
    /// was removed without one.
    pub async fn wait(&self, id: &JobId) -> Option<JobOutcome> {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let tables = resilient_read(&self.tables);
                if !tables.live.contains_key(id) {
                    return tables.outcomes.get(id).cloned();
                }
            }
            notified.await;
        }
    }
}
