//! Resume of jobs left pending when the app was closed
//!
//! Runs on boot (or on demand): the persisted job set is read and cleared in
//! one step, then handed to the durable queue.

use crate::platform::PendingJobs;
use crate::queue::JobQueue;
use log::{debug, error, info};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The store held no jobs; nothing was enqueued
    NothingPending,
    Enqueued(usize),
    /// Enqueueing failed; the jobs were put back for the next attempt
    Failed(String),
}

pub struct BootResume {
    pending: PendingJobs,
    queue: Arc<JobQueue>,
}

impl BootResume {
    pub fn new(pending: PendingJobs, queue: Arc<JobQueue>) -> Self {
        Self { pending, queue }
    }

    pub fn run(&self) -> ResumeOutcome {
        debug!("Checking for pending render jobs");
        let jobs = self.pending.take();
        if jobs.is_empty() {
            info!("No pending render jobs found");
            return ResumeOutcome::NothingPending;
        }

        info!("Found {} pending render jobs", jobs.len());
        match self.queue.enqueue_batch(jobs.clone(), None) {
            Ok(count) => {
                info!("Enqueued {} jobs for background rendering", count);
                ResumeOutcome::Enqueued(count)
            }
            Err(e) => {
                error!("Error processing background rendering: {}", e);
                if !self.pending.save(&jobs) {
                    error!("Could not restore {} pending jobs", jobs.len());
                }
                ResumeOutcome::Failed(e.to_string())
            }
        }
    }
}
