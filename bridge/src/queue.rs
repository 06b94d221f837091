//! Ordered queue of jobs waiting for the worker.
//!
//! Strict FIFO for user jobs. Internal jobs (document replay after a
//! restart) can jump ahead of everything waiting, keeping their own order.

use std::collections::VecDeque;

use crate::job::{Job, JobId};

#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Append to the tail.
    pub fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    /// Put `jobs` ahead of every waiting job, preserving their relative order.
    pub fn push_priority(&mut self, jobs: Vec<Job>) {
        for job in jobs.into_iter().rev() {
            self.jobs.push_front(job);
        }
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Remove a waiting job by id.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let index = self.jobs.iter().position(|job| job.id == id)?;
        self.jobs.remove(index)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Job> + '_ {
        self.jobs.drain(..)
    }
}
