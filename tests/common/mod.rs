//! In-memory `JobStore` double mirroring the Redis storage semantics:
//! per-status id lists pushed at the head and claimed head-to-tail, plus
//! one record per job whose status field always agrees with the list
//! holding the id.
use async_trait::async_trait;
use queuify::codec::decode_payload;
use queuify::{Job, JobStatus, JobStore, QueuifyError, Result};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct Record {
    pub status: JobStatus,
    pub data: Vec<u8>,
    pub failed_reason: Option<String>,
}

#[derive(Default)]
struct Inner {
    lists: HashMap<(String, JobStatus), VecDeque<String>>,
    records: HashMap<(String, String), Record>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, queue: &str, status: JobStatus) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .lists
            .get(&(queue.to_string(), status))
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn status_of(&self, queue: &str, job_id: &str) -> Option<JobStatus> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(&(queue.to_string(), job_id.to_string()))
            .map(|record| record.status)
    }

    pub fn data_of(&self, queue: &str, job_id: &str) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(&(queue.to_string(), job_id.to_string()))
            .map(|record| decode_payload(&record.data).unwrap())
    }

    pub fn failed_reason_of(&self, queue: &str, job_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(&(queue.to_string(), job_id.to_string()))
            .and_then(|record| record.failed_reason.clone())
    }

    /// Asserts the status field of a record agrees with the one list
    /// holding the job's id.
    pub fn assert_status_list_agreement(&self, queue: &str, job_id: &str) {
        let status = self.status_of(queue, job_id).expect("record missing");
        for candidate in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Stalled,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let held = self
                .list(queue, candidate)
                .iter()
                .any(|id| id == job_id);
            assert_eq!(
                held,
                candidate == status,
                "job {job_id} status {status} disagrees with membership of the {candidate} list"
            );
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn add_job(&self, queue: &str, job_id: &str, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record_key = (queue.to_string(), job_id.to_string());
        if inner.records.contains_key(&record_key) {
            return Err(QueuifyError::AlreadyExists {
                entity: "job",
                name: job_id.to_string(),
            });
        }
        inner.records.insert(
            record_key,
            Record {
                status: JobStatus::Pending,
                data: payload.to_vec(),
                failed_reason: None,
            },
        );
        inner
            .lists
            .entry((queue.to_string(), JobStatus::Pending))
            .or_default()
            .push_front(job_id.to_string());
        Ok(())
    }

    async fn get_jobs(&self, queue: &str, from: JobStatus, limit: usize) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock().unwrap();
        let mut jobs = Vec::new();
        for _ in 0..limit {
            let Some(job_id) = inner
                .lists
                .entry((queue.to_string(), from))
                .or_default()
                .pop_front()
            else {
                break;
            };
            inner
                .lists
                .entry((queue.to_string(), JobStatus::Running))
                .or_default()
                .push_back(job_id.clone());
            let record = inner
                .records
                .get_mut(&(queue.to_string(), job_id.clone()))
                .expect("claimed id without record");
            record.status = JobStatus::Running;
            jobs.push(Job {
                data: decode_payload(&record.data)?,
                id: job_id,
            });
        }
        Ok(jobs)
    }

    async fn complete_job(&self, queue: &str, job_id: &str) -> Result<()> {
        self.finish(queue, job_id, JobStatus::Completed, None)
    }

    async fn fail_job(&self, queue: &str, job_id: &str, reason: &str) -> Result<()> {
        self.finish(queue, job_id, JobStatus::Failed, Some(reason.to_string()))
    }

    async fn update_job(&self, queue: &str, job_id: &str, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner
            .records
            .get_mut(&(queue.to_string(), job_id.to_string()))
        {
            record.data = payload.to_vec();
        }
        Ok(())
    }

    async fn move_jobs_between_lists(
        &self,
        queue: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let mut moved = Vec::new();
        while let Some(job_id) = inner
            .lists
            .entry((queue.to_string(), from))
            .or_default()
            .pop_front()
        {
            inner
                .lists
                .entry((queue.to_string(), to))
                .or_default()
                .push_back(job_id.clone());
            if let Some(record) = inner
                .records
                .get_mut(&(queue.to_string(), job_id.clone()))
            {
                record.status = to;
            }
            moved.push(job_id);
        }
        Ok(moved)
    }
}

impl MemoryStore {
    fn finish(
        &self,
        queue: &str,
        job_id: &str,
        status: JobStatus,
        failed_reason: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner
            .records
            .get_mut(&(queue.to_string(), job_id.to_string()))
        {
            record.status = status;
            if failed_reason.is_some() {
                record.failed_reason = failed_reason;
            }
        }
        let running = inner
            .lists
            .entry((queue.to_string(), JobStatus::Running))
            .or_default();
        if let Some(position) = running.iter().position(|id| id == job_id) {
            running.remove(position);
        }
        inner
            .lists
            .entry((queue.to_string(), status))
            .or_default()
            .push_front(job_id.to_string());
        Ok(())
    }
}
