// src/storage.rs
use crate::codec::decode_payload;
use crate::lua::LuaScripts;
use crate::{Job, JobStatus, QueuifyError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

/// Key of the status list holding job ids for `status`.
fn runs_key(queue: &str, status: JobStatus) -> String {
    format!("queuify:{queue}:runs:{}", status.as_str())
}

/// Key of the hash record for one job.
fn job_key(queue: &str, job_id: &str) -> String {
    format!("queuify:{queue}:runs:{job_id}")
}

/// Prefix shared by all job record keys of a queue; the drain script
/// appends the job id to reach individual records.
fn record_prefix(queue: &str) -> String {
    format!("queuify:{queue}:runs:")
}

/// Atomic job persistence. Every multi-step state change is a single
/// round trip (script or MULTI/EXEC pipeline); partial application of a
/// job-state transition is a correctness bug, not a degraded mode.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates the job record and queues the id onto the pending list.
    /// Rejects duplicate ids with `AlreadyExists`.
    async fn add_job(&self, queue: &str, job_id: &str, payload: &[u8]) -> Result<()>;

    /// Claims up to `limit` jobs from the `from` status list, moving each
    /// id onto the running list. Each move is atomic and destructive, so
    /// no two concurrent callers can claim the same id.
    async fn get_jobs(&self, queue: &str, from: JobStatus, limit: usize) -> Result<Vec<Job>>;

    /// Marks the job completed and moves its id to the completed list.
    async fn complete_job(&self, queue: &str, job_id: &str) -> Result<()>;

    /// Marks the job failed with `reason` and moves its id to the failed
    /// list.
    async fn fail_job(&self, queue: &str, job_id: &str, reason: &str) -> Result<()>;

    /// Overwrites the stored payload without touching status or list
    /// membership.
    async fn update_job(&self, queue: &str, job_id: &str, payload: &[u8]) -> Result<()>;

    /// Relocates every id in `from` to `to`, flipping each record's
    /// status field. Returns the moved ids; used for stall recovery.
    async fn move_jobs_between_lists(
        &self,
        queue: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<Vec<String>>;
}

/// Redis-backed `JobStore`.
pub struct RedisStorage {
    conn: ConnectionManager,
    scripts: LuaScripts,
}

impl RedisStorage {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            scripts: LuaScripts::new(),
        })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scripts: LuaScripts::new(),
        }
    }
}

#[async_trait]
impl JobStore for RedisStorage {
    async fn add_job(&self, queue: &str, job_id: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: i32 = self
            .scripts
            .add_job
            .key(job_key(queue, job_id))
            .key(runs_key(queue, JobStatus::Pending))
            .arg(job_id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(QueuifyError::AlreadyExists {
                entity: "job",
                name: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_jobs(&self, queue: &str, from: JobStatus, limit: usize) -> Result<Vec<Job>> {
        let mut conn = self.conn.clone();
        let from_key = runs_key(queue, from);
        let running_key = runs_key(queue, JobStatus::Running);

        // Head-to-tail moves: repeated LMOVE LEFT->RIGHT preserves
        // insertion order when the running list is drained from its tail.
        let mut ids = Vec::with_capacity(limit);
        for _ in 0..limit {
            let id: Option<String> = redis::cmd("LMOVE")
                .arg(&from_key)
                .arg(&running_key)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            match id {
                Some(id) => ids.push(id),
                None => break,
            }
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // One batch: read each payload and flip each status field. If this
        // fails the moved ids stay in running and are recovered as stalled
        // on the next engine start; they are never silently lost.
        let mut pipe = redis::pipe();
        for id in &ids {
            let key = job_key(queue, id);
            pipe.hget(&key, "data");
            pipe.hset(&key, "status", JobStatus::Running.as_str()).ignore();
        }
        let payloads: Vec<Option<Vec<u8>>> = pipe.query_async(&mut conn).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for (id, raw) in ids.into_iter().zip(payloads) {
            match raw {
                Some(bytes) => jobs.push(Job {
                    data: decode_payload(&bytes)?,
                    id,
                }),
                None => debug!(job_id = %id, queue, "job record missing during claim"),
            }
        }
        Ok(jobs)
    }

    async fn complete_job(&self, queue: &str, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(job_key(queue, job_id), "status", JobStatus::Completed.as_str())
            .ignore()
            .lrem(runs_key(queue, JobStatus::Running), 1, job_id)
            .ignore()
            .lpush(runs_key(queue, JobStatus::Completed), job_id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn fail_job(&self, queue: &str, job_id: &str, reason: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let record = job_key(queue, job_id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(
                &record,
                &[
                    ("status", JobStatus::Failed.as_str()),
                    ("failed_reason", reason),
                ],
            )
            .ignore()
            .lrem(runs_key(queue, JobStatus::Running), 1, job_id)
            .ignore()
            .lpush(runs_key(queue, JobStatus::Failed), job_id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn update_job(&self, queue: &str, job_id: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(job_key(queue, job_id), "data", payload).await?;
        Ok(())
    }

    async fn move_jobs_between_lists(
        &self,
        queue: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let moved: Vec<String> = self
            .scripts
            .drain_list
            .key(runs_key(queue, from))
            .key(runs_key(queue, to))
            .arg(record_prefix(queue))
            .arg(to.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }
}
