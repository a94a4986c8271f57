use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

/// One message claimed from the queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub payload: Value,
    pub attempt: i32,
}

/// Durable hand-off between the webhook path and the worker. `send` must
/// only be called after the gate allows the job.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(&self, payload: Value) -> Result<Uuid>;

    /// Claim up to `limit` jobs for this worker. A claimed job is leased;
    /// a worker crash lets the lease lapse and the job be re-claimed.
    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<QueuedJob>>;

    /// Acknowledge successful (or poison) handling; the job is finished.
    async fn ack(&self, id: Uuid) -> Result<()>;

    /// Request redelivery after a transient failure. Moves the job to the
    /// dead letter state once retries are exhausted.
    async fn retry(&self, id: Uuid, error: &str) -> Result<()>;

    /// Extend the lease of a long-running job.
    async fn heartbeat(&self, id: Uuid) -> Result<()>;
}

/// PostgreSQL-backed queue. Claiming uses `FOR UPDATE SKIP LOCKED` so
/// concurrent workers never double-claim.
pub struct PgJobQueue {
    pool: PgPool,
    lease_ms: i64,
    max_retries: i32,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, lease_ms: i64, max_retries: i32) -> Self {
        Self {
            pool,
            lease_ms,
            max_retries,
        }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn send(&self, payload: Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO jobs (id, payload, status, attempt, created_at, updated_at) \
             VALUES ($1, $2, 'pending', 0, now(), now())",
        )
        .bind(id)
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<QueuedJob>> {
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'running', \
                             attempt = attempt + 1, \
                             claimed_by = $1, \
                             lease_expires_at = now() + ($2 * interval '1 millisecond'), \
                             updated_at = now() \
             WHERE id IN ( \
                 SELECT id FROM jobs \
                 WHERE status = 'pending' \
                    OR (status = 'running' AND lease_expires_at < now()) \
                 ORDER BY created_at \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, payload, attempt",
        )
        .bind(worker_id)
        .bind(self.lease_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| QueuedJob {
                id: row.get("id"),
                payload: row.get("payload"),
                attempt: row.get("attempt"),
            })
            .collect())
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'succeeded', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry(&self, id: Uuid, error: &str) -> Result<()> {
        let row = sqlx::query(
            "UPDATE jobs SET \
                 status = CASE WHEN attempt >= $2 THEN 'dead' ELSE 'pending' END, \
                 last_error = $3, \
                 updated_at = now() \
             WHERE id = $1 \
             RETURNING status",
        )
        .bind(id)
        .bind(self.max_retries)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) if row.get::<String, _>("status") == "dead" => {
                warn!(job_id = %id, error, "job exhausted retries, dead-lettered");
            }
            Some(_) => info!(job_id = %id, error, "job requeued for retry"),
            None => warn!(job_id = %id, "retry requested for unknown job"),
        }
        Ok(())
    }

    async fn heartbeat(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET lease_expires_at = now() + ($2 * interval '1 millisecond') \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(self.lease_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory queue for tests and single-process runs.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum State {
        Pending,
        Running,
        Succeeded,
        Dead,
    }

    struct Entry {
        payload: Value,
        state: State,
        attempt: i32,
        last_error: Option<String>,
        seq: u64,
    }

    #[derive(Default)]
    pub struct MemoryJobQueue {
        entries: Mutex<HashMap<Uuid, Entry>>,
        seq: Mutex<u64>,
        max_retries: i32,
    }

    impl MemoryJobQueue {
        pub fn new(max_retries: i32) -> Self {
            Self {
                max_retries,
                ..Default::default()
            }
        }

        pub fn pending_count(&self) -> usize {
            self.count(State::Pending)
        }

        pub fn succeeded_count(&self) -> usize {
            self.count(State::Succeeded)
        }

        pub fn dead_count(&self) -> usize {
            self.count(State::Dead)
        }

        pub fn last_error(&self, id: Uuid) -> Option<String> {
            self.entries
                .lock()
                .unwrap()
                .get(&id)
                .and_then(|e| e.last_error.clone())
        }

        fn count(&self, state: State) -> usize {
            self.entries
                .lock()
                .unwrap()
                .values()
                .filter(|e| e.state == state)
                .count()
        }
    }

    #[async_trait]
    impl JobQueue for MemoryJobQueue {
        async fn send(&self, payload: Value) -> Result<Uuid> {
            let id = Uuid::new_v4();
            let mut seq = self.seq.lock().unwrap();
            *seq += 1;
            self.entries.lock().unwrap().insert(
                id,
                Entry {
                    payload,
                    state: State::Pending,
                    attempt: 0,
                    last_error: None,
                    seq: *seq,
                },
            );
            Ok(id)
        }

        async fn claim(&self, _worker_id: &str, limit: i64) -> Result<Vec<QueuedJob>> {
            let mut entries = self.entries.lock().unwrap();
            let mut ready: Vec<(&Uuid, &mut Entry)> = entries
                .iter_mut()
                .filter(|(_, e)| e.state == State::Pending)
                .collect();
            ready.sort_by_key(|(_, e)| e.seq);

            let mut claimed = Vec::new();
            for (id, entry) in ready.into_iter().take(limit as usize) {
                entry.state = State::Running;
                entry.attempt += 1;
                claimed.push(QueuedJob {
                    id: *id,
                    payload: entry.payload.clone(),
                    attempt: entry.attempt,
                });
            }
            Ok(claimed)
        }

        async fn ack(&self, id: Uuid) -> Result<()> {
            if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
                entry.state = State::Succeeded;
            }
            Ok(())
        }

        async fn retry(&self, id: Uuid, error: &str) -> Result<()> {
            if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
                entry.last_error = Some(error.to_string());
                entry.state = if entry.attempt >= self.max_retries {
                    State::Dead
                } else {
                    State::Pending
                };
            }
            Ok(())
        }

        async fn heartbeat(&self, _id: Uuid) -> Result<()> {
            Ok(())
        }
    }
}
