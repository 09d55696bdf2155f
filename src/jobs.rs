use crate::{
    config::env_parse,
    ingest::{Ingestor, RunRequest, RunSummary},
    models::ApiError,
    security::AuthContext,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Background ingestion runs, processed one at a time in submission order.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
    shutdown: CancellationToken,
    /// How long finished jobs stay queryable.
    retention: Duration,
}

struct Job {
    id: Uuid,
    request: RunRequest,
    cancel: CancellationToken,
}

struct JobRecord {
    company_id: Uuid,
    state: JobState,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { summary: Box<RunSummary> },
    Failed { error: String, code: String },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    /// Starts the worker. Cancelling `shutdown` cancels every queued and
    /// running job.
    pub fn spawn(ingestor: Ingestor, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        Self::spawn_with_retention(ingestor, shutdown, retention_from_env())
    }

    pub fn spawn_with_retention(
        ingestor: Ingestor,
        shutdown: CancellationToken,
        retention: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                set_state(&statuses_bg, job.id, JobState::Running).await;
                info!(target = "buybox.jobs", job_id = %job.id, "job_started");

                let state = match ingestor.run(job.request, job.cancel).await {
                    Ok(summary) => JobState::Completed {
                        summary: Box::new(summary),
                    },
                    Err(err) => {
                        warn!(target = "buybox.jobs", job_id = %job.id, error = %err, "job_failed");
                        JobState::Failed {
                            error: err.to_string(),
                            code: err.code().to_string(),
                        }
                    }
                };
                set_state(&statuses_bg, job.id, state).await;
            }
        });

        (
            Self {
                tx,
                statuses,
                shutdown,
                retention,
            },
            handle,
        )
    }

    pub async fn enqueue_ingest(&self, request: RunRequest) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        {
            let mut guard = self.statuses.lock().await;
            let retention = self.retention;
            guard.retain(|_, record| {
                record
                    .finished_at
                    .is_none_or(|finished| finished.elapsed() < retention)
            });
            guard.insert(
                id,
                JobRecord {
                    company_id: request.company_id,
                    state: JobState::Queued,
                    cancel: cancel.clone(),
                    finished_at: None,
                },
            );
        }
        let job = Job {
            id,
            request,
            cancel,
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(ApiError::new("queue_send_failed", "worker not available"));
        }
        Ok(id)
    }

    /// Jobs are only visible to the company that submitted them.
    pub async fn get(&self, id: Uuid, context: &AuthContext) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard
            .get(&id)
            .filter(|record| record.company_id == context.company_id)
            .map(|record| JobInfo {
                id: id.to_string(),
                state: record.state.clone(),
            })
    }

    /// Requests cooperative cancellation. Returns false for unknown jobs.
    pub async fn cancel(&self, id: Uuid, context: &AuthContext) -> bool {
        let guard = self.statuses.lock().await;
        match guard
            .get(&id)
            .filter(|record| record.company_id == context.company_id)
        {
            Some(record) => {
                record.cancel.cancel();
                info!(target = "buybox.jobs", job_id = %id, "job_cancel_requested");
                true
            }
            None => false,
        }
    }
}

async fn set_state(statuses: &Mutex<HashMap<Uuid, JobRecord>>, id: Uuid, state: JobState) {
    if let Some(record) = statuses.lock().await.get_mut(&id) {
        if matches!(state, JobState::Completed { .. } | JobState::Failed { .. }) {
            record.finished_at = Some(Instant::now());
        }
        record.state = state;
    }
}

fn retention_from_env() -> Duration {
    Duration::from_secs(env_parse::<u64>("JOB_RETENTION_SECS").unwrap_or(3600))
}

fn queue_capacity_from_env() -> usize {
    env_parse::<usize>("QUEUE_CAPACITY")
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::DisabledClassifier;
    use crate::config::IngestConfig;
    use crate::criteria::{BuyBoxRecord, CriteriaInput};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    async fn queue_with_buy_box() -> (JobQueue, AuthContext, Uuid) {
        queue_retaining(Duration::from_secs(3600)).await
    }

    async fn queue_retaining(retention: Duration) -> (JobQueue, AuthContext, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let company_id = Uuid::new_v4();
        let buy_box_id = Uuid::new_v4();
        store
            .insert_buy_box(BuyBoxRecord {
                id: buy_box_id,
                company_id,
                name: None,
                criteria: CriteriaInput {
                    zip_codes: vec!["44105".into()],
                    ..CriteriaInput::default()
                },
            })
            .await;
        let ingestor = Ingestor::new(store, Arc::new(DisabledClassifier), IngestConfig::default());
        let (queue, _worker) =
            JobQueue::spawn_with_retention(ingestor, CancellationToken::new(), retention);
        let context = AuthContext {
            company_id,
            api_key_id: "key-01".into(),
        };
        (queue, context, buy_box_id)
    }

    async fn wait_for_terminal(queue: &JobQueue, id: Uuid, context: &AuthContext) -> JobState {
        for _ in 0..100 {
            if let Some(info) = queue.get(id, context).await
                && matches!(
                    info.state,
                    JobState::Completed { .. } | JobState::Failed { .. }
                )
            {
                return info.state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn completed_job_carries_summary() {
        let (queue, context, buy_box_id) = queue_with_buy_box().await;
        let id = queue
            .enqueue_ingest(RunRequest {
                company_id: context.company_id,
                buy_box_id,
                feed: vec![json!({
                    "address": "1 Main St",
                    "zip": "44105",
                    "price": 95000,
                    "listing_type": "agent"
                })],
                dry_run: false,
            })
            .await
            .expect("enqueue");
        match wait_for_terminal(&queue, id, &context).await {
            JobState::Completed { summary } => assert_eq!(summary.inserted_count, 1),
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn unknown_buy_box_fails_the_job() {
        let (queue, context, _) = queue_with_buy_box().await;
        let id = queue
            .enqueue_ingest(RunRequest {
                company_id: context.company_id,
                buy_box_id: Uuid::new_v4(),
                feed: vec![],
                dry_run: false,
            })
            .await
            .expect("enqueue");
        match wait_for_terminal(&queue, id, &context).await {
            JobState::Failed { code, .. } => assert_eq!(code, "unknown_buy_box"),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn jobs_are_hidden_from_other_companies() {
        let (queue, context, buy_box_id) = queue_with_buy_box().await;
        let id = queue
            .enqueue_ingest(RunRequest {
                company_id: context.company_id,
                buy_box_id,
                feed: vec![],
                dry_run: true,
            })
            .await
            .expect("enqueue");
        let stranger = AuthContext {
            company_id: Uuid::new_v4(),
            api_key_id: "key-02".into(),
        };
        assert!(queue.get(id, &stranger).await.is_none());
        assert!(!queue.cancel(id, &stranger).await);
        assert!(queue.get(id, &context).await.is_some());
    }

    #[tokio::test]
    async fn finished_jobs_are_evicted_after_retention() {
        let (queue, context, buy_box_id) = queue_retaining(Duration::ZERO).await;
        let request = RunRequest {
            company_id: context.company_id,
            buy_box_id,
            feed: vec![],
            dry_run: true,
        };
        let first = queue.enqueue_ingest(request.clone()).await.expect("enqueue");
        wait_for_terminal(&queue, first, &context).await;

        let second = queue.enqueue_ingest(request).await.expect("enqueue");
        assert!(queue.get(first, &context).await.is_none());
        assert!(queue.get(second, &context).await.is_some());
    }
}
