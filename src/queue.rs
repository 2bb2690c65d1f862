use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::scan::{ScanOrchestrator, ScanOutcome, ScanProgress, ScanRequest};
use crate::{now_s, validate_video_id};

const WAIT_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Snapshot of one queued scan.
#[derive(Clone, Debug, Serialize)]
pub struct ScanJob {
    pub id: String,
    pub video_id: String,
    pub source_path: Option<PathBuf>,
    pub force: bool,
    pub status: JobStatus,
    /// Latest progress report from the orchestrator.
    pub progress: Option<ScanProgress>,
    pub result: Option<ScanOutcome>,
    pub error: Option<String>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

#[derive(Clone, Debug)]
pub enum JobEvent {
    Completed { job_id: String, outcome: ScanOutcome },
    Failed { job_id: String, outcome: ScanOutcome },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Completed { job_id, .. } | JobEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn outcome(&self) -> &ScanOutcome {
        match self {
            JobEvent::Completed { outcome, .. } | JobEvent::Failed { outcome, .. } => outcome,
        }
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, ScanJob>,
    order: Vec<String>,
}

type SharedJobs = Arc<Mutex<JobTable>>;
type Subscribers = Arc<Mutex<Vec<Sender<JobEvent>>>>;

/// FIFO scan queue with exactly one worker thread.
///
/// `submit` returns immediately; jobs run strictly one at a time in submission
/// order. There is no cancellation: a submitted job runs to a terminal state,
/// and `shutdown` drains what is already queued before joining the worker.
pub struct JobQueue {
    jobs: SharedJobs,
    subscribers: Subscribers,
    sender: Option<Sender<String>>,
    worker: Option<JoinHandle<()>>,
}

impl JobQueue {
    pub fn start(orchestrator: ScanOrchestrator) -> Self {
        let jobs: SharedJobs = Arc::default();
        let subscribers: Subscribers = Arc::default();
        let (sender, receiver) = mpsc::channel::<String>();

        let worker_jobs = Arc::clone(&jobs);
        let worker_subscribers = Arc::clone(&subscribers);
        let worker = std::thread::spawn(move || {
            run_worker(orchestrator, receiver, worker_jobs, worker_subscribers);
        });

        Self {
            jobs,
            subscribers,
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Queue a scan of `video_id`. Returns the job id.
    pub fn submit(&self, video_id: &str, source_path: Option<PathBuf>) -> Result<String> {
        let mut request = ScanRequest::new(video_id);
        request.source_path = source_path;
        self.submit_request(request)
    }

    pub fn submit_request(&self, request: ScanRequest) -> Result<String> {
        validate_video_id(&request.video_id)?;
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("job queue is shut down"))?;

        let job_id = new_job_id();
        let job = ScanJob {
            id: job_id.clone(),
            video_id: request.video_id.clone(),
            source_path: request.source_path.clone(),
            force: request.force,
            status: JobStatus::Pending,
            progress: None,
            result: None,
            error: None,
            created_at: now_s(),
            started_at: None,
            finished_at: None,
        };
        {
            let mut table = lock(&self.jobs)?;
            table.order.push(job_id.clone());
            table.jobs.insert(job_id.clone(), job);
        }
        if sender.send(job_id.clone()).is_err() {
            let mut table = lock(&self.jobs)?;
            table.jobs.remove(&job_id);
            table.order.retain(|id| id != &job_id);
            return Err(anyhow!("job queue worker is not running"));
        }
        log::info!("queued {} for video {}", job_id, request.video_id);
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Option<ScanJob> {
        lock(&self.jobs).ok()?.jobs.get(job_id).cloned()
    }

    /// All jobs in submission order.
    pub fn jobs(&self) -> Vec<ScanJob> {
        lock(&self.jobs)
            .map(|table| {
                table
                    .order
                    .iter()
                    .filter_map(|id| table.jobs.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Jobs not yet finished, including the one in flight.
    pub fn active_count(&self) -> usize {
        lock(&self.jobs)
            .map(|table| {
                table
                    .jobs
                    .values()
                    .filter(|job| !job.status.is_finished())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Receive an event for every job that finishes from now on.
    pub fn subscribe(&self) -> Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Poll until the job finishes or `timeout` elapses.
    pub fn wait(&self, job_id: &str, timeout: Duration) -> Option<ScanJob> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.status(job_id)?;
            if job.status.is_finished() || Instant::now() >= deadline {
                return Some(job);
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Stop accepting jobs, finish the queued ones and join the worker.
    pub fn shutdown(mut self) -> Result<()> {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("job queue worker panicked"))?;
        }
        Ok(())
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker exit after its current job.
        self.sender.take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("job table lock poisoned"))
}

fn new_job_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("scan_{}", hex::encode(bytes))
}

fn run_worker(
    mut orchestrator: ScanOrchestrator,
    receiver: Receiver<String>,
    jobs: SharedJobs,
    subscribers: Subscribers,
) {
    for job_id in receiver {
        let request = match begin_job(&jobs, &job_id) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(err) => {
                log::error!("job {}: {}", job_id, err);
                continue;
            }
        };

        log::info!("job {}: scanning video {}", job_id, request.video_id);
        let progress_jobs = Arc::clone(&jobs);
        let progress_id = job_id.clone();
        let outcome = orchestrator.process_video_scan(&request, &mut |progress| {
            if let Ok(mut table) = progress_jobs.lock() {
                if let Some(job) = table.jobs.get_mut(&progress_id) {
                    job.progress = Some(progress);
                }
            }
        });

        let event = if outcome.success {
            log::info!(
                "job {}: completed with {} surfaces",
                job_id,
                outcome.surfaces_detected
            );
            JobEvent::Completed {
                job_id: job_id.clone(),
                outcome: outcome.clone(),
            }
        } else {
            log::warn!(
                "job {}: failed: {}",
                job_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            JobEvent::Failed {
                job_id: job_id.clone(),
                outcome: outcome.clone(),
            }
        };

        if let Ok(mut table) = jobs.lock() {
            if let Some(job) = table.jobs.get_mut(&job_id) {
                job.status = if outcome.success {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                job.error = outcome.error.clone();
                job.result = Some(outcome);
                job.finished_at = Some(now_s());
            }
        }

        if let Ok(mut subscribers) = subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
    log::debug!("job queue worker stopped");
}

/// Mark a job as processing and return its request.
fn begin_job(jobs: &SharedJobs, job_id: &str) -> Result<Option<ScanRequest>> {
    let mut table = lock(jobs)?;
    let Some(job) = table.jobs.get_mut(job_id) else {
        return Ok(None);
    };
    job.status = JobStatus::Processing;
    job.started_at = Some(now_s());
    Ok(Some(ScanRequest {
        video_id: job.video_id.clone(),
        source_path: job.source_path.clone(),
        force: job.force,
    }))
}
