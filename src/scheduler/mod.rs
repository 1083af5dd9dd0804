//! Cron scheduler with a persistent job ledger. Jobs are registered once,
//! before `start`; every tick walks a fixed protocol: try-lock the per-job
//! single-flight guard, mark the job running, run the body, record the
//! execution, mark the job done. Ledger write failures are accumulated and
//! logged, never allowed to stop dispatch.

use crate::log_fields;
use crate::logger::Logger;
use crate::models::{ExecutionRecord, JobStatus};
use crate::storage::{StorageError, StoragePort};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job with name '{0}' already exists")]
    DuplicateJob(String),
    #[error("invalid job spec: {0}")]
    InvalidJobSpec(String),
    #[error("invalid schedule '{0}': {1}")]
    InvalidSchedule(String, String),
    #[error(transparent)]
    Ledger(#[from] StorageError),
}

// ── Schedules ─────────────────────────────────────────────────────────────────

/// Fire frequency of a job: either a plain `@every <duration>` or a cron
/// expression.
#[derive(Debug, Clone)]
pub enum Schedule {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let invalid =
            |msg: String| SchedulerError::InvalidSchedule(expr.to_string(), msg);

        if let Some(spec) = expr.strip_prefix("@every ") {
            let duration = parse_duration(spec.trim())
                .ok_or_else(|| invalid("expected a duration like 30s, 5m or 1h".into()))?;
            if duration.is_zero() {
                return Err(invalid("duration must be greater than 0".into()));
            }
            return Ok(Schedule::Every(duration));
        }

        // The cron engine wants a seconds field; a classic 5-field
        // expression gets one prepended.
        let normalized = if expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        cron::Schedule::from_str(&normalized)
            .map(|s| Schedule::Cron(Box::new(s)))
            .map_err(|e| invalid(e.to_string()))
    }

    /// The next fire time strictly after `now`, if any.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(d) => Some(now + chrono::Duration::from_std(*d).ok()?),
            Schedule::Cron(s) => s.after(&now).next(),
        }
    }
}

/// Parse a single `<value><unit>` duration token (ms, s, m, h).
fn parse_duration(spec: &str) -> Option<Duration> {
    let split = spec.find(|c: char| !c.is_ascii_digit())?;
    let (value, unit) = spec.split_at(split);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

// ── Jobs ──────────────────────────────────────────────────────────────────────

pub type JobFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type JobFn = Arc<dyn Fn(CancellationToken) -> JobFuture + Send + Sync>;

/// A named unit of scheduled work. The body receives the ambient cancellation
/// handle and is expected to exit promptly once it fires.
pub struct Job {
    pub name: String,
    pub freq: String,
    pub description: String,
    func: JobFn,
    on_success: Option<Arc<dyn Fn() + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&anyhow::Error) + Send + Sync>>,
    post_execution: Option<Arc<dyn Fn(Option<&anyhow::Error>) + Send + Sync>>,
}

impl Job {
    pub fn new<F>(name: impl Into<String>, freq: impl Into<String>, func: F) -> Self
    where
        F: Fn(CancellationToken) -> JobFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            freq: freq.into(),
            description: String::new(),
            func: Arc::new(func),
            on_success: None,
            on_error: None,
            post_execution: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_on_success(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    pub fn with_on_error(mut self, hook: impl Fn(&anyhow::Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn with_post_execution(
        mut self,
        hook: impl Fn(Option<&anyhow::Error>) + Send + Sync + 'static,
    ) -> Self {
        self.post_execution = Some(Arc::new(hook));
        self
    }
}

struct RegisteredJob {
    job: Job,
    schedule: Schedule,
    /// Single-flight guard: a tick that finds it held is dropped, not queued.
    guard: Mutex<()>,
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

/// Owns the job registry and the storage handle for the ledger. Construct and
/// register single-threaded, then call [`CronScheduler::start`]; the job list
/// is never mutated afterwards.
pub struct CronScheduler {
    source: String,
    storage: Arc<dyn StoragePort>,
    logger: Logger,
    jobs: Vec<Arc<RegisteredJob>>,
}

impl CronScheduler {
    pub fn new(source: impl Into<String>, storage: Arc<dyn StoragePort>, logger: Logger) -> Self {
        Self { source: source.into(), storage, logger, jobs: Vec::new() }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.job.name.as_str()).collect()
    }

    /// Validate the job, write its initial ledger record and add it to the
    /// registry. A ledger failure here is a registration failure.
    pub async fn register(&mut self, job: Job) -> Result<(), SchedulerError> {
        if job.name.is_empty() {
            return Err(SchedulerError::InvalidJobSpec("name has to be specified".into()));
        }
        if job.freq.is_empty() {
            return Err(SchedulerError::InvalidJobSpec("frequency has to be specified".into()));
        }
        if self.jobs.iter().any(|j| j.job.name == job.name) {
            return Err(SchedulerError::DuplicateJob(job.name));
        }
        let schedule = Schedule::parse(&job.freq)?;

        self.storage
            .register_job(
                &self.source,
                &job.name,
                &job.freq,
                &job.description,
                JobStatus::Initialized,
                None,
            )
            .await?;

        self.jobs.push(Arc::new(RegisteredJob { job, schedule, guard: Mutex::new(()) }));
        Ok(())
    }

    /// Begin dispatching. Non-blocking; one timer loop per job. The caller
    /// owns the process lifetime and stops everything through `cancel`.
    pub fn start(&self, cancel: CancellationToken) {
        for reg in &self.jobs {
            tokio::spawn(dispatch_loop(
                self.source.clone(),
                Arc::clone(reg),
                Arc::clone(&self.storage),
                self.logger.clone(),
                cancel.clone(),
            ));
        }
    }
}

async fn dispatch_loop(
    source: String,
    reg: Arc<RegisteredJob>,
    storage: Arc<dyn StoragePort>,
    logger: Logger,
    cancel: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let Some(next) = reg.schedule.next_after(now) else {
            logger.warn(
                &format!("job {} has no upcoming fire time, stopping dispatch", reg.job.name),
                None,
            );
            return;
        };
        let delay = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        // Ticks run on their own task so a slow body never delays the timer;
        // overlap protection comes from the guard instead.
        tokio::spawn(run_tick(
            source.clone(),
            Arc::clone(&reg),
            Arc::clone(&storage),
            logger.clone(),
            cancel.clone(),
        ));
    }
}

/// One tick of one job, following the fixed per-execution protocol. Ledger
/// errors accumulate and surface through the logger; the job's own
/// success/failure classification depends only on its body's result.
async fn run_tick(
    source: String,
    reg: Arc<RegisteredJob>,
    storage: Arc<dyn StoragePort>,
    logger: Logger,
    cancel: CancellationToken,
) {
    let job = &reg.job;
    let name = job.name.as_str();

    let Ok(_guard) = reg.guard.try_lock() else {
        logger.debug(
            &format!("job {name} already running, skipping tick"),
            Some(log_fields! { "name" => name }),
        );
        return;
    };

    let mut ledger_errors: Vec<String> = Vec::new();

    if let Err(err) = storage
        .register_job(&source, name, &job.freq, &job.description, JobStatus::Running, None)
        .await
    {
        ledger_errors.push(format!("failed to set job {name} to running: {err}"));
    }

    let initialized_at = Utc::now();
    let result = (job.func)(cancel.clone()).await;

    match &result {
        Ok(()) => {
            if let Some(hook) = &job.on_success {
                hook();
            }
        }
        Err(err) => {
            if let Some(hook) = &job.on_error {
                hook(err);
            }
        }
    }
    if let Some(hook) = &job.post_execution {
        hook(result.as_ref().err());
    }

    let error_text = result.as_ref().err().map(|e| format!("{e:#}"));
    let execution = ExecutionRecord::new(&source, name, initialized_at, error_text.as_deref());
    if let Err(err) = storage.append_execution(&execution).await {
        ledger_errors.push(format!("failed to register execution for {name}: {err}"));
    }

    if let Err(err) = storage
        .register_job(
            &source,
            name,
            &job.freq,
            &job.description,
            JobStatus::Done,
            error_text.as_deref(),
        )
        .await
    {
        ledger_errors.push(format!("failed to set job {name} to done: {err}"));
    }

    if !ledger_errors.is_empty() {
        logger.error(&ledger_errors.join("; "), Some(log_fields! { "name" => name }));
    }
}
