/// Cron reconciliation scheduler
///
/// A background loop that keeps a live tokio-cron-scheduler engine in sync
/// with the stored flows. Every tick derives the desired `flow → expression`
/// map from non-archived flows (first `cron` node wins) and compares it with
/// what is installed. Identical maps are a no-op; any difference tears down
/// the running engine and starts a fresh one with one job per flow.
///
/// Jobs only create and dispatch runs, so they need no shared state beyond
/// the dispatcher and may fire concurrently with each other and the loop.

use crate::{
    runtime::orchestrator::RunDispatcher,
    workflow::{store::FlowStore, types::FlowDefinition},
};
use anyhow::Result;
use serde_json::json;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

/// Default reconciliation interval
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(15);

/// Day-of-week names; the engine counts days from 1 = Sunday, standard
/// five-field cron from 0 = Sunday, so numbers are rewritten as names
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Why a schedule expression was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("empty cron expression")]
    Empty,

    #[error("cron expression '{0}' must have 5, 6 or 7 fields")]
    FieldCount(String),

    #[error("unknown cron descriptor '{0}'")]
    UnknownDescriptor(String),

    #[error("invalid @every duration '{0}'")]
    InvalidDuration(String),

    #[error("invalid day-of-week field '{0}'")]
    InvalidWeekday(String),
}

/// A normalized schedule the engine can register
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronSpec {
    /// Six/seven-field expression (seconds first)
    Expression(String),
    /// Fixed interval from `@every <duration>`
    Every(Duration),
}

/// Normalize a stored cron expression
///
/// Five-field expressions gain a leading seconds field of `0`; six and seven
/// field expressions pass through; `@` descriptors become explicit
/// expressions and `@every 1h30m` a fixed interval.
pub fn parse_schedule(raw: &str) -> Result<CronSpec, ScheduleError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ScheduleError::Empty);
    }

    if let Some(descriptor) = trimmed.strip_prefix('@') {
        let mut parts = descriptor.split_whitespace();
        let name = parts.next().unwrap_or_default().to_lowercase();
        let expression = match name.as_str() {
            "yearly" | "annually" => "0 0 0 1 1 *",
            "monthly" => "0 0 0 1 * *",
            "weekly" => "0 0 0 * * SUN",
            "daily" | "midnight" => "0 0 0 * * *",
            "hourly" => "0 0 * * * *",
            "every" => {
                let rest = parts.collect::<Vec<_>>().join("");
                return parse_duration(&rest)
                    .map(CronSpec::Every)
                    .ok_or(ScheduleError::InvalidDuration(rest));
            }
            _ => return Err(ScheduleError::UnknownDescriptor(trimmed.to_string())),
        };
        return Ok(CronSpec::Expression(expression.to_string()));
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.len() {
        5 => {
            let weekday = normalize_weekday(fields[4])?;
            Ok(CronSpec::Expression(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], weekday
            )))
        }
        6 | 7 => Ok(CronSpec::Expression(fields.join(" "))),
        _ => Err(ScheduleError::FieldCount(trimmed.to_string())),
    }
}

/// Rewrite numeric five-field weekdays (0/7 = Sunday) as names
fn normalize_weekday(field: &str) -> Result<String, ScheduleError> {
    let invalid = || ScheduleError::InvalidWeekday(field.to_string());
    let name = |token: &str| -> Result<String, ScheduleError> {
        match token.parse::<usize>() {
            Ok(day) if day <= 7 => Ok(WEEKDAYS[day % 7].to_string()),
            Ok(_) => Err(invalid()),
            Err(_) => Ok(token.to_string()),
        }
    };

    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let rendered = match range.split_once('-') {
            Some((start, "7")) if step.is_none() && start != "0" && start != "7" => {
                format!("{}-SAT,SUN", name(start)?)
            }
            Some((start, end)) => format!("{}-{}", name(start)?, name(end)?),
            None if range == "*" => range.to_string(),
            None => name(range)?,
        };
        items.push(match step {
            Some(step) => format!("{}/{}", rendered, step),
            None => rendered,
        });
    }
    Ok(items.join(","))
}

/// `1h30m`, `90s`, `15m`, `500ms`; a bare number means seconds
fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = text.parse::<u64>() {
        return (secs > 0).then(|| Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let amount: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            'h' => Duration::from_secs(3600),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(1)
            }
            'm' => Duration::from_secs(60),
            's' => Duration::from_secs(1),
            _ => return None,
        };
        total += unit.checked_mul(u32::try_from(amount).ok()?)?;
    }
    if !digits.is_empty() || total.is_zero() {
        return None;
    }
    Some(total)
}

/// What one reconciliation pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Unchanged,
    Restarted { jobs: usize },
}

#[derive(Default)]
struct ScheduleState {
    /// Installed `flow id → expression`, exactly as stored
    current: BTreeMap<String, String>,
    engine: Option<JobScheduler>,
}

/// Keeps cron jobs in sync with stored flows
pub struct CronReconciler {
    flows: Arc<dyn FlowStore>,
    dispatcher: Arc<RunDispatcher>,
    tick_interval: Duration,
    state: Mutex<ScheduleState>,
    restarts: AtomicU64,
}

impl CronReconciler {
    pub fn new(flows: Arc<dyn FlowStore>, dispatcher: Arc<RunDispatcher>, tick_interval: Duration) -> Self {
        Self {
            flows,
            dispatcher,
            tick_interval,
            state: Mutex::new(ScheduleState::default()),
            restarts: AtomicU64::new(0),
        }
    }

    /// Number of engine restarts performed so far
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Currently installed schedule
    pub async fn current_schedule(&self) -> BTreeMap<String, String> {
        self.state.lock().await.current.clone()
    }

    /// Desired `flow id → expression` from stored, non-archived flows
    pub async fn desired_schedule(&self) -> Result<BTreeMap<String, String>> {
        let mut desired = BTreeMap::new();
        for record in self.flows.list_flows().await? {
            if record.archived {
                continue;
            }
            let flow = match FlowDefinition::parse(&record.definition) {
                Ok(flow) => flow,
                Err(e) => {
                    tracing::debug!("⏭️ Skipping flow {} with unreadable definition: {}", record.id, e);
                    continue;
                }
            };
            if let Some(expression) = flow.cron_expression().filter(|e| !e.is_empty()) {
                desired.insert(record.id.clone(), expression.to_string());
            }
        }
        Ok(desired)
    }

    /// One reconciliation pass
    pub async fn reconcile_once(&self) -> Result<Reconciliation> {
        let desired = self.desired_schedule().await?;
        let mut state = self.state.lock().await;
        if state.current == desired {
            return Ok(Reconciliation::Unchanged);
        }

        tracing::info!("🔄 Cron schedule changed ({} → {} flow(s)), restarting engine",
            state.current.len(), desired.len());
        if let Some(mut engine) = state.engine.take() {
            if let Err(e) = engine.shutdown().await {
                tracing::warn!("⚠️ Failed to stop previous cron engine: {}", e);
            }
        }

        let mut jobs = 0;
        if !desired.is_empty() {
            let started = self.start_engine(&desired).await;
            let (engine, installed) = match started {
                Ok(started) => started,
                Err(e) => {
                    // Nothing is installed now; the next tick retries
                    state.current.clear();
                    return Err(e);
                }
            };
            jobs = installed;
            state.engine = Some(engine);
        }

        state.current = desired;
        self.restarts.fetch_add(1, Ordering::SeqCst);
        tracing::info!("✅ Cron engine running with {} job(s)", jobs);
        Ok(Reconciliation::Restarted { jobs })
    }

    /// Build and start a fresh engine with one job per valid schedule
    async fn start_engine(&self, desired: &BTreeMap<String, String>) -> Result<(JobScheduler, usize)> {
        let mut engine = JobScheduler::new().await?;
        let installed = async {
            let mut jobs = 0;
            for (flow_id, expression) in desired {
                let job = match self.build_job(flow_id, expression) {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::warn!("⚠️ Skipping cron schedule for flow {} ('{}'): {}", flow_id, expression, e);
                        continue;
                    }
                };
                engine.add(job).await?;
                jobs += 1;
                tracing::debug!("📝 Registered cron job for flow {} ({})", flow_id, expression);
            }
            engine.start().await?;
            Ok::<usize, anyhow::Error>(jobs)
        }
        .await;
        let jobs = discard_on_error(&mut engine, installed).await?;
        Ok((engine, jobs))
    }

    fn build_job(&self, flow_id: &str, expression: &str) -> Result<Job> {
        let spec = parse_schedule(expression)?;
        let dispatcher = Arc::clone(&self.dispatcher);
        let flow_id = flow_id.to_string();
        let expression = expression.to_string();

        let fire = move |_uuid: uuid::Uuid, _scheduler: JobScheduler| {
            let dispatcher = Arc::clone(&dispatcher);
            let flow_id = flow_id.clone();
            let expression = expression.clone();
            Box::pin(async move {
                tracing::debug!("🔔 Cron trigger activated for flow {}", flow_id);
                let payload = json!({
                    "trigger": "cron",
                    "expression": expression,
                    "fired_at": chrono::Utc::now().to_rfc3339(),
                });
                if let Err(e) = dispatcher.dispatch(&flow_id, "cron", payload).await {
                    tracing::error!("❌ Cron dispatch failed for flow {}: {}", flow_id, e);
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        };

        let job = match spec {
            CronSpec::Expression(cron) => Job::new_async(cron.as_str(), fire)?,
            CronSpec::Every(every) => Job::new_repeated_async(every, fire)?,
        };
        Ok(job)
    }

    async fn tick(&self) {
        match self.reconcile_once().await {
            Ok(Reconciliation::Unchanged) => tracing::debug!("⏰ Cron schedule unchanged"),
            Ok(Reconciliation::Restarted { .. }) => {}
            Err(e) => tracing::error!("❌ Cron reconciliation failed: {}", e),
        }
    }

    /// Stop the active engine and forget the installed schedule
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.current.clear();
        if let Some(mut engine) = state.engine.take() {
            engine.shutdown().await?;
        }
        Ok(())
    }

    /// Start the loop: one immediate pass, then one per tick interval
    pub fn spawn(self: &Arc<Self>) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let reconciler = Arc::clone(self);
        let interval = self.tick_interval;

        tracing::info!("⏰ Starting cron reconciler (every {:?})", interval);
        let join = tokio::spawn(async move {
            reconciler.tick().await;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => reconciler.tick().await,
                }
            }
            tracing::debug!("⏹️ Cron reconciliation loop exited");
        });

        SchedulerHandle {
            cancel,
            join,
            reconciler: Arc::clone(self),
        }
    }
}

/// Shut a half-built engine down before surfacing its startup error
async fn discard_on_error<T>(engine: &mut JobScheduler, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        tracing::error!("❌ Cron engine failed to start: {}", e);
        if let Err(shutdown) = engine.shutdown().await {
            tracing::warn!("⚠️ Failed to stop half-built cron engine: {}", shutdown);
        }
    }
    result
}

/// Handle to a running reconciliation loop
pub struct SchedulerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    reconciler: Arc<CronReconciler>,
}

impl SchedulerHandle {
    /// Stop the loop, wait for it to exit, then stop the cron engine
    pub async fn stop(self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron reconciler");
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!("⚠️ Cron reconciliation loop ended abnormally: {}", e);
        }
        self.reconciler.shutdown().await?;
        tracing::info!("✅ Cron reconciler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_field_gets_seconds() {
        assert_eq!(
            parse_schedule("*/5 * * * *").unwrap(),
            CronSpec::Expression("0 */5 * * * *".into())
        );
        assert_eq!(
            parse_schedule("  0 9 * * 1-5 ").unwrap(),
            CronSpec::Expression("0 0 9 * * MON-FRI".into())
        );
        assert_eq!(
            parse_schedule("30 8 * * 0,6").unwrap(),
            CronSpec::Expression("0 30 8 * * SUN,SAT".into())
        );
        assert_eq!(
            parse_schedule("0 0 * * 5-7").unwrap(),
            CronSpec::Expression("0 0 0 * * FRI-SAT,SUN".into())
        );
    }

    #[test]
    fn test_six_and_seven_fields_pass_through() {
        assert_eq!(
            parse_schedule("15 */2 * * * *").unwrap(),
            CronSpec::Expression("15 */2 * * * *".into())
        );
        assert_eq!(
            parse_schedule("0 0 12 1 1 * 2030").unwrap(),
            CronSpec::Expression("0 0 12 1 1 * 2030".into())
        );
    }

    #[test]
    fn test_descriptors() {
        assert_eq!(parse_schedule("@daily").unwrap(), CronSpec::Expression("0 0 0 * * *".into()));
        assert_eq!(parse_schedule("@Hourly").unwrap(), CronSpec::Expression("0 0 * * * *".into()));
        assert_eq!(
            parse_schedule("@every 1h30m").unwrap(),
            CronSpec::Every(Duration::from_secs(5400))
        );
        assert_eq!(parse_schedule("@every 250ms").unwrap(), CronSpec::Every(Duration::from_millis(250)));
        assert!(matches!(parse_schedule("@every soon"), Err(ScheduleError::InvalidDuration(_))));
        assert!(matches!(parse_schedule("@fortnightly"), Err(ScheduleError::UnknownDescriptor(_))));
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert_eq!(parse_schedule("   "), Err(ScheduleError::Empty));
        assert!(matches!(parse_schedule("* * *"), Err(ScheduleError::FieldCount(_))));
        assert!(matches!(parse_schedule("0 0 * * 9"), Err(ScheduleError::InvalidWeekday(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_start_stops_the_new_engine() {
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        let job = Job::new_repeated_async(Duration::from_millis(200), move |_uuid: uuid::Uuid, _scheduler: JobScheduler| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        })
        .unwrap();

        let mut engine = JobScheduler::new().await.unwrap();
        engine.add(job).await.unwrap();
        engine.start().await.unwrap();

        let failed: Result<usize> = Err(anyhow::anyhow!("job registration failed"));
        assert!(discard_on_error(&mut engine, failed).await.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_shutdown = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_shutdown);
    }
}
