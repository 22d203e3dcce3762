use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Cron expression parser
// ---------------------------------------------------------------------------

/// A parsed 5-field cron expression.
/// Each field holds the sorted set of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    pub minutes: Vec<u8>, // 0-59
    pub hours: Vec<u8>,   // 0-23
    pub doms: Vec<u8>,    // 1-31
    pub months: Vec<u8>,  // 1-12
    pub dows: Vec<u8>,    // 0-6, 0 = Sunday
}

impl CronExpr {
    /// Fields: `MIN HOUR DOM MON DOW`. Each supports `*`, `N`, `N-M`, `*/S`,
    /// `N-M/S`, `N/S` and comma-separated lists.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Schedule(format!(
                "cron expression must have 5 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            doms: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            dows: parse_field(fields[4], 0, 6)?,
        })
    }

    pub fn matches(&self, at: &DateTime<Utc>) -> bool {
        self.minutes.contains(&(at.minute() as u8))
            && self.hours.contains(&(at.hour() as u8))
            && self.doms.contains(&(at.day() as u8))
            && self.months.contains(&(at.month() as u8))
            && self.dows.contains(&(at.weekday().num_days_from_sunday() as u8))
    }
}

fn parse_num(s: &str, what: &str) -> Result<u8> {
    s.parse()
        .map_err(|_| Error::Schedule(format!("invalid {what}: {s}")))
}

fn parse_bounds(s: &str, min: u8, max: u8) -> Result<(u8, u8)> {
    let (lo, hi) = match s.split_once('-') {
        Some((lo, hi)) => (parse_num(lo, "range start")?, parse_num(hi, "range end")?),
        None => {
            let v = parse_num(s, "value")?;
            (v, v)
        }
    };
    if lo < min || hi > max || lo > hi {
        return Err(Error::Schedule(format!(
            "{s} out of bounds ({min}-{max})"
        )));
    }
    Ok((lo, hi))
}

fn parse_field(field: &str, min: u8, max: u8) -> Result<Vec<u8>> {
    let mut values = Vec::new();

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = parse_num(step, "step value")?;
                if step == 0 {
                    return Err(Error::Schedule("step value must be > 0".into()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = match (range, step) {
            ("*", _) => (min, max),
            // "N/S" runs from N to the end of the field
            (r, Some(_)) if !r.contains('-') => (parse_bounds(r, min, max)?.0, max),
            (r, _) => parse_bounds(r, min, max)?,
        };

        values.extend(
            (start..=end).step_by(step.unwrap_or(1) as usize),
        );
    }

    values.sort_unstable();
    values.dedup();
    Ok(values)
}

// ---------------------------------------------------------------------------
// Interval parser
// ---------------------------------------------------------------------------

/// Parse an interval like "30s", "5m" or "2h".
pub fn parse_interval(s: &str) -> Result<Duration> {
    let s = s.trim();
    let Some(unit) = s.chars().last() else {
        return Err(Error::Schedule("empty interval string".into()));
    };
    let secs_per_unit = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        _ => {
            return Err(Error::Schedule(format!(
                "interval must end with 's', 'm', or 'h': {s}"
            )));
        }
    };
    let num = &s[..s.len() - 1];
    let n: u64 = num
        .parse()
        .map_err(|_| Error::Schedule(format!("invalid interval number: {num}")))?;
    if n == 0 {
        return Err(Error::Schedule("interval must be > 0".into()));
    }
    let secs = n
        .checked_mul(secs_per_unit)
        .ok_or_else(|| Error::Schedule(format!("interval too large: {s}")))?;
    Ok(Duration::from_secs(secs))
}

// ---------------------------------------------------------------------------
// Recurrence
// ---------------------------------------------------------------------------

/// When a job fires: on cron-matching minutes or at a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    Cron(CronExpr),
    Every(Duration),
}

impl FromStr for Recurrence {
    type Err = Error;

    fn from_str(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let cron = match expr {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            _ => match expr.strip_prefix("@every") {
                Some(interval) => return parse_interval(interval).map(Recurrence::Every),
                None => expr,
            },
        };
        CronExpr::parse(cron).map(Recurrence::Cron)
    }
}

impl Recurrence {
    /// Whether a job last run at `last_run` (or registered at `since`, if it
    /// never ran) is due at `now`.
    pub fn is_due(
        &self,
        now: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
        since: DateTime<Utc>,
    ) -> bool {
        match self {
            Recurrence::Cron(expr) => {
                // at most once per matching minute
                let same_minute = last_run.is_some_and(|last| {
                    last.timestamp().div_euclid(60) == now.timestamp().div_euclid(60)
                });
                expr.matches(&now) && !same_minute
            }
            Recurrence::Every(interval) => {
                let elapsed = now - last_run.unwrap_or(since);
                elapsed.to_std().is_ok_and(|e| e >= *interval)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl JobId {
    pub fn get(self) -> u64 {
        self.0
    }
}

type Task = Arc<dyn Fn() -> Result<()> + Send + Sync>;

struct Job {
    expression: String,
    recurrence: Recurrence,
    registered: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    run_count: u64,
    task: Task,
}

type Jobs = Arc<Mutex<BTreeMap<JobId, Job>>>;

/// Snapshot of one registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: JobId,
    pub expression: String,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
}

/// Recurring-task scheduler.
///
/// Jobs are checked on a background worker thread every `tick`; the worker is
/// started by the first registration and stopped on [`Scheduler::shutdown`]
/// or drop.
pub struct Scheduler {
    jobs: Jobs,
    next_id: AtomicU64,
    tick: Duration,
    worker: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            jobs: Arc::default(),
            next_id: AtomicU64::new(1),
            tick,
            worker: Mutex::new(None),
        }
    }

    /// Register `task` to run whenever `expression` is due.
    /// A malformed expression fails here, not on a later tick.
    pub fn add<F>(&self, expression: &str, task: F) -> Result<JobId>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let recurrence: Recurrence = expression.parse()?;
        // a job is only registered once a worker exists to run it
        self.start()?;
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.jobs.lock().unwrap().insert(
            id,
            Job {
                expression: expression.to_string(),
                recurrence,
                registered: Utc::now(),
                last_run: None,
                run_count: 0,
                task: Arc::new(task),
            },
        );
        tracing::info!(job = %id, expression, "scheduled job");
        Ok(id)
    }

    pub fn remove(&self, id: JobId) -> bool {
        self.jobs.lock().unwrap().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .map(|(id, job)| JobInfo {
                id: *id,
                expression: job.expression.clone(),
                last_run: job.last_run,
                run_count: job.run_count,
            })
            .collect()
    }

    /// Run every job due at `now`; returns how many ran.
    pub fn run_due(&self, now: DateTime<Utc>) -> usize {
        run_due_jobs(&self.jobs, now)
    }

    /// Start the worker thread if it is not running yet.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel();
        let jobs = Arc::clone(&self.jobs);
        let tick = self.tick;
        let handle = std::thread::Builder::new()
            .name("elemental-scheduler".into())
            .spawn(move || scheduler_loop(jobs, tick, rx))
            .map_err(|e| Error::Schedule(format!("failed to start scheduler: {e}")))?;
        *worker = Some((tx, handle));
        Ok(())
    }

    /// Stop the worker thread and wait for it. Registered jobs are kept.
    pub fn shutdown(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some((tx, handle)) = worker {
            let _ = tx.send(());
            let _ = handle.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The worker body: wakes every `tick` and runs due jobs until a shutdown
/// message arrives or the sender is dropped.
fn scheduler_loop(jobs: Jobs, tick: Duration, rx: mpsc::Receiver<()>) {
    loop {
        match rx.recv_timeout(tick) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        run_due_jobs(&jobs, Utc::now());
    }
}

fn run_due_jobs(jobs: &Jobs, now: DateTime<Utc>) -> usize {
    // mark and collect under the lock, run outside it
    let due: Vec<(JobId, Task)> = {
        let mut jobs = jobs.lock().unwrap();
        jobs.iter_mut()
            .filter(|(_, job)| job.recurrence.is_due(now, job.last_run, job.registered))
            .map(|(id, job)| {
                job.last_run = Some(now);
                job.run_count += 1;
                (*id, Arc::clone(&job.task))
            })
            .collect()
    };

    for (id, task) in &due {
        if let Err(e) = task() {
            tracing::warn!(job = %id, error = %e, "scheduled job failed");
        }
    }
    due.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn parse_cron_star() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        assert_eq!(expr.minutes.len(), 60);
        assert_eq!(expr.hours.len(), 24);
        assert_eq!(expr.doms.len(), 31);
        assert_eq!(expr.months.len(), 12);
        assert_eq!(expr.dows.len(), 7);
    }

    #[test]
    fn parse_cron_steps_ranges_lists() {
        let expr = CronExpr::parse("*/15 9-17 1,15 * 1-5").unwrap();
        assert_eq!(expr.minutes, vec![0, 15, 30, 45]);
        assert_eq!(expr.hours, (9..=17).collect::<Vec<_>>());
        assert_eq!(expr.doms, vec![1, 15]);
        assert_eq!(expr.dows, vec![1, 2, 3, 4, 5]);

        let stepped = CronExpr::parse("0-30/10 5/6 * * *").unwrap();
        assert_eq!(stepped.minutes, vec![0, 10, 20, 30]);
        assert_eq!(stepped.hours, vec![5, 11, 17, 23]);
    }

    #[test]
    fn parse_cron_rejects_bad_input() {
        assert!(CronExpr::parse("* *").is_err());
        assert!(CronExpr::parse("* * * * * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 25 * * *").is_err());
        assert!(CronExpr::parse("* * 0 * *").is_err());
        assert!(CronExpr::parse("* * * 13 *").is_err());
        assert!(CronExpr::parse("* * * * 7").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
    }

    #[test]
    fn cron_matches_weekdays() {
        let expr = CronExpr::parse("0 9 * * 1-5").unwrap();
        // 2026-02-20 is a Friday, 2026-02-22 a Sunday
        assert!(expr.matches(&at(2026, 2, 20, 9, 0, 0)));
        assert!(!expr.matches(&at(2026, 2, 22, 9, 0, 0)));
        assert!(!expr.matches(&at(2026, 2, 20, 9, 1, 0)));
    }

    #[test]
    fn intervals() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval(" 5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_interval("").is_err());
        assert!(parse_interval("abc").is_err());
        assert!(parse_interval("0s").is_err());
        assert!(parse_interval("5d").is_err());
        assert!(matches!(
            parse_interval("9999999999999999999h"),
            Err(Error::Schedule(_))
        ));
    }

    #[test]
    fn recurrence_descriptors() {
        assert_eq!(
            "@every 30s".parse::<Recurrence>().unwrap(),
            Recurrence::Every(Duration::from_secs(30))
        );
        assert_eq!(
            "@daily".parse::<Recurrence>().unwrap(),
            Recurrence::Cron(CronExpr::parse("0 0 * * *").unwrap())
        );
        assert!("@fortnightly".parse::<Recurrence>().is_err());
    }

    #[test]
    fn cron_runs_once_per_minute() {
        let rec: Recurrence = "* * * * *".parse().unwrap();
        let now = at(2026, 2, 20, 15, 30, 10);
        let since = at(2026, 2, 20, 15, 0, 0);
        assert!(rec.is_due(now, None, since));
        assert!(!rec.is_due(now, Some(at(2026, 2, 20, 15, 30, 1)), since));
        assert!(rec.is_due(now, Some(at(2026, 2, 20, 15, 29, 59)), since));
    }

    #[test]
    fn interval_counts_from_registration() {
        let rec: Recurrence = "@every 30s".parse().unwrap();
        let since = at(2026, 2, 20, 15, 0, 0);
        assert!(!rec.is_due(at(2026, 2, 20, 15, 0, 10), None, since));
        assert!(rec.is_due(at(2026, 2, 20, 15, 0, 30), None, since));
        assert!(!rec.is_due(
            at(2026, 2, 20, 15, 0, 40),
            Some(at(2026, 2, 20, 15, 0, 30)),
            since
        ));
    }

    #[test]
    fn run_due_fires_and_records() {
        let scheduler = Scheduler::new(Duration::from_secs(3600));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = scheduler
            .add("* * * * *", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let now = Utc::now() + chrono::Duration::minutes(1);
        assert_eq!(scheduler.run_due(now), 1);
        assert_eq!(scheduler.run_due(now), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let info = &scheduler.jobs()[0];
        assert_eq!(info.id, id);
        assert_eq!(info.run_count, 1);
        assert_eq!(info.last_run, Some(now));

        assert!(scheduler.remove(id));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn failing_job_does_not_stop_others() {
        let scheduler = Scheduler::new(Duration::from_secs(3600));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        scheduler
            .add("* * * * *", || Err(Error::Custom("boom".into())))
            .unwrap();
        scheduler
            .add("* * * * *", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(scheduler.run_due(Utc::now()), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_expression_is_rejected_at_registration() {
        let scheduler = Scheduler::default();
        assert!(matches!(
            scheduler.add("every tuesday", || Ok(())),
            Err(Error::Schedule(_))
        ));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn oversized_interval_is_rejected_at_registration() {
        let scheduler = Scheduler::default();
        assert!(matches!(
            scheduler.add("@every 9999999999999999999h", || Ok(())),
            Err(Error::Schedule(_))
        ));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn add_after_shutdown_restarts_the_worker() {
        let scheduler = Scheduler::new(Duration::from_millis(20));
        scheduler.start().unwrap();
        scheduler.shutdown();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        scheduler
            .add("@every 1s", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(scheduler.len(), 1);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        scheduler.shutdown();
        assert!(hits.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn worker_thread_fires_interval_jobs() {
        let scheduler = Scheduler::new(Duration::from_millis(20));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        scheduler
            .add("@every 1s", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        scheduler.shutdown();
        assert!(hits.load(Ordering::SeqCst) >= 1);
    }
}
