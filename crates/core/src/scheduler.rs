use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

use crate::clock::{secs, Clock};
use crate::error::EngineError;
use crate::lock::LockManager;
use crate::orchestrator::CycleSummary;
use crate::settings::{ScheduleMode, ScheduleSettings, TimeWindow};
use crate::state::StopSignal;

const MAX_SLEEP: Duration = Duration::from_secs(60);

pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

fn date_seed(date: NaiveDate) -> u64 {
    date.year() as u64 * 10_000 + date.month() as u64 * 100 + date.day() as u64
}

fn minute_of(t: NaiveTime) -> i64 {
    (t.hour() * 60 + t.minute()) as i64
}

fn at_minute(m: i64) -> NaiveTime {
    let m = m.clamp(0, 24 * 60 - 1) as u32;
    NaiveTime::from_hms_opt(m / 60, m % 60, 0).unwrap_or(NaiveTime::MIN)
}

/// Trigger times for `date`, sorted. Random picks are seeded by the date so
/// a restart on the same day reproduces the same plan.
pub fn daily_times(schedule: &ScheduleSettings, date: NaiveDate) -> Vec<NaiveTime> {
    let mut rng = StdRng::seed_from_u64(date_seed(date));
    let mut times: Vec<NaiveTime> = match schedule.mode {
        ScheduleMode::FixedTimes => schedule
            .fixed_times
            .iter()
            .filter_map(|s| {
                let t = parse_hhmm(s);
                if t.is_none() {
                    warn!(time = %s, "ignoring malformed schedule time");
                }
                t
            })
            .map(|t| {
                let j = schedule.jitter_minutes as i64;
                if j == 0 {
                    t
                } else {
                    at_minute(minute_of(t) + rng.gen_range(-j..=j))
                }
            })
            .collect(),
        ScheduleMode::RandomWindow => schedule
            .windows
            .iter()
            .flat_map(|w| pick_in_window(w, schedule, &mut rng))
            .collect(),
    };
    times.sort();
    times.dedup();
    times
}

fn pick_in_window(w: &TimeWindow, schedule: &ScheduleSettings, rng: &mut StdRng) -> Vec<NaiveTime> {
    let runs = schedule.runs_per_window;
    let (Some(start), Some(end)) = (parse_hhmm(&w.start), parse_hhmm(&w.end)) else {
        warn!(start = %w.start, end = %w.end, "ignoring malformed schedule window");
        return Vec::new();
    };
    let (lo, hi) = (minute_of(start), minute_of(end));
    if hi <= lo {
        warn!(start = %w.start, end = %w.end, "schedule window is empty");
        return Vec::new();
    }
    let (gap, jitter) = (schedule.min_gap_minutes as i64, schedule.jitter_minutes as i64);
    let mut picked: Vec<i64> = Vec::new();
    for _ in 0..runs.saturating_mul(50) {
        if picked.len() as u32 >= runs {
            break;
        }
        let mut m = rng.gen_range(lo..hi);
        if jitter > 0 {
            m = (m + rng.gen_range(-jitter..=jitter)).clamp(lo, hi - 1);
        }
        if picked.iter().all(|p| (p - m).abs() >= gap) {
            picked.push(m);
        }
    }
    if (picked.len() as u32) < runs {
        warn!(start = %w.start, end = %w.end, wanted = runs, got = picked.len(), "window too small for min gap");
    }
    picked.into_iter().map(at_minute).collect()
}

/// Pop every time that is due. Several missed times collapse into a
/// single trigger, so the return value is only interesting as `> 0`.
pub fn take_due(queue: &mut VecDeque<NaiveDateTime>, now: NaiveDateTime) -> usize {
    let mut n = 0;
    while queue.front().map_or(false, |t| *t <= now) {
        queue.pop_front();
        n += 1;
    }
    n
}

/// Plans one day at a time and reports due triggers.
pub struct Scheduler<'a> {
    schedule: &'a ScheduleSettings,
    day: Option<NaiveDate>,
    queue: VecDeque<NaiveDateTime>,
}

impl<'a> Scheduler<'a> {
    pub fn new(schedule: &'a ScheduleSettings) -> Self {
        Self { schedule, day: None, queue: VecDeque::new() }
    }

    fn plan(&mut self, now: NaiveDateTime) {
        let date = now.date();
        let first = self.day.is_none();
        self.day = Some(date);
        self.queue = daily_times(self.schedule, date)
            .into_iter()
            .map(|t| date.and_time(t))
            // times that passed before startup are not owed
            .filter(|t| !first || *t >= now)
            .collect();
        let plan: Vec<String> = self.queue.iter().map(|t| t.format("%H:%M").to_string()).collect();
        info!(date = %date, times = ?plan, "schedule planned");
    }

    /// Whether a trigger is due at `now`.
    pub fn poll(&mut self, now: NaiveDateTime) -> bool {
        if self.day != Some(now.date()) {
            self.plan(now);
        }
        let due = take_due(&mut self.queue, now);
        if due > 1 {
            warn!(missed = due - 1, "coalescing missed schedule times");
        }
        due > 0
    }

    pub fn next_due(&self) -> Option<NaiveDateTime> {
        self.queue.front().copied()
    }

    /// Poll until `shutdown` is set, sleeping at most a minute at a time.
    /// `now` supplies local wall-clock time.
    pub fn run(
        &mut self,
        shutdown: &AtomicBool,
        clock: &dyn Clock,
        now: impl Fn() -> NaiveDateTime,
        mut trigger: impl FnMut(),
    ) {
        info!("scheduler started");
        while !shutdown.load(Ordering::Acquire) {
            let t = now();
            if self.poll(t) {
                info!(at = %t.format("%H:%M:%S"), "schedule trigger");
                trigger();
                continue;
            }
            let wait = self
                .next_due()
                .and_then(|next| (next - t).to_std().ok())
                .map_or(MAX_SLEEP, |d| d.clamp(secs(1), MAX_SLEEP));
            clock.sleep(wait);
        }
        info!("scheduler stopped");
    }
}

/// Run the schedule against the local wall clock until `shutdown` is set.
pub fn run_scheduler(schedule: &ScheduleSettings, shutdown: &AtomicBool, clock: &dyn Clock, trigger: impl FnMut()) {
    Scheduler::new(schedule).run(shutdown, clock, || Local::now().naive_local(), trigger);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Another cycle holds the execution lock.
    Busy,
    StopRequested,
    Ran(CycleSummary),
    Failed(String),
}

/// Run `job` under the execution lock. Never waits for the lock.
pub fn fire(
    lock: &LockManager,
    stop: &StopSignal,
    job: impl FnOnce() -> Result<CycleSummary, EngineError>,
) -> TriggerOutcome {
    let Some(_guard) = lock.guard() else {
        info!("trigger skipped, a cycle is already running");
        return TriggerOutcome::Busy;
    };
    if stop.is_set() {
        info!("trigger skipped, stop flag is set");
        return TriggerOutcome::StopRequested;
    }
    match job() {
        Ok(summary) => TriggerOutcome::Ran(summary),
        Err(e) => {
            error!(error = %e, "cycle failed");
            TriggerOutcome::Failed(e.to_string())
        }
    }
}
