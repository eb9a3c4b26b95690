//! Per-run liveness timers.

use chrono::{DateTime, Duration, Utc};

use crate::config::WatchdogConfig;
use crate::run::{Run, WorkflowPhase};
use crate::timers::{TimerKey, TimerQueue};

pub const TIMEOUT_ERROR_CODE: &str = "WATCHDOG_TIMEOUT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// The run already ended; its timer should go away.
    Terminal,
    Alive { elapsed_ms: i64, timeout_ms: u64 },
    TimedOut {
        elapsed_ms: i64,
        timeout_ms: u64,
        phase: WorkflowPhase,
    },
}

impl WatchdogVerdict {
    /// Failure text for a timed-out run.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        match self {
            Self::TimedOut {
                elapsed_ms,
                timeout_ms,
                phase,
            } => Some(format!(
                "Timeout: no activity for {}s during {} phase (limit {}s)",
                elapsed_ms / 1_000,
                phase.as_str(),
                timeout_ms / 1_000
            )),
            Self::Terminal | Self::Alive { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    config: WatchdogConfig,
}

impl Watchdog {
    #[must_use]
    pub fn new(config: WatchdogConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn timeout_for(&self, phase: WorkflowPhase) -> u64 {
        self.config.timeouts.for_phase(phase)
    }

    #[must_use]
    pub fn default_timeout(&self) -> u64 {
        self.config.timeouts.default
    }

    /// Starts the run's timer unless one is already pending.
    pub fn start(&self, run: &mut Run, now: DateTime<Utc>, timers: &mut TimerQueue) {
        if run.terminal || run.watchdog.timer_handle.is_some() {
            return;
        }
        run.watchdog.last_heartbeat_at = now;
        self.schedule_tick(run, now, timers);
    }

    /// Records activity and re-reads the timeout for the run's current phase.
    pub fn heartbeat(&self, run: &mut Run, now: DateTime<Utc>) {
        run.watchdog.last_heartbeat_at = now;
        run.watchdog.timeout_ms = self.timeout_for(run.workflow_phase);
    }

    #[must_use]
    pub fn check(&self, run: &Run, now: DateTime<Utc>) -> WatchdogVerdict {
        if run.terminal {
            return WatchdogVerdict::Terminal;
        }
        let elapsed_ms = (now - run.watchdog.last_heartbeat_at).num_milliseconds();
        let timeout_ms = run.watchdog.timeout_ms;
        if elapsed_ms > i64::try_from(timeout_ms).unwrap_or(i64::MAX) {
            WatchdogVerdict::TimedOut {
                elapsed_ms,
                timeout_ms,
                phase: run.workflow_phase,
            }
        } else {
            WatchdogVerdict::Alive {
                elapsed_ms,
                timeout_ms,
            }
        }
    }

    /// Schedules the next periodic check.
    pub fn schedule_tick(&self, run: &mut Run, now: DateTime<Utc>, timers: &mut TimerQueue) {
        let interval = Duration::milliseconds(
            i64::try_from(self.config.tick_interval_ms.max(1)).unwrap_or(i64::MAX),
        );
        run.watchdog.timer_handle =
            Some(timers.schedule(TimerKey::Watchdog(run.run_id.clone()), now + interval));
    }

    /// Stops the run's timer. Returns true only for the call that actually
    /// stopped it.
    pub fn stop(&self, run: &mut Run, timers: &mut TimerQueue) -> bool {
        match run.watchdog.timer_handle.take() {
            Some(handle) => {
                timers.cancel(handle);
                true
            }
            None => false,
        }
    }

    /// Stops every running timer; returns how many were stopped.
    pub fn stop_all<'a, I>(&self, runs: I, timers: &mut TimerQueue) -> usize
    where
        I: IntoIterator<Item = &'a mut Run>,
    {
        runs.into_iter()
            .filter(|run| run.watchdog.timer_handle.is_some())
            .map(|run| self.stop(run, timers))
            .filter(|stopped| *stopped)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{Watchdog, WatchdogVerdict};
    use crate::config::WatchdogConfig;
    use crate::run::{Run, RunOrigin, WorkflowPhase};
    use crate::timers::TimerQueue;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0)
            .single()
            .expect("valid timestamp")
            + Duration::milliseconds(ms)
    }

    fn verify_run(watchdog: &Watchdog) -> Run {
        let mut run = Run::new("run-1", RunOrigin::Placeholder, at_ms(0), watchdog.default_timeout());
        run.workflow_phase = WorkflowPhase::Verify;
        watchdog.heartbeat(&mut run, at_ms(0));
        run
    }

    #[test]
    fn verify_phase_times_out_only_past_its_limit() {
        let watchdog = Watchdog::new(WatchdogConfig::default());
        let run = verify_run(&watchdog);
        assert_eq!(run.watchdog.timeout_ms, 120_000);

        assert!(matches!(
            watchdog.check(&run, at_ms(60_000)),
            WatchdogVerdict::Alive { .. }
        ));
        assert!(matches!(
            watchdog.check(&run, at_ms(120_000)),
            WatchdogVerdict::Alive { .. }
        ));
        let verdict = watchdog.check(&run, at_ms(120_001));
        let message = verdict.failure_message().expect("timed out");
        assert!(message.contains("Timeout"), "{message}");
        assert!(message.contains("verify"), "{message}");
    }

    #[test]
    fn heartbeat_uses_phase_specific_timeout() {
        let watchdog = Watchdog::new(WatchdogConfig::default());
        let mut run = Run::new("run-1", RunOrigin::Placeholder, at_ms(0), watchdog.default_timeout());
        run.workflow_phase = WorkflowPhase::Spec;
        watchdog.heartbeat(&mut run, at_ms(1_000));
        assert_eq!(run.watchdog.timeout_ms, 60_000);
        assert!(matches!(
            watchdog.check(&run, at_ms(61_001)),
            WatchdogVerdict::Alive { .. }
        ));
        assert!(matches!(
            watchdog.check(&run, at_ms(61_002)),
            WatchdogVerdict::TimedOut { .. }
        ));
    }

    #[test]
    fn stop_happens_once_and_stop_all_tolerates_no_timers() {
        let watchdog = Watchdog::new(WatchdogConfig::default());
        let mut timers = TimerQueue::new();
        assert_eq!(watchdog.stop_all(Vec::<&mut Run>::new(), &mut timers), 0);

        let mut first = verify_run(&watchdog);
        let mut second = verify_run(&watchdog);
        watchdog.start(&mut first, at_ms(0), &mut timers);
        watchdog.start(&mut second, at_ms(0), &mut timers);
        assert_eq!(timers.len(), 2);

        assert!(watchdog.stop(&mut first, &mut timers));
        assert!(!watchdog.stop(&mut first, &mut timers));
        assert_eq!(watchdog.stop_all([&mut first, &mut second], &mut timers), 1);
        assert!(timers.is_empty());
        assert_eq!(watchdog.stop_all([&mut first, &mut second], &mut timers), 0);
    }
}
