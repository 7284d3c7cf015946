//! Deciding what happens after a service process ended on its own

use crate::units::{ChildTermination, RestartPolicy, ServiceState};

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitClass {
    Clean,
    Failure,
    Signal,
    Watchdog,
}

impl ExitClass {
    pub fn classify(termination: ChildTermination, watchdog_fired: bool) -> ExitClass {
        if watchdog_fired {
            return ExitClass::Watchdog;
        }
        match termination {
            ChildTermination::Exit(0) => ExitClass::Clean,
            ChildTermination::Exit(_) | ChildTermination::Vanished => ExitClass::Failure,
            ChildTermination::Signal(_) => ExitClass::Signal,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    Restart,
    Settle(ServiceState),
}

pub fn decide(policy: RestartPolicy, class: ExitClass) -> Decision {
    let restart = match policy {
        RestartPolicy::Never => false,
        RestartPolicy::OnFailure => class != ExitClass::Clean,
        RestartPolicy::Always => true,
        RestartPolicy::OnWatchdog => class == ExitClass::Watchdog,
        RestartPolicy::OnAbnormal => class == ExitClass::Signal || class == ExitClass::Watchdog,
    };
    if restart {
        Decision::Restart
    } else if class == ExitClass::Clean {
        Decision::Settle(ServiceState::Stopped)
    } else {
        Decision::Settle(ServiceState::Failed)
    }
}

/// base * 2^attempts, capped
pub fn backoff(base: Duration, attempts: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Record a restart at `now` in the sliding window. Returns false if this restart exceeds the budget.
pub fn record_restart(
    history: &mut VecDeque<Instant>,
    now: Instant,
    window: Duration,
    max: u32,
) -> bool {
    while let Some(oldest) = history.front() {
        if now.duration_since(*oldest) > window {
            history.pop_front();
        } else {
            break;
        }
    }
    history.push_back(now);
    history.len() <= max as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn policies() {
        let failure = ExitClass::classify(ChildTermination::Exit(1), false);
        let clean = ExitClass::classify(ChildTermination::Exit(0), false);
        let signal = ExitClass::classify(ChildTermination::Signal(Signal::SIGSEGV), false);
        let watchdog = ExitClass::classify(ChildTermination::Signal(Signal::SIGKILL), true);
        assert_eq!(watchdog, ExitClass::Watchdog);

        assert_eq!(
            decide(RestartPolicy::Never, clean),
            Decision::Settle(ServiceState::Stopped)
        );
        assert_eq!(
            decide(RestartPolicy::Never, failure),
            Decision::Settle(ServiceState::Failed)
        );

        assert_eq!(decide(RestartPolicy::OnFailure, failure), Decision::Restart);
        assert_eq!(decide(RestartPolicy::OnFailure, signal), Decision::Restart);
        assert_eq!(
            decide(RestartPolicy::OnFailure, clean),
            Decision::Settle(ServiceState::Stopped)
        );

        assert_eq!(decide(RestartPolicy::Always, clean), Decision::Restart);

        assert_eq!(decide(RestartPolicy::OnWatchdog, watchdog), Decision::Restart);
        assert_eq!(
            decide(RestartPolicy::OnWatchdog, failure),
            Decision::Settle(ServiceState::Failed)
        );

        assert_eq!(decide(RestartPolicy::OnAbnormal, signal), Decision::Restart);
        assert_eq!(
            decide(RestartPolicy::OnAbnormal, failure),
            Decision::Settle(ServiceState::Failed)
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);
        assert_eq!(backoff(base, 0, cap), Duration::from_millis(100));
        assert_eq!(backoff(base, 1, cap), Duration::from_millis(200));
        assert_eq!(backoff(base, 3, cap), Duration::from_millis(800));
        assert_eq!(backoff(base, 4, cap), cap);
        assert_eq!(backoff(base, 40, cap), cap);
    }

    #[test]
    fn restart_budget_window() {
        let mut history = VecDeque::new();
        let start = Instant::now();
        let window = Duration::from_secs(10);
        assert!(record_restart(&mut history, start, window, 2));
        assert!(record_restart(&mut history, start + Duration::from_secs(1), window, 2));
        assert!(!record_restart(&mut history, start + Duration::from_secs(2), window, 2));
        // the first two fall out of the window
        assert!(record_restart(&mut history, start + Duration::from_secs(12), window, 2));
    }
}
