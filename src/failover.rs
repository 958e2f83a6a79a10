use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{ScanError, ScanResult};
use crate::upstream::{Upstream, UpstreamPool};

/// How many times [`run`] may try the pool, and how long it waits between tries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Terminal status of one failover sequence.
#[derive(Debug)]
pub struct ScanOutcome<T> {
    pub result: ScanResult<T>,
    /// Last upstream selected, if any.
    pub upstream: Option<String>,
    pub elapsed: Duration,
    pub attempts: usize,
}

impl<T> ScanOutcome<T> {
    pub fn server(&self) -> &str {
        self.upstream.as_deref().unwrap_or("none")
    }
}

enum State<'p, T> {
    Selecting,
    Attempting(&'p Upstream),
    Succeeded(T),
    Retrying(ScanError),
    Exhausted(ScanError),
    Aborted(ScanError),
}

impl<T> fmt::Debug for State<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Selecting => f.write_str("Selecting"),
            State::Attempting(u) => write!(f, "Attempting({})", u.name),
            State::Succeeded(_) => f.write_str("Succeeded"),
            State::Retrying(e) => write!(f, "Retrying({e})"),
            State::Exhausted(e) => write!(f, "Exhausted({e})"),
            State::Aborted(e) => write!(f, "Aborted({e})"),
        }
    }
}

/// Runs `attempt` against upstreams picked from `pool` until it succeeds,
/// fails in a way another upstream would not fix, or the retry budget is
/// spent. Health is recorded after every attempt.
pub fn run<T, F>(pool: &UpstreamPool, policy: &RetryPolicy, mut attempt: F) -> ScanOutcome<T>
where
    F: FnMut(&Upstream) -> ScanResult<T>,
{
    let started = Instant::now();
    let budget = policy.attempts.max(1);
    let mut attempts = 0;
    let mut selected: Option<&Upstream> = None;
    let mut state = State::Selecting;

    let result = loop {
        log::trace!("failover state: {state:?}");
        state = match state {
            State::Selecting => match pool.select(Instant::now()) {
                Some(upstream) => {
                    selected = Some(upstream);
                    State::Attempting(upstream)
                }
                None => State::Aborted(ScanError::NoUpstream),
            },
            State::Attempting(upstream) => {
                attempts += 1;
                match attempt(upstream) {
                    Ok(value) => {
                        pool.record_success(upstream, Instant::now());
                        State::Succeeded(value)
                    }
                    Err(e) => {
                        if e.blames_upstream() {
                            pool.record_failure(upstream, Instant::now());
                        }
                        if !e.is_retryable() {
                            State::Aborted(e)
                        } else if attempts >= budget {
                            State::Exhausted(e)
                        } else {
                            State::Retrying(e)
                        }
                    }
                }
            }
            State::Retrying(e) => {
                log::warn!(
                    "failed to scan with {}, retrying ({}/{budget}): {e}",
                    selected.map_or("none", |u| u.name.as_str()),
                    attempts
                );
                if !policy.backoff.is_zero() {
                    thread::sleep(policy.backoff);
                }
                State::Selecting
            }
            State::Succeeded(value) => break Ok(value),
            State::Exhausted(e) => {
                log::warn!(
                    "retry limit exceeded, last server {}",
                    selected.map_or("none", |u| u.name.as_str())
                );
                break Err(ScanError::RetryLimitExceeded {
                    attempts,
                    last: Box::new(e),
                });
            }
            State::Aborted(e) => break Err(e),
        };
    };

    ScanOutcome {
        result,
        upstream: selected.map(|u| u.name.clone()),
        elapsed: started.elapsed(),
        attempts,
    }
}
