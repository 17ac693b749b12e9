//! Staggered racing of connection attempts.
//!
//! Attempts are futures polled concurrently inside a [`RaceSet`]; they are
//! not spawned. Attempts are launched in order with a delay between them,
//! and the first one to succeed wins. Dropping the set drops every attempt
//! still in flight, which closes whatever socket it had opened.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt as _;
use tracing::trace;

/// Why a race produced no winner.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RaceError<E> {
    /// The overall deadline passed.
    Timeout(Duration),

    /// There was nothing to race.
    NoProgress,

    /// Every attempt failed. Holds the first failure.
    Error(E),
}

impl<E> fmt::Display for RaceError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoProgress => write!(f, "no candidates to attempt"),
            Self::Error(e) => write!(f, "{e}"),
            Self::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
        }
    }
}

impl<E> std::error::Error for RaceError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// How an attempt participates in the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Launch {
    /// Wait up to the racing delay before launching the next attempt.
    Staggered,

    /// Launch no further attempts after this one.
    Last,
}

enum Outcome<T> {
    Ok(T),
    Error,
    Timeout,
    Exhausted,
}

/// A first-success-wins set of attempts.
pub(crate) struct RaceSet<F, T, E> {
    queue: VecDeque<(F, Launch)>,
    running: FuturesUnordered<F>,
    delay: Duration,
    timeout: Option<Duration>,
    started: Option<Instant>,
    error: Option<E>,
    _result: std::marker::PhantomData<fn() -> T>,
}

impl<F, T, E> fmt::Debug for RaceSet<F, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaceSet")
            .field("queued", &self.queue.len())
            .field("running", &self.running.len())
            .field("delay", &self.delay)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<F, T, E> RaceSet<F, T, E>
where
    F: Future<Output = Result<T, E>>,
{
    /// A set which waits `delay` between launches, giving up on the whole race
    /// after `timeout` if one is set.
    pub(crate) fn new(delay: Duration, timeout: Option<Duration>) -> Self {
        Self {
            queue: VecDeque::new(),
            running: FuturesUnordered::new(),
            delay,
            timeout,
            started: None,
            error: None,
            _result: std::marker::PhantomData,
        }
    }

    /// Queue an attempt. Attempts launch in the order they were pushed.
    pub(crate) fn push(&mut self, attempt: F, launch: Launch) {
        self.queue.push_back((attempt, launch));
    }

    async fn join_next(&mut self) -> Outcome<T> {
        match self.running.next().await {
            Some(Ok(value)) => Outcome::Ok(value),
            Some(Err(error)) => {
                if self.error.is_none() {
                    trace!("first attempt error");
                    self.error = Some(error);
                } else {
                    trace!("attempt error");
                }
                Outcome::Error
            }
            None => Outcome::Exhausted,
        }
    }

    async fn join_next_with_delay(&mut self) -> Outcome<T> {
        match tokio::time::timeout(self.delay, self.join_next()).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Timeout,
        }
    }

    async fn process_all(&mut self) -> Result<T, RaceError<E>> {
        while let Some((attempt, launch)) = self.queue.pop_front() {
            self.running.push(attempt);
            if launch == Launch::Last {
                trace!("final attempt launched");
                self.queue.clear();
                break;
            }

            if self.queue.is_empty() {
                break;
            }

            // A failure ends the wait early, so the next attempt launches at
            // once. Success ends the race.
            match self.join_next_with_delay().await {
                Outcome::Ok(value) => return Ok(value),
                Outcome::Error | Outcome::Timeout | Outcome::Exhausted => {}
            }
        }

        loop {
            match self.join_next().await {
                Outcome::Ok(value) => return Ok(value),
                Outcome::Error | Outcome::Timeout => continue,
                Outcome::Exhausted => {
                    trace!("exhausted attempts");
                    return Err(self
                        .error
                        .take()
                        .map(RaceError::Error)
                        .unwrap_or(RaceError::NoProgress));
                }
            }
        }
    }

    /// Run the race to completion.
    ///
    /// Attempts still in flight when this returns are only cancelled once the
    /// set is dropped.
    pub(crate) async fn finish(&mut self) -> Result<T, RaceError<E>> {
        let started = *self.started.get_or_insert_with(Instant::now);

        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.process_all()).await,
            None => Ok(self.process_all().await),
        };

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(RaceError::Timeout(started.elapsed())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use crate::BoxFuture;

    use super::*;

    type Attempt = BoxFuture<'static, Result<&'static str, &'static str>>;

    /// Flags when the future holding it is dropped before finishing.
    struct Cancelled(Arc<AtomicBool>, bool);

    impl Drop for Cancelled {
        fn drop(&mut self) {
            if !self.1 {
                self.0.store(true, Ordering::SeqCst);
            }
        }
    }

    fn attempt(
        after: Duration,
        result: Result<&'static str, &'static str>,
    ) -> (Attempt, Arc<AtomicBool>) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let future = Box::pin(async move {
            let mut guard = Cancelled(flag, false);
            tokio::time::sleep(after).await;
            guard.1 = true;
            result
        });
        (future, cancelled)
    }

    #[tokio::test(start_paused = true)]
    async fn second_attempt_wins_and_first_is_cancelled() {
        let (first, first_cancelled) = attempt(Duration::from_millis(300), Ok("first"));
        let (second, second_cancelled) = attempt(Duration::from_millis(50), Ok("second"));

        let mut race: RaceSet<Attempt, _, _> = RaceSet::new(Duration::from_millis(100), None);
        race.push(first, Launch::Staggered);
        race.push(second, Launch::Staggered);

        let start = tokio::time::Instant::now();
        let winner = race.finish().await;
        assert_eq!(winner, Ok("second"));

        // The second attempt launched after the 100ms delay and took 50ms.
        assert_eq!(start.elapsed(), Duration::from_millis(150));

        assert!(!first_cancelled.load(Ordering::SeqCst));
        drop(race);
        assert!(first_cancelled.load(Ordering::SeqCst));
        assert!(!second_cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn quick_success_launches_nothing_else() {
        let (first, _) = attempt(Duration::from_millis(10), Ok("first"));
        let launched = Arc::new(AtomicBool::new(false));
        let flag = launched.clone();
        let second: Attempt = Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
            Ok("second")
        });

        let mut race = RaceSet::new(Duration::from_millis(100), None);
        race.push(first, Launch::Staggered);
        race.push(second, Launch::Staggered);

        assert_eq!(race.finish().await, Ok("first"));
        assert!(!launched.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_skips_the_delay() {
        let (first, _) = attempt(Duration::from_millis(5), Err("refused"));
        let (second, _) = attempt(Duration::from_millis(5), Ok("second"));

        let mut race = RaceSet::new(Duration::from_millis(100), None);
        race.push(first, Launch::Staggered);
        race.push(second, Launch::Staggered);

        let start = tokio::time::Instant::now();
        assert_eq!(race.finish().await, Ok("second"));
        assert_eq!(start.elapsed(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_report_the_first() {
        let (first, _) = attempt(Duration::from_millis(5), Err("first"));
        let (second, _) = attempt(Duration::from_millis(1), Err("second"));

        let mut race = RaceSet::new(Duration::from_millis(100), None);
        race.push(first, Launch::Staggered);
        race.push(second, Launch::Staggered);

        assert_eq!(race.finish().await, Err(RaceError::Error("first")));
    }

    #[tokio::test]
    async fn empty_race_makes_no_progress() {
        let mut race: RaceSet<Attempt, _, _> = RaceSet::new(Duration::from_millis(100), None);
        assert_eq!(race.finish().await, Err(RaceError::NoProgress));
    }

    #[tokio::test(start_paused = true)]
    async fn last_attempt_stops_launching() {
        let (first, _) = attempt(Duration::from_millis(1), Err("udp"));
        let launched = Arc::new(AtomicBool::new(false));
        let flag = launched.clone();
        let second: Attempt = Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
            Ok("never")
        });

        let mut race = RaceSet::new(Duration::from_millis(100), None);
        race.push(first, Launch::Last);
        race.push(second, Launch::Staggered);

        assert_eq!(race.finish().await, Err(RaceError::Error("udp")));
        assert!(!launched.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout() {
        let (first, cancelled) = attempt(Duration::from_secs(60), Ok("slow"));

        let mut race = RaceSet::new(Duration::from_millis(100), Some(Duration::from_secs(1)));
        race.push(first, Launch::Staggered);

        assert!(matches!(race.finish().await, Err(RaceError::Timeout(_))));
        drop(race);
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
