//! Bounded concurrent execution of a fixed set of jobs within one task.
//!
//! [`run_jobs`] drives an owned list of jobs through a caller-provided
//! closure with at most `concurrency` invocations in flight. Jobs start in
//! iteration order; completion order is unspecified. The first job error
//! stops new starts, remaining in-flight jobs are drained with their errors
//! swallowed, and the first error is re-raised. A stop signal observed
//! between jobs is propagated unchanged as the distinguished stop variant.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::warn;

use crate::stop::{StopMode, StopToken, Stopped};

/// Lowest permitted fan-out width.
pub const MIN_CONCURRENCY: usize = 1;

/// Highest permitted fan-out width.
pub const MAX_CONCURRENCY: usize = 16;

/// Errors that may carry a stop signal.
///
/// The runner uses this to keep stop propagation out of the error path:
/// `on_error` never fires for a stop, and callers can translate the mode
/// back into a task state.
pub trait StopAware {
    /// Returns the stop mode when this value wraps a stop signal.
    fn stopped(&self) -> Option<StopMode>;
}

/// Runs `jobs` through `run` with bounded concurrency.
///
/// `on_error` fires once, before the first ordinary job error is re-raised;
/// it does not fire for stop signals. The stop token is polled before each
/// start and after each completion.
///
/// # Errors
///
/// Returns the first job error, or the stop signal converted through
/// `E: From<Stopped>`.
pub async fn run_jobs<T, E, F, Fut>(
    jobs: Vec<T>,
    concurrency: usize,
    stop: &StopToken,
    run: F,
    on_error: impl FnOnce() + Send,
) -> Result<(), E>
where
    T: Send + 'static,
    E: From<Stopped> + StopAware + Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    let concurrency = concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
    let mut in_flight: JoinSet<Result<(), E>> = JoinSet::new();
    let mut first_error: Option<E> = None;

    'starts: for job in jobs {
        if let Err(stopped) = stop.check() {
            first_error = Some(E::from(stopped));
            break 'starts;
        }

        while in_flight.len() >= concurrency {
            if let Some(error) = wait_one(&mut in_flight).await {
                first_error = Some(error);
                break 'starts;
            }
            if let Err(stopped) = stop.check() {
                first_error = Some(E::from(stopped));
                break 'starts;
            }
        }

        in_flight.spawn(run(job));
    }

    // Drain what is still running. After a failure the siblings' own errors
    // are swallowed; the first error wins.
    while let Some(joined) = in_flight.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            Err(join_error) => {
                warn!(%join_error, "fan-out job aborted abnormally");
            }
        }
    }

    match first_error {
        None => Ok(()),
        Some(error) => {
            if error.stopped().is_none() {
                on_error();
            }
            Err(error)
        }
    }
}

async fn wait_one<E: 'static>(in_flight: &mut JoinSet<Result<(), E>>) -> Option<E> {
    match in_flight.join_next().await {
        None | Some(Ok(Ok(()))) => None,
        Some(Ok(Err(error))) => Some(error),
        Some(Err(join_error)) => {
            warn!(%join_error, "fan-out job aborted abnormally");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stop::StopMode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Eq)]
    enum JobError {
        Boom(usize),
        Stop(Stopped),
    }

    impl From<Stopped> for JobError {
        fn from(s: Stopped) -> Self {
            Self::Stop(s)
        }
    }

    impl StopAware for JobError {
        fn stopped(&self) -> Option<StopMode> {
            match self {
                Self::Stop(Stopped(mode)) => Some(*mode),
                Self::Boom(_) => None,
            }
        }
    }

    #[tokio::test]
    async fn test_runs_every_job() {
        let count = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<usize> = (0..20).collect();
        let counter = Arc::clone(&count);

        run_jobs::<_, JobError, _, _>(jobs, 4, &StopToken::new(), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }, || {})
        .await
        .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_is_respected() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<usize> = (0..12).collect();
        let live_c = Arc::clone(&live);
        let peak_c = Arc::clone(&peak);

        run_jobs::<_, JobError, _, _>(jobs, 3, &StopToken::new(), move |_| {
            let live = Arc::clone(&live_c);
            let peak = Arc::clone(&peak_c);
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }, || {})
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3, "peak concurrency exceeded");
    }

    #[tokio::test]
    async fn test_first_error_wins_and_stops_new_starts() {
        let started = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<usize> = (0..50).collect();
        let started_c = Arc::clone(&started);

        let err = run_jobs::<_, JobError, _, _>(jobs, 1, &StopToken::new(), move |n| {
            let started = Arc::clone(&started_c);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if n == 2 { Err(JobError::Boom(n)) } else { Ok(()) }
            }
        }, || {})
        .await
        .unwrap_err();

        assert_eq!(err, JobError::Boom(2));
        assert!(
            started.load(Ordering::SeqCst) < 50,
            "no new jobs may start after the first error"
        );
    }

    #[tokio::test]
    async fn test_on_error_fires_once_for_job_errors() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_c = Arc::clone(&fired);

        let _ = run_jobs::<_, JobError, _, _>(vec![0usize], 1, &StopToken::new(), |n| async move {
            Err(JobError::Boom(n))
        }, move || {
            fired_c.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_propagates_unchanged_without_on_error() {
        let stop = StopToken::new();
        stop.signal(StopMode::Pause);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_c = Arc::clone(&fired);

        let err = run_jobs::<_, JobError, _, _>(vec![1usize, 2, 3], 2, &stop, |_| async move {
            Ok(())
        }, move || {
            fired_c.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

        assert_eq!(err, JobError::Stop(Stopped(StopMode::Pause)));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "on_error must not fire for stops");
    }
}
