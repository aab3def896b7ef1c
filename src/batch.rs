// Bounded worker pool for independent units of work.
//
// Items go into a queue, `workers` scoped threads pull from it, and each
// unit's `Outcome` comes back over a channel to the calling thread, which
// tallies it and hands it to the `on_done` callback in completion order.
// Units never see each other; there is no retry and no rollback.

use crossbeam_channel::unbounded;
use std::thread;
use std::time::{Duration, Instant};

/// Result of one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failure { label: String, reason: String },
    Skipped { label: String, reason: String },
}

impl<T> Outcome<T> {
    pub fn failure(label: impl Into<String>, reason: impl ToString) -> Self {
        Outcome::Failure {
            label: label.into(),
            reason: reason.to_string(),
        }
    }

    pub fn skipped(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            label: label.into(),
            reason: reason.into(),
        }
    }
}

/// Aggregated counts. `succeeded + failed + skipped == total` always.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

impl Summary {
    pub fn record<T>(&mut self, outcome: &Outcome<T>) {
        match outcome {
            Outcome::Success(_) => self.succeeded += 1,
            Outcome::Failure { .. } => self.failed += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// What a pool run produced: the counts plus every successful value.
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    pub summary: Summary,
    pub successes: Vec<T>,
}

/// Progress event passed to `on_done`.
pub struct Progress<'a, T> {
    pub processed: usize,
    pub total: usize,
    pub outcome: &'a Outcome<T>,
}

/// Run `work` over `items` on at most `workers` threads.
pub fn run_pool<I, T, F, C>(items: Vec<I>, workers: usize, work: F, mut on_done: C) -> BatchReport<T>
where
    I: Send,
    T: Send,
    F: Fn(I) -> Outcome<T> + Sync,
    C: FnMut(Progress<'_, T>),
{
    let started = Instant::now();
    let total = items.len();
    let mut summary = Summary {
        total,
        ..Summary::default()
    };
    let mut successes = Vec::new();

    let (job_tx, job_rx) = unbounded::<I>();
    let (done_tx, done_rx) = unbounded::<Outcome<T>>();
    for item in items {
        // Receiver is alive in this scope.
        let _ = job_tx.send(item);
    }
    drop(job_tx);

    let work = &work;
    thread::scope(|scope| {
        for _ in 0..workers.max(1).min(total) {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            scope.spawn(move || {
                for item in jobs.iter() {
                    if done.send(work(item)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);

        for outcome in done_rx.iter() {
            summary.record(&outcome);
            on_done(Progress {
                processed: summary.processed(),
                total,
                outcome: &outcome,
            });
            if let Outcome::Success(value) = outcome {
                successes.push(value);
            }
        }
    });

    summary.elapsed = started.elapsed();
    BatchReport { summary, successes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn counts_always_add_up() {
        let items: Vec<u32> = (0..57).collect();
        let report = run_pool(
            items,
            8,
            |n| match n % 3 {
                0 => Outcome::Success(n),
                1 => Outcome::failure(n.to_string(), "odd one"),
                _ => Outcome::skipped(n.to_string(), "nothing to do"),
            },
            |_| {},
        );
        let s = report.summary;
        assert_eq!(s.total, 57);
        assert_eq!(s.succeeded + s.failed + s.skipped, s.total);
        assert_eq!(s.succeeded, 19);
        assert_eq!(report.successes.len(), 19);
    }

    #[test]
    fn never_exceeds_worker_bound() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let report = run_pool(
            (0..40).collect::<Vec<_>>(),
            3,
            |n: i32| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);
                Outcome::Success(n)
            },
            |_| {},
        );
        assert_eq!(report.summary.succeeded, 40);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn progress_is_reported_for_every_unit() {
        let seen = Mutex::new(Vec::new());
        run_pool(
            vec!["a", "b", "c"],
            2,
            |s| Outcome::Success(s.to_uppercase()),
            |p| seen.lock().unwrap().push((p.processed, p.total)),
        );
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let report = run_pool(Vec::<u8>::new(), 4, |n| Outcome::Success(n), |_| {});
        assert_eq!(report.summary.total, 0);
        assert_eq!(report.summary.processed(), 0);
    }

    #[test]
    fn zero_workers_still_runs() {
        let report = run_pool(vec![1, 2], 0, |n| Outcome::Success(n), |_| {});
        assert_eq!(report.summary.succeeded, 2);
    }
}
