//! Fixed-size worker pool fed round-robin from a single enumerator thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error};

use crate::cancel::CancellationToken;
use crate::throttle::Throttle;

/// Progress reports are never more frequent than this.
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(100);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counts at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    /// Items the enumerator handed to a queue.
    pub total: u64,
    /// Items a worker finished, successfully or not.
    pub processed: u64,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    workers: usize,
    report_interval: Duration,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(workers: usize, report_interval: Duration) -> Self {
        Self {
            workers: workers.max(1),
            report_interval: report_interval.max(MIN_REPORT_INTERVAL),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How long an idle worker waits before re-checking cancellation.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `per_item` over every item of `source`.
    ///
    /// One context per worker is built with `context_factory` before any
    /// thread starts; the first factory error aborts the run. Each worker owns
    /// its context until it exits. `on_progress(processed, total)` is called
    /// from one thread at most once per report interval. Returns after the
    /// enumerator and every worker have finished.
    pub fn run<I, C, E, F, G, P>(
        &self,
        source: I,
        per_item: F,
        mut context_factory: G,
        on_progress: P,
        cancel: &CancellationToken,
    ) -> Result<RunTotals, E>
    where
        I: IntoIterator,
        I::IntoIter: Send,
        I::Item: Send,
        C: Send,
        F: Fn(I::Item, usize, &mut C) + Sync,
        G: FnMut(usize) -> Result<C, E>,
        P: FnMut(u64, u64) + Send,
    {
        let contexts = (0..self.workers)
            .map(&mut context_factory)
            .collect::<Result<Vec<C>, E>>()?;

        let total = AtomicU64::new(0);
        let processed = AtomicU64::new(0);
        let (senders, receivers): (Vec<Sender<I::Item>>, Vec<Receiver<I::Item>>) =
            (0..self.workers).map(|_| crossbeam_channel::unbounded()).unzip();
        // Never carries a message; disconnects once every worker has exited.
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        let source = source.into_iter();
        let per_item = &per_item;
        let total_ref = &total;
        let processed_ref = &processed;

        std::thread::scope(|s| {
            s.spawn(move || {
                enqueue_round_robin(source, senders, total_ref, cancel);
            });

            for (index, (rx, mut ctx)) in receivers.into_iter().zip(contexts).enumerate() {
                let done_tx = done_tx.clone();
                let poll = self.poll_interval;
                s.spawn(move || {
                    work(index, rx, &mut ctx, per_item, processed_ref, poll, cancel);
                    drop(ctx);
                    drop(done_tx);
                });
            }
            drop(done_tx);

            let interval = self.report_interval;
            let mut on_progress = on_progress;
            s.spawn(move || {
                let throttle = Throttle::new(interval);
                throttle.reset();
                loop {
                    let wait = throttle.remaining().max(Duration::from_millis(1));
                    if let Err(RecvTimeoutError::Disconnected) = done_rx.recv_timeout(wait) {
                        break;
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    throttle.run(|| {
                        on_progress(
                            processed_ref.load(Ordering::Acquire),
                            total_ref.load(Ordering::Acquire),
                        )
                    });
                }
            });
        });

        Ok(RunTotals {
            total: total.into_inner(),
            processed: processed.into_inner(),
        })
    }
}

fn enqueue_round_robin<T>(
    source: impl Iterator<Item = T>,
    senders: Vec<Sender<T>>,
    total: &AtomicU64,
    cancel: &CancellationToken,
) {
    let workers = senders.len();
    for (i, item) in source.enumerate() {
        if cancel.is_cancelled() {
            debug!("enumeration stopped by cancellation");
            break;
        }
        total.fetch_add(1, Ordering::AcqRel);
        if senders[i % workers].send(item).is_err() {
            // the worker is gone, which only happens on cancellation
            total.fetch_sub(1, Ordering::AcqRel);
            break;
        }
    }
}

fn work<T, C, F>(
    index: usize,
    rx: Receiver<T>,
    ctx: &mut C,
    per_item: &F,
    processed: &AtomicU64,
    poll: Duration,
    cancel: &CancellationToken,
) where
    F: Fn(T, usize, &mut C),
{
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match rx.recv_timeout(poll) {
            Ok(item) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| per_item(item, index, ctx)));
                if let Err(payload) = result {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("worker {} panicked on an item: {}", index, message);
                }
                processed.fetch_add(1, Ordering::AcqRel);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn test_every_item_processed_exactly_once() {
        for workers in [1, 2, 3, 8] {
            let seen = Mutex::new(Vec::new());
            let totals = Scheduler::new(workers, Duration::from_millis(100))
                .run(
                    0..1000u32,
                    |item, _, _: &mut ()| seen.lock().unwrap().push(item),
                    |_| Ok::<_, ()>(()),
                    |_, _| {},
                    &CancellationToken::new(),
                )
                .unwrap();

            let seen = seen.into_inner().unwrap();
            assert_eq!(totals, RunTotals { total: 1000, processed: 1000 });
            assert_eq!(seen.len(), 1000);
            assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 1000);
        }
    }

    #[test]
    fn test_contexts_are_per_worker() {
        let used = Mutex::new(HashSet::new());
        Scheduler::new(4, Duration::from_millis(100))
            .run(
                0..200u32,
                |_, worker, ctx: &mut usize| {
                    assert_eq!(*ctx, worker);
                    used.lock().unwrap().insert(worker);
                },
                |index| Ok::<_, ()>(index),
                |_, _| {},
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(used.into_inner().unwrap().len(), 4);
    }

    #[test]
    fn test_factory_failure_aborts_before_any_item() {
        let calls = AtomicU64::new(0);
        let result = Scheduler::new(3, Duration::from_millis(100)).run(
            0..10u32,
            |_, _, _: &mut ()| {
                calls.fetch_add(1, Ordering::Relaxed);
            },
            |index| if index == 2 { Err("tool missing") } else { Ok(()) },
            |_, _| {},
            &CancellationToken::new(),
        );
        assert_eq!(result, Err("tool missing"));
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_panicking_item_does_not_stop_worker() {
        let done = AtomicU64::new(0);
        let totals = Scheduler::new(1, Duration::from_millis(100))
            .run(
                0..10u32,
                |item, _, _: &mut ()| {
                    if item == 3 {
                        panic!("bad item");
                    }
                    done.fetch_add(1, Ordering::Relaxed);
                },
                |_| Ok::<_, ()>(()),
                |_, _| {},
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(totals.processed, 10);
        assert_eq!(done.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn test_progress_reports_are_throttled_and_monotonic() {
        let reports = Mutex::new(Vec::new());
        Scheduler::new(2, Duration::from_millis(100))
            .run(
                0..20u32,
                |_, _, _: &mut ()| std::thread::sleep(Duration::from_millis(30)),
                |_| Ok::<_, ()>(()),
                |processed, total| reports.lock().unwrap().push((processed, total)),
                &CancellationToken::new(),
            )
            .unwrap();

        let reports = reports.into_inner().unwrap();
        assert!(!reports.is_empty());
        assert!(reports.len() < 10);
        assert!(reports.windows(2).all(|w| w[0].0 <= w[1].0));
        assert!(reports.iter().all(|(p, t)| p <= t));
    }

    #[test]
    fn test_cancellation_stops_the_run() {
        let cancel = CancellationToken::new();
        let totals = Scheduler::new(2, Duration::from_millis(100))
            .with_poll_interval(Duration::from_millis(5))
            .run(
                0..100_000u64,
                |item, _, _: &mut ()| {
                    if item == 50 {
                        cancel.cancel();
                    }
                    std::thread::sleep(Duration::from_millis(1));
                },
                |_| Ok::<_, ()>(()),
                |_, _| {},
                &cancel,
            )
            .unwrap();
        assert!(totals.processed > 0);
        assert!(totals.processed < 100_000);
        assert!(totals.processed <= totals.total);
    }
}
