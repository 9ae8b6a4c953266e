//! Local multi-threaded runner.
//!
//! Reads events, keys and windows them on the calling thread, and hands
//! completed session windows to a pool of workers that run the combine
//! function. Results are returned in window dispatch order, whatever order
//! the workers finish in.

use crate::core::combine::{CombineFn, SequenceCombine};
use crate::core::sequence::Sequence;
use crate::core::sequencer::StandardSequencer;
use crate::core::windowing::{GroupKey, SessionWindow, WindowManager};
use crate::error::{Result, SequencerError};
use crate::event::ReadItem;
use crate::stats::RunLog;
use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, error, info, warn};

/// Options of a local run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Worker threads aggregating windows
    pub workers: usize,
    /// Skip events that cannot be read, keyed or timestamped instead of failing
    pub skip_invalid: bool,
    /// How far behind the latest event time of its key a window may still grow.
    ///
    /// `None` keeps every window open until the input ends.
    pub allowed_lateness: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            skip_invalid: false,
            allowed_lateness: None,
        }
    }
}

type Job = (usize, SessionWindow);
type JobResult = (usize, Result<Vec<Sequence>>);

/// Run the sequencer over a stream of events.
pub fn run<I>(
    sequencer: &StandardSequencer,
    events: I,
    options: &RunOptions,
    log: &RunLog,
) -> Result<Vec<Sequence>>
where
    I: IntoIterator<Item = ReadItem>,
{
    let workers = options.workers.max(1);
    let combine = sequencer.combine_fn();
    let failed = AtomicBool::new(false);

    let (job_tx, job_rx) = bounded::<Job>(workers * 2);
    let (result_tx, result_rx) = unbounded::<JobResult>();

    info!(workers, "Starting sequencing run");

    let dispatched = thread::scope(|scope| {
        for worker in 0..workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let combine = &combine;
            let failed = &failed;
            scope.spawn(move || work(worker, combine, jobs, results, failed, log));
        }
        drop(job_rx);
        drop(result_tx);

        let dispatched = ingest(sequencer, events, options, log, &job_tx, &failed);
        drop(job_tx);
        dispatched
    })?;

    collect(result_rx, dispatched)
}

/// Key, window and dispatch events. Returns the number of windows sent.
fn ingest<I>(
    sequencer: &StandardSequencer,
    events: I,
    options: &RunOptions,
    log: &RunLog,
    jobs: &Sender<Job>,
    failed: &AtomicBool,
) -> Result<usize>
where
    I: IntoIterator<Item = ReadItem>,
{
    let mut manager = sequencer.window_manager();
    let mut latest: HashMap<GroupKey, DateTime<Utc>> = HashMap::new();
    let mut next_id = 0;

    for item in events {
        if failed.load(Ordering::Relaxed) {
            break;
        }
        log.record_events_read(1);

        let prepared = item
            .map_err(SequencerError::from)
            .and_then(|event| sequencer.prepare(event));
        let (key, event) = match prepared {
            Ok(prepared) => prepared,
            Err(e) if options.skip_invalid => {
                warn!(error = %e, "Skipping invalid event");
                log.record_event_rejected();
                continue;
            }
            Err(e) => return Err(e),
        };

        let Some(lateness) = options.allowed_lateness else {
            manager.process_event(key, event);
            continue;
        };

        let key_latest = latest
            .entry(key.clone())
            .and_modify(|t| *t = (*t).max(event.timestamp))
            .or_insert(event.timestamp);
        let watermark = key_latest.checked_sub_signed(lateness);
        manager.process_event(key.clone(), event);

        if let Some(watermark) = watermark {
            manager.advance_watermark(&key, watermark);
            dispatch(&mut manager, jobs, &mut next_id)?;
        }
    }

    manager.flush();
    dispatch(&mut manager, jobs, &mut next_id)?;
    Ok(next_id)
}

fn dispatch(manager: &mut WindowManager, jobs: &Sender<Job>, next_id: &mut usize) -> Result<()> {
    for window in manager.take_completed_windows() {
        debug!(
            id = *next_id,
            key = %window.key,
            events = window.event_count(),
            duration_secs = window.duration_secs(),
            "Dispatching window"
        );
        jobs.send((*next_id, window))
            .map_err(|_| SequencerError::Worker("all workers stopped".to_string()))?;
        *next_id += 1;
    }
    Ok(())
}

fn work(
    worker: usize,
    combine: &SequenceCombine,
    jobs: Receiver<Job>,
    results: Sender<JobResult>,
    failed: &AtomicBool,
    log: &RunLog,
) {
    for (id, window) in jobs.iter() {
        // Drain remaining jobs without work once a window has failed
        if failed.load(Ordering::Relaxed) {
            continue;
        }

        let key = window.key.clone();
        let result = combine
            .apply(window.events)
            .map(|sequences| sequences.collect::<Vec<_>>());

        match &result {
            Ok(sequences) => {
                log.record_window_completed();
                log.record_sequences_emitted(sequences.len() as u64);
            }
            Err(e) => {
                error!(worker, window = id, key = %key, error = %e, "Window aggregation failed");
                failed.store(true, Ordering::Relaxed);
            }
        }

        if results.send((id, result)).is_err() {
            break;
        }
    }
}

fn collect(results: Receiver<JobResult>, dispatched: usize) -> Result<Vec<Sequence>> {
    let mut by_window: BTreeMap<usize, Vec<Sequence>> = BTreeMap::new();
    let mut first_error: Option<(usize, SequencerError)> = None;

    for (id, result) in results.iter() {
        match result {
            Ok(sequences) => {
                by_window.insert(id, sequences);
            }
            Err(e) => {
                if first_error.as_ref().map_or(true, |(first, _)| id < *first) {
                    first_error = Some((id, e));
                }
            }
        }
    }

    if let Some((_, e)) = first_error {
        return Err(e);
    }
    if by_window.len() != dispatched {
        return Err(SequencerError::Worker(format!(
            "{} of {dispatched} windows returned no result",
            dispatched - by_window.len()
        )));
    }

    Ok(by_window.into_values().flatten().collect())
}
