//! Runs every bridge cycle as its own tokio task.
//!
//! ```text
//!   conditioning (100 ms) ──┐
//!   LIN master   (2 s)   ───┼──► TelemetryStore ──► consumers (1 s)
//!   heartbeat            ───┘
//! ```
//!
//! Conditioning, the LIN master and the heartbeat all block on device I/O,
//! so each of their cycles is handed to the blocking pool and awaited before
//! the next one starts. A slow exchange never delays the conditioning tick
//! and two cycles of the same kind never overlap. Shutdown is a `watch` flag observed by
//! every task and by the LIN master between polls.

use crate::conditioning::ConditioningPipeline;
use crate::heartbeat::{BusListener, Heartbeat};
use crate::lin::LinMaster;
use crate::publish::SnapshotSink;
use crate::serial::SerialTransport;
use crate::source::SampleSource;
use crate::store::TelemetryStore;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    store: TelemetryStore,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Resolves once the shutdown flag is raised (or its sender is gone).
async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// `tokio::time::interval` panics on a zero period.
fn nonzero_period(task: &str, period: Duration) -> Duration {
    if period.is_zero() {
        warn!(task, "Zero cycle period, using 1 ms");
        return Duration::from_millis(1);
    }
    period
}

impl Scheduler {
    pub fn new(store: TelemetryStore) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    /// A receiver that flips to `true` when [`Scheduler::shutdown`] runs.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Fixed-rate conditioning of every channel.
    ///
    /// Each tick runs on the blocking pool, since sample sources read sysfs
    /// or other blocking devices. A zero `period` is raised to 1 ms.
    pub fn spawn_conditioning<S>(&mut self, pipeline: ConditioningPipeline<S>, period: Duration)
    where
        S: SampleSource + 'static,
    {
        let period = nonzero_period("adc", period);
        let mut pipeline = pipeline;
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped(&mut shutdown) => break,
                }
                let tick = tokio::task::spawn_blocking(move || {
                    pipeline.process_all();
                    pipeline
                });
                match tick.await {
                    Ok(returned) => pipeline = returned,
                    Err(e) => {
                        error!("Conditioning aborted: {e}");
                        break;
                    }
                }
            }
        });
        self.tasks.push(("adc", handle));
    }

    /// LIN cycles separated by `pause`; the transport is dropped when the task ends.
    pub fn spawn_protocol<T>(&mut self, master: LinMaster<T>, pause: Duration)
    where
        T: SerialTransport + 'static,
    {
        let mut master = master.with_shutdown(self.shutdown.subscribe());
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let cycle = tokio::task::spawn_blocking(move || {
                    let report = master.run_cycle();
                    (master, report)
                });
                let report = match cycle.await {
                    Ok((returned, report)) => {
                        master = returned;
                        report
                    }
                    Err(e) => {
                        error!("LIN cycle aborted: {e}");
                        break;
                    }
                };
                debug!(
                    committed = report.committed(),
                    polled = report.outcomes.len(),
                    "LIN cycle complete"
                );
                tokio::select! {
                    _ = sleep(pause) => {}
                    _ = stopped(&mut shutdown) => break,
                }
            }
        });
        self.tasks.push(("lin", handle));
    }

    /// Repeated listen windows feeding `bus_alive`.
    pub fn spawn_heartbeat<L>(&mut self, heartbeat: Heartbeat<L>)
    where
        L: BusListener + 'static,
    {
        let pause = heartbeat.pause();
        let mut heartbeat = heartbeat;
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let check = tokio::task::spawn_blocking(move || {
                    heartbeat.check();
                    heartbeat
                });
                match check.await {
                    Ok(returned) => heartbeat = returned,
                    Err(e) => {
                        error!("Heartbeat aborted: {e}");
                        break;
                    }
                }
                tokio::select! {
                    _ = sleep(pause) => {}
                    _ = stopped(&mut shutdown) => break,
                }
            }
        });
        self.tasks.push(("heartbeat", handle));
    }

    /// Periodically hand a fresh snapshot to `sink`. A zero `period` is raised to 1 ms.
    pub fn spawn_consumer<K>(&mut self, name: &'static str, mut sink: K, period: Duration)
    where
        K: SnapshotSink + 'static,
    {
        let period = nonzero_period(name, period);
        let store = self.store.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sink.publish(&store.snapshot()) {
                            warn!(consumer = name, "Publish failed: {e}");
                        }
                    }
                    _ = stopped(&mut shutdown) => break,
                }
            }
            if let Err(e) = sink.finish() {
                warn!(consumer = name, "Closing sink failed: {e}");
            }
        });
        self.tasks.push((name, handle));
    }

    /// Run until `signal` resolves, then shut down.
    pub async fn run_until<F: Future>(self, signal: F) {
        info!("All tasks started ({}).", self.task_names().join(", "));
        signal.await;
        self.shutdown().await;
    }

    fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Raise the shutdown flag and wait for every task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => debug!(task = name, "Task stopped"),
                Err(e) => error!(task = name, "Task failed: {e}"),
            }
        }
        info!("Scheduler stopped.");
    }
}
