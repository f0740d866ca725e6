//! The phase coordinator.
//!
//! For every distributed phase the coordinator announces the task to each
//! servant, feeds the work items in waves, drains results until the phase's
//! completion target is reached (or the first error, or silence), and then
//! flushes: exactly one stop sentinel per lane, one `Stopped`
//! acknowledgement per lane, and both queues verified empty.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Coordination, Settings},
    error::Result,
    protocol::{now_micros, Directive, PhaseOrder, Report, ResultMessage, WorkEnvelope},
    queue::QueueSet,
};

mod plan;

pub use plan::{PhaseOutcome, PhasePlan};

pub struct Coordinator {
    queues: QueueSet,
    servers: usize,
    config_digest: [u8; 32],
    coordination: Coordination,
    epoch: u64,
}

/// Why a drain ended early.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Abort {
    Error,
    AllLanesStopped,
    Idle(Duration),
}

/// Running counts for the phase in flight.
#[derive(Debug, Default)]
struct Tally {
    epoch: u64,
    completed: usize,
    errors: usize,
    stopped: usize,
    outcome: PhaseOutcome,
}

impl Tally {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    /// Counts a result and re-emits it as a log line of the matching level.
    fn record(&mut self, message: ResultMessage) {
        let ResultMessage { origin, report, .. } = &message;
        let elapsed_ms = message.elapsed_ms();
        let (host, pid, lane) = (origin.host.as_str(), origin.pid, origin.lane);
        match report {
            Report::Info { message } => info!(host, pid, lane, elapsed_ms, "{message}"),
            Report::Progress { message, .. } => info!(host, pid, lane, elapsed_ms, "{message}"),
            Report::Error { message, trace } => {
                error!(host, pid, lane, elapsed_ms, trace = %trace, "{message}")
            }
            Report::Debug { message } => debug!(host, pid, lane, elapsed_ms, "{message}"),
            Report::Heartbeat => debug!(host, pid, lane, "heartbeat"),
            Report::Stopped { consumed_sentinel } => {
                debug!(host, pid, lane, consumed_sentinel, "lane stopped")
            }
        }

        if report.counts_towards_completion() {
            self.completed += 1;
        }
        match message.report {
            Report::Error { .. } => self.errors += 1,
            Report::Stopped { .. } => self.stopped += 1,
            Report::Progress {
                payload: Some(payload),
                ..
            } => self.outcome.payloads.push(payload),
            _ => {}
        }
    }

    fn into_outcome(mut self, succeeded: bool) -> PhaseOutcome {
        self.outcome.succeeded = succeeded;
        self.outcome.completed = self.completed;
        self.outcome.errors = self.errors;
        self.outcome
    }
}

impl Coordinator {
    pub fn new(
        queues: QueueSet,
        servers: usize,
        config_digest: [u8; 32],
        coordination: Coordination,
    ) -> Self {
        Self {
            queues,
            servers: servers.max(1),
            config_digest,
            coordination,
            // epochs only grow, also across master restarts
            epoch: now_micros() as u64,
        }
    }

    pub fn from_settings(queues: QueueSet, settings: &Settings) -> Self {
        Self::new(
            queues,
            settings.phase.number_servers,
            settings.digest(),
            settings.phase.coordination.clone(),
        )
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// Runs one distributed phase to completion or failure.
    ///
    /// `Err` is reserved for queue failures; a phase that reported an error,
    /// went silent or lost its lanes comes back as an unsuccessful
    /// [`PhaseOutcome`].
    pub async fn run_phase(&mut self, plan: PhasePlan) -> Result<PhaseOutcome> {
        let started = Instant::now();
        let task = plan.task;
        if plan.item_count() == 0 {
            info!(%task, "no work items; nothing to distribute");
            return Ok(PhaseOutcome::empty());
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let lanes = plan.lanes;
        let expected_stops = self.servers * lanes;
        info!(%task, items = plan.item_count(), target = plan.target(), servers = self.servers, lanes, epoch, "starting phase");

        for _ in 0..self.servers {
            self.queues
                .directive
                .put(Directive::Run(PhaseOrder {
                    task,
                    lanes: lanes as u32,
                    epoch,
                    config_digest: self.config_digest,
                }))
                .await?;
        }

        let mut tally = Tally::new(epoch);
        let mut abort = None;
        let mut goal = 0;
        let waves = plan.waves.len();
        for (index, wave) in plan.waves.into_iter().enumerate() {
            goal += wave.len() * plan.progress_per_item;
            for item in wave {
                self.queues.work.put(WorkEnvelope { epoch, item }).await?;
            }
            if let Err(reason) = self.drain(&mut tally, goal, expected_stops).await? {
                abort = Some(reason);
                break;
            }
            debug!(%task, wave = index + 1, waves, "wave complete");
        }

        if let Some(reason) = &abort {
            warn!(%task, ?reason, completed = tally.completed, errors = tally.errors, "aborting phase");
        }
        let flushed = self.flush(&mut tally, expected_stops, abort.is_some()).await?;
        let succeeded = abort.is_none() && flushed && tally.errors == 0;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if succeeded {
            info!(%task, completed = tally.completed, elapsed_ms, "phase complete");
        } else {
            error!(%task, completed = tally.completed, errors = tally.errors, elapsed_ms, "phase failed");
        }
        Ok(tally.into_outcome(succeeded))
    }

    /// Receives results until `goal` completions. Any current-phase result
    /// (heartbeats included) resets the idle clock.
    async fn drain(
        &self,
        tally: &mut Tally,
        goal: usize,
        expected_stops: usize,
    ) -> Result<Result<(), Abort>> {
        let idle = self.coordination.idle_timeout();
        let mut deadline = Instant::now() + idle;
        while tally.completed < goal {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Err(Abort::Idle(idle)));
            }
            let Some(message) = self.queues.result.get_timeout(remaining).await? else {
                continue;
            };
            if message.epoch != tally.epoch {
                debug!(epoch = message.epoch, "discarding result from another phase");
                continue;
            }
            deadline = Instant::now() + idle;
            tally.record(message);
            if tally.errors > 0 {
                return Ok(Err(Abort::Error));
            }
            if tally.stopped >= expected_stops && tally.completed < goal {
                return Ok(Err(Abort::AllLanesStopped));
            }
        }
        Ok(Ok(()))
    }

    /// Stops every lane of the phase and leaves Work and Result empty.
    /// Returns whether every lane acknowledged and both queues drained.
    async fn flush(&self, tally: &mut Tally, expected_stops: usize, aborted: bool) -> Result<bool> {
        if aborted {
            let dropped = self.queues.work.purge().await?;
            debug!(dropped, "dropped pending work items");
        }
        for _ in 0..expected_stops {
            self.queues.work.put(WorkEnvelope::stop(tally.epoch)).await?;
        }

        let deadline = Instant::now() + self.coordination.stop_ack_timeout();
        while tally.stopped < expected_stops {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    stopped = tally.stopped,
                    expected = expected_stops,
                    "not every lane acknowledged the stop"
                );
                break;
            }
            match self.queues.result.get_timeout(remaining).await? {
                Some(message) if message.epoch == tally.epoch => tally.record(message),
                Some(message) => debug!(epoch = message.epoch, "discarding result from another phase"),
                None => {}
            }
        }
        let acknowledged = tally.stopped >= expected_stops;

        let work = self.queues.work.purge().await?;
        let results = self.queues.result.purge().await?;
        let directives = self.queues.directive.purge().await?;
        debug!(work, results, directives, "purged residue");
        let (work, results) = (
            self.queues.work.size().await?,
            self.queues.result.size().await?,
        );
        if work != 0 || results != 0 {
            warn!(work, results, "queues not empty after flush");
        }
        Ok(acknowledged && work == 0 && results == 0)
    }
}
