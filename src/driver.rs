//! The pipeline driver: runs the numbered steps in order on the master.
//!
//! A step that fails, whether it reports `Ok(false)` or returns an error,
//! stops the run; later steps are skipped and the servants are still sent
//! home.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{
    config::Settings,
    db::Database,
    error::Result,
    layout::Layout,
    master::{Coordinator, PhaseOutcome, PhasePlan},
    protocol::{Directive, TaskName},
    queue::QueueSet,
    steps,
};

/// Steps the driver knows, in run order.
pub const STEPS: [u8; 7] = [0, 1, 2, 3, 4, 5, 6];

pub struct Pipeline {
    settings: Arc<Settings>,
    layout: Layout,
    coordinator: Coordinator,
    db: Option<Arc<Database>>,
    started: Instant,
}

impl Pipeline {
    pub fn new(settings: Settings, queues: QueueSet) -> Self {
        let coordinator = Coordinator::from_settings(queues, &settings);
        Self {
            layout: settings.phase.layout(),
            settings: Arc::new(settings),
            coordinator,
            db: None,
            started: Instant::now(),
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.clone()
    }

    pub fn layout(&self) -> Layout {
        self.layout.clone()
    }

    /// The master's database connection, opened on first use and released
    /// after every step.
    pub async fn database(&mut self) -> Result<Arc<Database>> {
        if let Some(db) = &self.db {
            return Ok(db.clone());
        }
        let db = Arc::new(Database::connect(&self.settings.db).await?);
        self.db = Some(db.clone());
        Ok(db)
    }

    /// Hands a distributed phase to the coordinator.
    pub async fn distribute(&mut self, plan: PhasePlan) -> Result<PhaseOutcome> {
        self.coordinator.run_phase(plan).await
    }

    pub fn lanes(&self, task: TaskName) -> usize {
        self.settings.phase.lanes(task)
    }

    /// Logs the end of a master-side task.
    pub fn task_done(&self, task: &str, started: Instant) {
        info!(
            task,
            elapsed_ms = started.elapsed().as_millis() as u64,
            run_elapsed_s = self.started.elapsed().as_secs(),
            "task finished"
        );
    }

    /// Runs every enabled step. Returns whether all of them succeeded.
    ///
    /// `Err` is only returned when the output directories cannot be created
    /// or the shutdown directives cannot be queued.
    pub async fn run(mut self) -> Result<bool> {
        info!(
            config = %self.settings.short_digest(),
            servers = self.settings.phase.number_servers,
            root = %self.layout.root().display(),
            "pipeline starting"
        );
        self.layout.ensure()?;

        let mut succeeded = true;
        for step in STEPS {
            if !self.settings.phase.steps.enabled(step) {
                info!(step, "step disabled");
                continue;
            }
            let started = Instant::now();
            info!(step, "step starting");
            let outcome = self.step(step).await;
            self.db = None;
            match outcome {
                Ok(true) => info!(
                    step,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    run_elapsed_s = self.started.elapsed().as_secs(),
                    "step finished"
                ),
                Ok(false) => {
                    error!(step, "step failed; skipping the remaining steps");
                    succeeded = false;
                    break;
                }
                Err(e) => {
                    error!(step, error = %e, "step aborted; skipping the remaining steps");
                    succeeded = false;
                    break;
                }
            }
        }

        self.shutdown_servants().await?;
        info!(
            succeeded,
            run_elapsed_s = self.started.elapsed().as_secs(),
            "pipeline finished"
        );
        Ok(succeeded)
    }

    async fn step(&mut self, step: u8) -> Result<bool> {
        match step {
            0 => steps::step0::run(self).await,
            1 => steps::step1::run(self).await,
            2 => steps::step2::run(self).await,
            3 => steps::step3::run(self).await,
            4 => steps::step4::run(self).await,
            5 => steps::step5::run(self).await,
            6 => steps::step6::run(self).await,
            _ => {
                warn!(step, "no such step");
                Ok(false)
            }
        }
    }

    /// One `Shutdown` per servant process.
    async fn shutdown_servants(&self) -> Result<()> {
        let queues = self.coordinator.queues();
        queues.work.purge().await?;
        for _ in 0..self.settings.phase.number_servers {
            queues.directive.put(Directive::Shutdown).await?;
        }
        Ok(())
    }
}
