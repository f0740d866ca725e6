//! The worker-server loop.
//!
//! A servant waits on the Directive queue, starts a pool of lanes for each
//! task it is told to run, waits for every lane to stop and goes back to
//! waiting. All communication with the master goes through the queue set.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::{
    digest,
    error::{Error, Result},
    protocol::{now_micros, Directive, Origin, PhaseOrder, TaskName},
    queue::QueueSet,
};

mod handler;
mod lane;

pub use handler::{Context, FailureScope, PreparedTask, TaskError, TaskHandler};
pub use lane::{ItemScope, Reporter};

/// Handlers by the task they serve.
pub type Handlers = HashMap<TaskName, Arc<dyn TaskHandler>>;

pub fn handlers(list: impl IntoIterator<Item = Arc<dyn TaskHandler>>) -> Handlers {
    list.into_iter().map(|h| (h.task(), h)).collect()
}

enum State {
    Idle,
    Dispatching(PhaseOrder),
    Running(PhaseOrder, Arc<dyn TaskHandler>),
    Shutdown,
}

pub struct Servant {
    queues: QueueSet,
    ctx: Arc<Context>,
    handlers: Handlers,
    last_epoch: Option<u64>,
}

impl Servant {
    pub fn new(queues: QueueSet, ctx: Context, handlers: Handlers) -> Self {
        Self {
            queues,
            ctx: Arc::new(ctx),
            handlers,
            last_epoch: None,
        }
    }

    /// Serves directives until a `Shutdown` arrives.
    pub async fn run(mut self) -> Result<()> {
        info!(
            host = %self.ctx.host,
            config = %self.ctx.settings.short_digest(),
            tasks = self.handlers.len(),
            "servant waiting for work"
        );
        let mut state = State::Idle;
        loop {
            state = match state {
                State::Idle => match self.queues.directive.get().await? {
                    Directive::Run(order) => State::Dispatching(order),
                    Directive::Shutdown => State::Shutdown,
                },
                State::Dispatching(order) => self.dispatch(order).await?,
                State::Running(order, handler) => {
                    let started = tokio::time::Instant::now();
                    info!(task = %order.task, lanes = order.lanes, epoch = order.epoch, "starting pool");
                    lane::run_pool(self.ctx.clone(), handler, &order, &self.queues).await?;
                    self.last_epoch = Some(order.epoch);
                    info!(
                        task = %order.task,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "pool finished"
                    );
                    State::Idle
                }
                State::Shutdown => {
                    info!(host = %self.ctx.host, "servant shutting down");
                    return Ok(());
                }
            };
        }
    }

    /// Checks an order against this servant's configuration and handlers.
    async fn dispatch(&self, order: PhaseOrder) -> Result<State> {
        if self.last_epoch.is_some_and(|last| order.epoch <= last) {
            debug!(task = %order.task, epoch = order.epoch, "ignoring directive for a finished phase");
            return Ok(State::Idle);
        }
        if order.config_digest != self.ctx.settings.digest() {
            let theirs = digest::short(&order.config_digest).to_string();
            self.refuse(&order, Error::ConfigMismatch(theirs)).await?;
            return Ok(State::Idle);
        }
        match self.handlers.get(&order.task) {
            Some(handler) => Ok(State::Running(order, handler.clone())),
            None => {
                self.refuse(&order, Error::UnknownTask(order.task)).await?;
                Ok(State::Idle)
            }
        }
    }

    /// Reports why an order cannot run and acknowledges every lane it asked
    /// for as stopped.
    async fn refuse(&self, order: &PhaseOrder, error: Error) -> Result<()> {
        warn!(task = %order.task, error = %error, "refusing directive");
        let pid = std::process::id();
        let reporter = |lane| {
            Reporter::new(
                self.queues.result.clone(),
                Origin {
                    host: self.ctx.host.clone(),
                    pid,
                    lane,
                },
                order.epoch,
            )
        };
        reporter(0)
            .error(now_micros(), &format!("directive {}", order.task), &TaskError::lane(error))
            .await?;
        for lane in 0..order.lanes.max(1) {
            reporter(lane).stopped(false).await?;
        }
        Ok(())
    }
}
