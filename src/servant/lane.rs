use std::{future::Future, sync::Arc, time::Duration};

use futures::{future::join_all, pin_mut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

use super::handler::{Context, FailureScope, PreparedTask, TaskError, TaskHandler};
use crate::{
    error::Result,
    protocol::{now_micros, Origin, Payload, PhaseOrder, Report, ResultMessage, WorkEnvelope},
    queue::{Queue, QueueSet},
};

/// Sends result messages on behalf of one lane.
#[derive(Clone)]
pub struct Reporter {
    results: Queue<ResultMessage>,
    origin: Origin,
    epoch: u64,
}

impl Reporter {
    pub fn new(results: Queue<ResultMessage>, origin: Origin, epoch: u64) -> Self {
        Self {
            results,
            origin,
            epoch,
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub async fn send(&self, started_at: i64, report: Report) -> Result<()> {
        self.results
            .put(ResultMessage::new(
                self.epoch,
                self.origin.clone(),
                started_at,
                report,
            ))
            .await
    }

    pub async fn error(&self, started_at: i64, context: &str, error: &TaskError) -> Result<()> {
        self.send(
            started_at,
            Report::Error {
                message: format!("{context}: {}", error.message),
                trace: error.trace.clone(),
            },
        )
        .await
    }

    pub async fn stopped(&self, consumed_sentinel: bool) -> Result<()> {
        self.send(now_micros(), Report::Stopped { consumed_sentinel })
            .await
    }
}

/// Handed to a task for the duration of one work item. Reports sent through
/// it are timed from the moment the item was taken.
pub struct ItemScope {
    reporter: Reporter,
    started_at: i64,
}

impl ItemScope {
    pub fn new(reporter: Reporter, started_at: i64) -> Self {
        Self {
            reporter,
            started_at,
        }
    }

    pub fn origin(&self) -> &Origin {
        self.reporter.origin()
    }

    pub async fn info(&self, message: impl Into<String>) -> Result<()> {
        self.send(Report::Info {
            message: message.into(),
        })
        .await
    }

    /// One unit of completion towards the phase target.
    pub async fn progress(&self, message: impl Into<String>, payload: Option<Payload>) -> Result<()> {
        self.send(Report::Progress {
            message: message.into(),
            payload,
        })
        .await
    }

    pub async fn debug(&self, message: impl Into<String>) -> Result<()> {
        self.send(Report::Debug {
            message: message.into(),
        })
        .await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.send(Report::Heartbeat).await
    }

    async fn send(&self, report: Report) -> Result<()> {
        self.reporter.send(self.started_at, report).await
    }
}

/// How a lane left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Sentinel,
    Cancelled,
    Failed,
    /// Work from a later phase showed up; this lane is left over.
    Superseded,
}

struct Lane {
    work: Queue<WorkEnvelope>,
    reporter: Reporter,
    task: Arc<dyn PreparedTask>,
    cancel: CancellationToken,
    heartbeat: Duration,
}

impl Lane {
    /// Runs until a sentinel, a lane-scope failure or cancellation, and
    /// always acknowledges with `Stopped`.
    async fn run(self) -> Result<()> {
        let exit = self.work_loop().await;
        debug!(?exit, "lane leaving its loop");
        let consumed = matches!(exit, Ok(Exit::Sentinel));
        let acknowledged = self.reporter.stopped(consumed).await;
        exit?;
        acknowledged
    }

    async fn work_loop(&self) -> Result<Exit> {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Exit::Cancelled),
                envelope = self.work.get() => envelope?,
            };

            if envelope.epoch > self.reporter.epoch() {
                self.work.put(envelope).await?;
                return Ok(Exit::Superseded);
            }
            if envelope.epoch < self.reporter.epoch() {
                self.reporter
                    .send(
                        now_micros(),
                        Report::Debug {
                            message: format!(
                                "skipped {} left over from phase {}",
                                envelope.item.describe(),
                                envelope.epoch
                            ),
                        },
                    )
                    .await?;
                continue;
            }
            if envelope.item.is_stop() {
                return Ok(Exit::Sentinel);
            }

            let started_at = now_micros();
            let description = envelope.item.describe();
            let scope = ItemScope::new(self.reporter.clone(), started_at);
            let outcome = self
                .with_heartbeat(&scope, self.task.run(&scope, envelope.item))
                .await;
            if let Err(error) = outcome {
                self.reporter.error(started_at, &description, &error).await?;
                if error.scope == FailureScope::Lane {
                    self.cancel.cancel();
                    return Ok(Exit::Failed);
                }
            }
        }
    }

    async fn with_heartbeat(
        &self,
        scope: &ItemScope,
        work: impl Future<Output = Result<(), TaskError>>,
    ) -> Result<(), TaskError> {
        pin_mut!(work);
        let mut ticker = tokio::time::interval(self.heartbeat);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = ticker.tick() => scope.heartbeat().await?,
            }
        }
    }
}

/// Prepares the shared state for `order` and runs its lanes to completion.
///
/// A pool that cannot be prepared reports one error and then stops every
/// lane it would have started, so the master's stop count still adds up.
pub(super) async fn run_pool(
    ctx: Arc<Context>,
    handler: Arc<dyn TaskHandler>,
    order: &PhaseOrder,
    queues: &QueueSet,
) -> Result<()> {
    let lanes = order.lanes.max(1);
    let pid = std::process::id();
    let reporter = |lane: u32| {
        Reporter::new(
            queues.result.clone(),
            Origin {
                host: ctx.host.clone(),
                pid,
                lane,
            },
            order.epoch,
        )
    };

    let started_at = now_micros();
    let task = match handler.prepare(ctx.clone()).await {
        Ok(task) => task,
        Err(e) => {
            let error = TaskError::lane(e);
            warn!(task = %order.task, error = %error, "could not prepare pool");
            reporter(0)
                .error(started_at, &format!("preparing {}", order.task), &error)
                .await?;
            for lane in 0..lanes {
                reporter(lane).stopped(false).await?;
            }
            return Ok(());
        }
    };

    let cancel = CancellationToken::new();
    let heartbeat = ctx.settings.phase.coordination.heartbeat();
    let handles: Vec<_> = (0..lanes)
        .map(|lane| {
            let span = debug_span!("lane", task = %order.task, epoch = order.epoch, lane);
            let lane = Lane {
                work: queues.work.clone(),
                reporter: reporter(lane),
                task: task.clone(),
                cancel: cancel.clone(),
                heartbeat,
            };
            tokio::spawn(lane.run().instrument(span))
        })
        .collect();

    // a panicked lane never got to acknowledge; stop its siblings and do it
    // on its behalf as soon as the panic surfaces
    let joined = join_all(handles.into_iter().enumerate().map(|(lane, handle)| {
        let cancel = cancel.clone();
        let lane_reporter = reporter(lane as u32);
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(panicked) => {
                    cancel.cancel();
                    let error = TaskError::lane(panicked);
                    warn!(lane, error = %error, "lane panicked");
                    lane_reporter.error(now_micros(), "lane", &error).await?;
                    lane_reporter.stopped(false).await
                }
            }
        }
    }))
    .await;

    joined.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use futures::{future::BoxFuture, FutureExt};

    use super::*;
    use crate::{
        config::{tests::phase_config, DbConfig, QueueConfig, Settings},
        error::Error,
        protocol::{TaskName, WorkItem},
    };

    /// Runs `SplitFbd` items whose county names say how they behave.
    struct Scripted;

    impl PreparedTask for Scripted {
        fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
            async move {
                let WorkItem::SplitFbd { county } = item else {
                    panic!("only county items are scripted");
                };
                match county.as_str() {
                    "lane-failure" => {
                        return Err(TaskError::lane(Error::MissingInput(PathBuf::from(&county))))
                    }
                    "panic" => panic!("county {county} blew up"),
                    "slow" => tokio::time::sleep(Duration::from_secs(100)).await,
                    _ => {}
                }
                scope.progress(format!("county {county}"), None).await?;
                Ok(())
            }
            .boxed()
        }
    }

    struct ScriptedHandler {
        prepares: bool,
    }

    impl TaskHandler for ScriptedHandler {
        fn task(&self) -> TaskName {
            TaskName::ParseFbd
        }

        fn prepare(&self, _: Arc<Context>) -> BoxFuture<'static, Result<Arc<dyn PreparedTask>>> {
            let prepares = self.prepares;
            async move {
                if !prepares {
                    return Err(Error::MissingInput(PathBuf::from("prepared.bin")));
                }
                let task: Arc<dyn PreparedTask> = Arc::new(Scripted);
                Ok(task)
            }
            .boxed()
        }
    }

    fn context(idle_timeout_secs: u64) -> Arc<Context> {
        let mut phase = phase_config(Path::new("/tmp/nbm"));
        phase.coordination.idle_timeout_secs = idle_timeout_secs;
        let settings = Settings::new(
            phase,
            DbConfig::builder()
                .schema("nbm2")
                .host("localhost")
                .user("nbm")
                .database("broadband")
                .build(),
            QueueConfig::builder().host("127.0.0.1").auth_key("secret").build(),
        )
        .unwrap();
        Arc::new(Context::new(settings, "servant-1"))
    }

    fn order(ctx: &Context, lanes: u32, epoch: u64) -> PhaseOrder {
        PhaseOrder {
            task: TaskName::ParseFbd,
            lanes,
            epoch,
            config_digest: ctx.settings.digest(),
        }
    }

    fn lane(queues: &QueueSet, epoch: u64) -> Lane {
        Lane {
            work: queues.work.clone(),
            reporter: Reporter::new(
                queues.result.clone(),
                Origin {
                    host: "servant-1".into(),
                    pid: 1,
                    lane: 0,
                },
                epoch,
            ),
            task: Arc::new(Scripted),
            cancel: CancellationToken::new(),
            heartbeat: Duration::from_secs(15),
        }
    }

    fn county(epoch: u64, county: &str) -> WorkEnvelope {
        WorkEnvelope {
            epoch,
            item: WorkItem::SplitFbd {
                county: county.into(),
            },
        }
    }

    async fn messages(queues: &QueueSet) -> Vec<ResultMessage> {
        let mut messages = Vec::new();
        while let Some(message) = queues.result.try_get().await.unwrap() {
            messages.push(message);
        }
        messages
    }

    async fn reports(queues: &QueueSet) -> Vec<Report> {
        messages(queues).await.into_iter().map(|m| m.report).collect()
    }

    fn count(reports: &[Report], wanted: impl Fn(&Report) -> bool) -> usize {
        reports.iter().filter(|r| wanted(r)).count()
    }

    fn is_error(report: &Report) -> bool {
        matches!(report, Report::Error { .. })
    }

    fn is_unconsumed_stop(report: &Report) -> bool {
        matches!(report, Report::Stopped { consumed_sentinel: false })
    }

    #[tokio::test]
    async fn work_from_a_later_phase_is_put_back() {
        let queues = QueueSet::local();
        queues.work.put(county(4, "01001")).await.unwrap();

        let lane = lane(&queues, 3);
        assert_eq!(lane.work_loop().await.unwrap(), Exit::Superseded);
        assert_eq!(queues.work.size().await.unwrap(), 1);
        assert_eq!(queues.work.get().await.unwrap(), county(4, "01001"));

        queues.work.put(county(4, "01001")).await.unwrap();
        lane.run().await.unwrap();
        assert_eq!(queues.work.size().await.unwrap(), 1);
        assert_eq!(
            reports(&queues).await,
            [Report::Stopped {
                consumed_sentinel: false
            }]
        );
    }

    #[tokio::test]
    async fn leftovers_from_an_earlier_phase_are_skipped() {
        let queues = QueueSet::local();
        queues.work.put(county(2, "01001")).await.unwrap();
        queues.work.put(WorkEnvelope::stop(2)).await.unwrap();
        queues.work.put(WorkEnvelope::stop(3)).await.unwrap();

        lane(&queues, 3).run().await.unwrap();
        let reports = reports(&queues).await;
        assert_eq!(reports.len(), 3);
        assert!(matches!(
            &reports[0],
            Report::Debug { message } if message.contains("county 01001") && message.contains("phase 2")
        ));
        assert!(matches!(&reports[1], Report::Debug { .. }));
        assert_eq!(
            reports[2],
            Report::Stopped {
                consumed_sentinel: true
            }
        );
        assert_eq!(queues.work.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn a_lane_failure_stops_every_sibling() {
        tokio::time::pause();
        let ctx = context(1800);
        let queues = QueueSet::local();
        let order = order(&ctx, 3, 1);
        // no sentinels: only cancellation can end the idle siblings
        queues.work.put(county(1, "lane-failure")).await.unwrap();

        let handler: Arc<dyn TaskHandler> = Arc::new(ScriptedHandler { prepares: true });
        tokio::time::timeout(
            Duration::from_secs(600),
            run_pool(ctx, handler, &order, &queues),
        )
        .await
        .expect("siblings kept waiting for work")
        .unwrap();

        let reports = reports(&queues).await;
        assert_eq!(count(&reports, is_error), 1);
        assert_eq!(count(&reports, is_unconsumed_stop), 3);
    }

    #[tokio::test]
    async fn a_pool_that_cannot_prepare_still_stops_every_lane() {
        let ctx = context(1800);
        let queues = QueueSet::local();
        let order = order(&ctx, 4, 7);

        let handler: Arc<dyn TaskHandler> = Arc::new(ScriptedHandler { prepares: false });
        run_pool(ctx, handler, &order, &queues).await.unwrap();

        let messages = messages(&queues).await;
        assert_eq!(messages.len(), 5);
        assert!(matches!(
            &messages[0].report,
            Report::Error { message, .. } if message.contains("preparing parse_fbd")
        ));
        let lanes: Vec<_> = messages[1..].iter().map(|m| m.origin.lane).collect();
        assert_eq!(lanes, [0, 1, 2, 3]);
        assert!(messages[1..]
            .iter()
            .all(|m| m.epoch == 7 && is_unconsumed_stop(&m.report)));
    }

    #[tokio::test]
    async fn a_panicking_lane_is_acknowledged_for() {
        tokio::time::pause();
        let ctx = context(1800);
        let queues = QueueSet::local();
        let order = order(&ctx, 2, 1);
        queues.work.put(county(1, "panic")).await.unwrap();

        let handler: Arc<dyn TaskHandler> = Arc::new(ScriptedHandler { prepares: true });
        tokio::time::timeout(
            Duration::from_secs(600),
            run_pool(ctx, handler, &order, &queues),
        )
        .await
        .expect("sibling kept waiting for work")
        .unwrap();

        let reports = reports(&queues).await;
        assert_eq!(count(&reports, is_error), 1);
        assert_eq!(count(&reports, is_unconsumed_stop), 2);
    }

    #[tokio::test]
    async fn heartbeats_cover_a_long_item() {
        tokio::time::pause();
        // items run for 100s, far past the idle deadline
        let ctx = context(20);
        let idle = ctx.settings.phase.coordination.idle_timeout();
        let queues = QueueSet::local();
        let order = order(&ctx, 1, 1);
        queues.work.put(county(1, "slow")).await.unwrap();
        queues.work.put(WorkEnvelope::stop(1)).await.unwrap();

        let watcher = tokio::spawn({
            let results = queues.result.clone();
            async move {
                let mut heartbeats = 0;
                loop {
                    let message = results
                        .get_timeout(idle)
                        .await
                        .unwrap()
                        .expect("idle deadline passed during a long item");
                    match message.report {
                        Report::Heartbeat => heartbeats += 1,
                        Report::Stopped { consumed_sentinel } => {
                            assert!(consumed_sentinel);
                            return heartbeats;
                        }
                        _ => {}
                    }
                }
            }
        });

        let handler: Arc<dyn TaskHandler> = Arc::new(ScriptedHandler { prepares: true });
        run_pool(ctx, handler, &order, &queues).await.unwrap();
        // one every 15s until the item finishes at 100s
        assert_eq!(watcher.await.unwrap(), 6);
    }
}
