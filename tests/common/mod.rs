#![allow(dead_code)]

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use futures::{future::BoxFuture, FutureExt};
use nbm::{
    config::{defaults, Coordination, DbConfig, PhaseConfig, QueueConfig, Settings},
    error::{Error, Result},
    protocol::{Payload, TaskName, WorkItem},
    queue::QueueSet,
    servant::{handlers, Context, ItemScope, PreparedTask, Servant, TaskError, TaskHandler},
};
use tokio::task::JoinHandle;

pub fn settings(root: &Path, servers: usize) -> Settings {
    let (d_column_list, d_val_arr) = defaults::d_columns();
    let (u_column_list, u_val_arr) = defaults::u_columns();
    let mut phase = PhaseConfig::builder()
        .number_servers(servers)
        .steps(Default::default())
        .nbm2_root(root.to_path_buf())
        .d_column_list(d_column_list)
        .d_val_arr(d_val_arr)
        .u_column_list(u_column_list)
        .u_val_arr(u_val_arr)
        .tech_dict(defaults::tech_dict())
        .techlist(defaults::techlist())
        .speed_list(defaults::speed_list())
        .down_speed(defaults::down_speed())
        .up_speed(defaults::up_speed())
        .build();
    phase.coordination = Coordination {
        idle_timeout_secs: 10,
        stop_ack_timeout_secs: 10,
        heartbeat_secs: 1,
    };
    Settings::new(
        phase,
        DbConfig::builder()
            .schema("nbm2")
            .host("localhost")
            .user("nbm")
            .database("broadband")
            .build(),
        QueueConfig::builder().host("127.0.0.1").auth_key("secret").build(),
    )
    .unwrap()
}

/// Splits counties, failing the ones it is told to.
pub struct CountySplitter {
    pub failing: Vec<String>,
    pub seen: Arc<Mutex<Vec<String>>>,
}

struct Prepared {
    failing: Vec<String>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl TaskHandler for CountySplitter {
    fn task(&self) -> TaskName {
        TaskName::ParseFbd
    }

    fn prepare(&self, _ctx: Arc<Context>) -> BoxFuture<'static, Result<Arc<dyn PreparedTask>>> {
        let prepared: Arc<dyn PreparedTask> = Arc::new(Prepared {
            failing: self.failing.clone(),
            seen: self.seen.clone(),
        });
        async move { Ok(prepared) }.boxed()
    }
}

impl PreparedTask for Prepared {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
        async move {
            let WorkItem::SplitFbd { county } = item else {
                return Err(TaskError::item(Error::InvalidConfig("not a county".into())));
            };
            self.seen.lock().unwrap().push(county.clone());
            if self.failing.contains(&county) {
                return Err(TaskError::item(Error::MissingInput(format!("fbd_{county}.csv").into())));
            }
            scope
                .progress(format!("split {county}"), Some(Payload::File(format!("fbd_{county}.csv"))))
                .await?;
            Ok(())
        }
        .boxed()
    }
}

pub fn counties(n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| WorkItem::SplitFbd {
            county: format!("01{:03}", 2 * i + 1),
        })
        .collect()
}

/// Starts `n` servants sharing `queues`, each with its own name.
pub fn spawn_servants(
    n: usize,
    queues: &QueueSet,
    settings: &Settings,
    failing: &[&str],
    seen: &Arc<Mutex<Vec<String>>>,
) -> Vec<JoinHandle<Result<()>>> {
    (0..n)
        .map(|i| {
            let splitter = CountySplitter {
                failing: failing.iter().map(|c| c.to_string()).collect(),
                seen: seen.clone(),
            };
            let servant = Servant::new(
                queues.clone(),
                Context::new(settings.clone(), format!("servant-{i}")),
                handlers([Arc::new(splitter) as Arc<dyn TaskHandler>]),
            );
            tokio::spawn(servant.run())
        })
        .collect()
}
