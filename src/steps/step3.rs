//! Step 3: tract and county roll-ups of the block counts.

use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};
use tokio::time::Instant;

use super::{blocking, files, load_prepared, unexpected};
use crate::{
    aggregate::{read_numprov_counts, roll_up, PreparedInputs, RollUpLevel},
    driver::Pipeline,
    error::Result,
    layout::Layout,
    master::PhasePlan,
    protocol::{Payload, TaskName, WorkItem},
    servant::{Context, ItemScope, PreparedTask, TaskError},
};

/// Every item reports once per level.
const LEVELS: [RollUpLevel; 2] = [RollUpLevel::Tract, RollUpLevel::County];

pub async fn run(pipeline: &mut Pipeline) -> Result<bool> {
    let started = Instant::now();
    let settings = pipeline.settings();
    let items = settings
        .phase
        .speed_tiers()
        .iter()
        .map(|tier| WorkItem::TractNumprov { tier: tier.into() })
        .collect();
    let task = TaskName::CreateTractNumprov;
    let plan = PhasePlan::new(task, pipeline.lanes(task), items).progress_per_item(LEVELS.len());
    if !pipeline.distribute(plan).await?.succeeded {
        return Ok(false);
    }
    pipeline.task_done("create_tract_numprov", started);
    Ok(true)
}

struct RollUps {
    inputs: Arc<PreparedInputs>,
    layout: Layout,
    fbd_vintage: String,
}

pub(super) async fn prepare(ctx: Arc<Context>) -> Result<Arc<dyn PreparedTask>> {
    Ok(Arc::new(RollUps {
        inputs: load_prepared(&ctx).await?,
        layout: ctx.layout.clone(),
        fbd_vintage: ctx.settings.phase.fbd_vintage.clone(),
    }))
}

impl RollUps {
    fn output(&self, level: RollUpLevel, speed: &str) -> String {
        let path = match level {
            RollUpLevel::Tract => files::tract_numprov(&self.layout, speed, &self.fbd_vintage),
            RollUpLevel::County => files::county_numprov(&self.layout, speed, &self.fbd_vintage),
        };
        path.display().to_string()
    }
}

impl PreparedTask for RollUps {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
        async move {
            let speed = match item {
                WorkItem::TractNumprov { tier } => tier.label,
                other => return Err(unexpected(TaskName::CreateTractNumprov, &other)),
            };
            let source = files::block_numprov_zero(&self.layout, &speed, &self.fbd_vintage);
            let (columns, counts) = blocking(move || read_numprov_counts(&source)).await?;
            let (columns, counts) = (Arc::new(columns), Arc::new(counts));

            for level in LEVELS {
                let out = self.output(level, &speed);
                let (inputs, columns, counts) = (self.inputs.clone(), columns.clone(), counts.clone());
                let target = out.clone();
                let units = blocking(move || {
                    let rolled = roll_up(level, &columns, &counts, &inputs.blocks);
                    rolled.write(std::path::Path::new(&target))?;
                    Ok(rolled.rows.len())
                })
                .await?;
                scope
                    .progress(
                        format!("{units} {} rows for speed {speed}", level.name()),
                        Some(Payload::File(out)),
                    )
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        aggregate::{BlockMaster, BlockRecord},
        config::tests::phase_config,
        protocol::{Origin, Tier},
        queue::QueueSet,
        servant::Reporter,
    };

    fn block(geoid: &str, pop: u64) -> BlockRecord {
        BlockRecord {
            geoid: geoid.into(),
            pop,
            h2only_undev: None,
            attributes: vec![],
        }
    }

    #[tokio::test]
    async fn a_rerun_rewrites_identical_rollups() {
        let dir = tempfile::tempdir().unwrap();
        let phase = phase_config(dir.path());
        let layout = phase.layout();
        layout.ensure().unwrap();
        fs::write(
            files::block_numprov_zero(&layout, "25_3", "jun2018"),
            "geoid10,h2only_undev,a_25_3,c_25_3\n\
             010010201001000,0,2,1\n\
             010010201001001,0,1,0\n\
             010030114001000,0,0,1\n",
        )
        .unwrap();

        let rollups = RollUps {
            inputs: Arc::new(PreparedInputs {
                fbd: vec![],
                blocks: BlockMaster {
                    attribute_names: vec![],
                    blocks: vec![
                        block("010010201001000", 30),
                        block("010010201001001", 10),
                        block("010010201001002", 0),
                        block("010030114001000", 5),
                        block("010050101001000", 0),
                    ],
                },
            }),
            layout: layout.clone(),
            fbd_vintage: "jun2018".into(),
        };
        let queues = QueueSet::local();
        let origin = Origin {
            host: "servant-1".into(),
            pid: 1,
            lane: 0,
        };
        let scope = ItemScope::new(Reporter::new(queues.result.clone(), origin, 1), 0);
        let item = || WorkItem::TractNumprov {
            tier: Tier {
                label: "25_3".into(),
                down: 25.,
                up: 3.,
            },
        };
        let outputs = [
            files::tract_numprov(&layout, "25_3", "jun2018"),
            files::county_numprov(&layout, "25_3", "jun2018"),
        ];

        rollups.run(&scope, item()).await.unwrap();
        let first: Vec<_> = outputs.iter().map(|path| fs::read(path).unwrap()).collect();
        rollups.run(&scope, item()).await.unwrap();
        let second: Vec<_> = outputs.iter().map(|path| fs::read(path).unwrap()).collect();
        assert_eq!(first, second);

        let county = String::from_utf8(first[1].clone()).unwrap();
        assert_eq!(
            county,
            "county_id,a_25_3,c_25_3,is_populated\n\
             01001,1.8,0.8,True\n\
             01003,0.0,1.0,True\n\
             01005,,,False\n"
        );
        assert_eq!(queues.result.size().await.unwrap(), 4);
    }
}
