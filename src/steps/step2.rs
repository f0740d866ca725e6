//! Step 2: block-level provider counts and the area table, one work item
//! per speed tier.

use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};
use tokio::time::Instant;
use tracing::info;

use super::{blocking, files, load_prepared, prepare_inputs, unexpected};
use crate::{
    aggregate::{
        area_table, block_numprov, merge_area_tables, write_area_table, PreparedInputs, SpeedTier,
        Taxonomy,
    },
    config::PhaseConfig,
    driver::Pipeline,
    error::Result,
    layout::Layout,
    master::PhasePlan,
    protocol::{Payload, TaskName, Tier, WorkItem},
    servant::{Context, ItemScope, PreparedTask, TaskError},
};

pub async fn run(pipeline: &mut Pipeline) -> Result<bool> {
    let started = Instant::now();
    let settings = pipeline.settings();
    let layout = pipeline.layout();
    // servants read the cache, so it has to exist before the items go out
    prepare_inputs(&settings, &layout).await?;

    let tiers = settings.phase.speed_tiers();
    let items = tiers
        .iter()
        .map(|tier| WorkItem::BlockNumprov { tier: tier.into() })
        .collect();
    let task = TaskName::CreateBlockNumprov;
    let plan = PhasePlan::new(task, pipeline.lanes(task), items);
    if !pipeline.distribute(plan).await?.succeeded {
        return Ok(false);
    }

    // merged in speed order, whatever order the parts arrived in
    let fbd_vintage = &settings.phase.fbd_vintage;
    let parts: Vec<_> = tiers
        .iter()
        .map(|tier| files::area_table_part(&layout, &tier.label, fbd_vintage))
        .collect();
    let out = files::area_table(&layout, fbd_vintage);
    let rows = blocking(move || merge_area_tables(&parts, &out)).await?;
    info!(rows, "merged area table");
    pipeline.task_done("create_block_numprov", started);
    Ok(true)
}

struct BlockCounts {
    inputs: Arc<PreparedInputs>,
    taxonomy: Arc<Taxonomy>,
    phase: Arc<PhaseConfig>,
    layout: Layout,
}

pub(super) async fn prepare(ctx: Arc<Context>) -> Result<Arc<dyn PreparedTask>> {
    Ok(Arc::new(BlockCounts {
        inputs: load_prepared(&ctx).await?,
        taxonomy: Arc::new(ctx.settings.phase.taxonomy()),
        phase: Arc::new(ctx.settings.phase.clone()),
        layout: ctx.layout.clone(),
    }))
}

impl BlockCounts {
    /// Writes both numprov files and the area table part of one tier and
    /// returns the part's path.
    fn tier(&self, tier: Tier) -> Result<String> {
        let tier = SpeedTier::from(tier);
        let phase = &self.phase;
        let numprov = block_numprov(
            &self.inputs.fbd,
            &self.inputs.blocks,
            &self.taxonomy,
            &tier,
            &phase.geoid_column(),
        );
        numprov.write_null(&files::block_numprov(&self.layout, &tier.label, &phase.fbd_vintage))?;
        numprov.write_zero(&files::block_numprov_zero(&self.layout, &tier.label, &phase.fbd_vintage))?;

        let rows = area_table(&numprov, &self.inputs.blocks, &phase.geog_dict)?;
        let part = files::area_table_part(&self.layout, &tier.label, &phase.fbd_vintage);
        write_area_table(&rows, &part)?;
        Ok(part.display().to_string())
    }
}

impl PreparedTask for BlockCounts {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
        async move {
            let tier = match item {
                WorkItem::BlockNumprov { tier } => tier,
                other => return Err(unexpected(TaskName::CreateBlockNumprov, &other)),
            };
            let label = tier.label.clone();
            let counts = BlockCounts {
                inputs: self.inputs.clone(),
                taxonomy: self.taxonomy.clone(),
                phase: self.phase.clone(),
                layout: self.layout.clone(),
            };
            let part = blocking(move || counts.tier(tier)).await?;
            scope
                .progress(format!("block numprov for speed {label}"), Some(Payload::File(part)))
                .await?;
            Ok(())
        }
        .boxed()
    }
}
