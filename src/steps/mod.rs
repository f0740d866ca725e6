//! The numbered pipeline steps.
//!
//! Each step has a master side (`run`, driven by the pipeline) and, for the
//! distributed parts, the task handlers the servants register. Work items
//! carry everything a lane needs beyond the shared settings.

use std::{future::Future, path::Path, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tracing::{debug, info, warn};

use crate::{
    aggregate::{collapse_max, read_fbd, BlockMaster, PreparedInputs},
    config::{PhaseConfig, Settings},
    error::{Error, Result},
    layout::Layout,
    protocol::{TaskName, WorkItem},
    servant::{handlers as by_task, Context, Handlers, PreparedTask, TaskError, TaskHandler},
};

pub mod files;
pub mod geojson;
pub mod step0;
pub mod step1;
pub mod step2;
pub mod step3;
pub mod step4;
pub mod step5;
pub mod step6;

/// Block master columns every aggregation needs besides the geographies.
const AREA_KEYS: [&str; 2] = ["urban_rural", "tribal_non"];

/// Every task a servant can run.
pub fn handlers() -> Handlers {
    let mut list = vec![
        handler(TaskName::LoadComplexShape, step0::prepare_shape_loader),
        handler(TaskName::LoadOtherFiles, step0::prepare_table_loader),
        handler(TaskName::InitialSpatialIntersection, step0::prepare_overlay),
        handler(TaskName::ParseFbd, step0::prepare_county_split),
        handler(TaskName::CreateBlockNumprov, step2::prepare),
        handler(TaskName::CreateTractNumprov, step3::prepare),
        handler(TaskName::TractSort, step5::prepare_tracts),
        handler(TaskName::ProviderFiles, step5::prepare_providers),
    ];
    list.extend(step6::TASKS.map(step6::tool_handler));
    by_task(list)
}

/// A handler whose pool state comes from an async constructor.
struct Handler<F> {
    task: TaskName,
    prepare: F,
}

impl<F, Fut> TaskHandler for Handler<F>
where
    F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn PreparedTask>>> + Send + 'static,
{
    fn task(&self) -> TaskName {
        self.task
    }

    fn prepare(&self, ctx: Arc<Context>) -> BoxFuture<'static, Result<Arc<dyn PreparedTask>>> {
        (self.prepare)(ctx).boxed()
    }
}

pub(crate) fn handler<F, Fut>(task: TaskName, prepare: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn PreparedTask>>> + Send + 'static,
{
    Arc::new(Handler { task, prepare })
}

/// The error a pool returns for an item of the wrong kind.
pub(crate) fn unexpected(task: TaskName, item: &WorkItem) -> TaskError {
    TaskError::item(Error::UnexpectedItem {
        task,
        item: item.describe(),
    })
}

/// Runs CPU-heavy work off the async workers.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

/// Block master columns read into memory: every `geog_dict` column plus the
/// area table keys.
pub fn block_attributes(phase: &PhaseConfig) -> Vec<String> {
    let mut names: Vec<String> = phase.geog_dict.iter().map(|(column, _)| column.clone()).collect();
    for key in AREA_KEYS {
        if !names.iter().any(|n| n == key) {
            names.push(key.to_string());
        }
    }
    names
}

/// Loads the prepared-inputs cache, building it from the CSV inputs first
/// when it is missing or unreadable. Only the master builds the cache.
pub async fn prepare_inputs(settings: &Settings, layout: &Layout) -> Result<Arc<PreparedInputs>> {
    let cache = files::prepared_inputs(layout, settings);
    let fbd = files::fbd_input(layout, settings);
    let block_master = files::block_master_input(layout, settings);
    let phase = settings.phase.clone();
    blocking(move || {
        match PreparedInputs::load(&cache) {
            Ok(inputs) => {
                debug!(path = %cache.display(), "reusing prepared inputs");
                return Ok(Arc::new(inputs));
            }
            Err(Error::MissingInput(_)) => {}
            Err(e) => warn!(error = %e, "rebuilding prepared inputs"),
        }
        let inputs = build_inputs(&phase, &fbd, &block_master)?;
        inputs.save(&cache)?;
        info!(
            records = inputs.fbd.len(),
            blocks = inputs.blocks.blocks.len(),
            "prepared inputs"
        );
        Ok(Arc::new(inputs))
    })
    .await
}

fn build_inputs(phase: &PhaseConfig, fbd: &Path, block_master: &Path) -> Result<PreparedInputs> {
    let records = collapse_max(read_fbd(fbd, &phase.fbd_rename_columns)?);
    let blocks = BlockMaster::read(block_master, &phase.geoid_column(), &block_attributes(phase))?;
    Ok(PreparedInputs {
        fbd: records,
        blocks,
    })
}

/// Loads the cache the master prepared. Servants never build it themselves.
pub(crate) async fn load_prepared(ctx: &Context) -> Result<Arc<PreparedInputs>> {
    let cache = files::prepared_inputs(&ctx.layout, &ctx.settings);
    blocking(move || PreparedInputs::load(&cache).map(Arc::new)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::phase_config;

    #[test]
    fn every_task_has_a_handler() {
        let handlers = handlers();
        for task in [
            TaskName::LoadComplexShape,
            TaskName::LoadOtherFiles,
            TaskName::InitialSpatialIntersection,
            TaskName::ParseFbd,
            TaskName::CreateBlockNumprov,
            TaskName::CreateTractNumprov,
            TaskName::TractSort,
            TaskName::ProviderFiles,
            TaskName::InitialGeojson,
            TaskName::ZoomMbtiles,
            TaskName::LargeZoomMbtiles,
            TaskName::SpeedMbtile,
            TaskName::PrepProviders,
            TaskName::MakeProviders,
        ] {
            assert_eq!(handlers.get(&task).map(|h| h.task()), Some(task));
        }
    }

    #[test]
    fn area_keys_follow_the_geographies() {
        let dir = tempfile::tempdir().unwrap();
        let phase = phase_config(dir.path());
        let names = block_attributes(&phase);
        assert_eq!(names.len(), phase.geog_dict.len() + 2);
        assert_eq!(&names[names.len() - 2..], ["urban_rural", "tribal_non"]);
    }
}
