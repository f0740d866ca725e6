//! Step 1: the provider table. Runs on the master alone.

use tokio::time::Instant;
use tracing::info;

use super::{blocking, files, prepare_inputs};
use crate::{
    aggregate::{provider_table, write_provider_table, Thresholds},
    driver::Pipeline,
    error::Result,
};

pub async fn run(pipeline: &mut Pipeline) -> Result<bool> {
    let started = Instant::now();
    let settings = pipeline.settings();
    let layout = pipeline.layout();
    let inputs = prepare_inputs(&settings, &layout).await?;
    let out = files::provider_table(&layout, &settings.phase.fbd_vintage);

    let rows = blocking(move || {
        let phase = &settings.phase;
        let down = Thresholds::new(phase.d_column_list.clone(), phase.d_val_arr.clone());
        let up = Thresholds::new(phase.u_column_list.clone(), phase.u_val_arr.clone());
        let rows = provider_table(
            &inputs.fbd,
            &inputs.blocks,
            &phase.tech_dict,
            &phase.tech_stack,
            &down,
            &up,
        );
        write_provider_table(&rows, &down, &up, &out)?;
        Ok(rows.len())
    })
    .await?;

    info!(rows, "wrote provider table");
    pipeline.task_done("provider_table", started);
    Ok(true)
}
