//! Step 4: base geography tiles. Runs on the master alone.
//!
//! Every geography in `basic_geojson` is exported from the database as
//! GeoJSON, with feature bounding boxes where enabled, and tiled with
//! `tippecanoe` at its configured zoom range.

use std::path::Path;

use serde_json::Map;
use tokio::time::Instant;
use tracing::{error, info};

use super::{
    files,
    geojson::{feature, FeatureWriter},
};
use crate::{
    config::{PhaseConfig, Settings},
    db::{column, Database},
    driver::Pipeline,
    error::{Error, Result},
    layout::Layout,
    protocol::ToolJob,
    tools,
};

pub async fn run(pipeline: &mut Pipeline) -> Result<bool> {
    let settings = pipeline.settings();
    let layout = pipeline.layout();
    let db = pipeline.database().await?;

    for geography in &settings.phase.basic_geojson {
        let started = Instant::now();
        let out = files::geography_geojson(&layout, geography, &settings.phase.geometry_vintage);
        let features = export(&db, &settings.phase, geography, &out).await?;
        info!(geography, features, "exported geojson");

        if settings.phase.step4.make_tiles {
            let job = tile_job(&settings, &layout, geography)?;
            if let Err(e) = tools::run(&job).await {
                error!(geography, error = %e, "could not tile geography");
                return Ok(false);
            }
        }
        pipeline.task_done(&format!("{geography} tiles"), started);
    }
    Ok(true)
}

/// Column of the geography table that identifies a feature.
fn source_id(geography: &str) -> &'static str {
    match geography {
        "block" => "BLOCK_FIPS",
        _ => "GEOID",
    }
}

/// Property the feature id is published under; the speed files join on it.
pub fn id_property(phase: &PhaseConfig, geography: &str) -> String {
    match geography {
        "block" => phase.geoid_column(),
        "county" => "county_id".into(),
        "tract" => "tract_id".into(),
        _ => "geoid".into(),
    }
}

/// Whether features of `geography` carry a bounding box.
fn with_bbox(phase: &PhaseConfig, geography: &str) -> bool {
    phase.step4.bounding_box && (geography != "block" || phase.step4.block_bounding_box)
}

/// The configured extent of features that straddle the antimeridian.
pub fn bbox_override(phase: &PhaseConfig, geography: &str, id: &str) -> Option<[f64; 4]> {
    phase
        .modify_bbox
        .iter()
        .find(|(geo, geoid, _)| geo == geography && geoid == id)
        .map(|(_, _, bbox)| *bbox)
}

async fn export(db: &Database, phase: &PhaseConfig, geography: &str, out: &Path) -> Result<usize> {
    let table = db.table(geography, &phase.geometry_vintage);
    let (id, geometry) = (column(source_id(geography)), column("GEOMETRY"));
    let property = id_property(phase, geography);
    let bbox = with_bbox(phase, geography);

    let mut writer = FeatureWriter::create(out)?;
    db.for_each_row(
        &format!(
            "SELECT {id}::text, ST_AsGeoJSON({geometry}), ST_XMin({geometry}), \
             ST_YMin({geometry}), ST_XMax({geometry}), ST_YMax({geometry}) \
             FROM {table} ORDER BY 1"
        ),
        &[],
        |row| {
            let geoid: String = row.get(0);
            let shape: String = row.get(1);
            let extent = bbox.then(|| {
                bbox_override(phase, geography, &geoid)
                    .unwrap_or_else(|| [row.get(2), row.get(3), row.get(4), row.get(5)])
            });
            let mut properties = Map::new();
            properties.insert(property.clone(), geoid.into());
            writer.write(&feature(properties, &shape, extent)?)
        },
    )
    .await?;
    writer.finish()
}

/// `tippecanoe` over the exported file at the geography's zoom range.
pub fn tile_job(settings: &Settings, layout: &Layout, geography: &str) -> Result<ToolJob> {
    let phase = &settings.phase;
    let (min, max) = phase.zoom_params.get(geography).copied().ok_or_else(|| {
        Error::InvalidConfig(format!("zoom_params has no entry for {geography}"))
    })?;
    let input = files::geography_geojson(layout, geography, &phase.geometry_vintage);
    let output = files::geography_tiles(layout, geography, &phase.geometry_vintage);
    let args = vec![
        "-f".to_string(),
        "-o".into(),
        output.display().to_string(),
        format!("-Z{min}"),
        format!("-z{max}"),
        "-l".into(),
        geography.to_string(),
        "--detect-shared-borders".into(),
        input.display().to_string(),
    ];
    Ok(ToolJob {
        label: format!("{geography} tiles"),
        program: "tippecanoe".into(),
        args,
        output: output.display().to_string(),
        capture_stdout: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{tests::phase_config, DbConfig, QueueConfig};

    fn settings(root: &Path) -> Settings {
        Settings::new(
            phase_config(root),
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

    #[test]
    fn alaska_keeps_its_configured_extent() {
        let dir = tempfile::tempdir().unwrap();
        let phase = phase_config(dir.path());
        let bbox = bbox_override(&phase, "county", "02016").unwrap();
        assert!(bbox[0] < -180.);
        assert_eq!(bbox_override(&phase, "county", "01001"), None);
        assert_eq!(bbox_override(&phase, "place", "02016"), None);
    }

    #[test]
    fn feature_ids_match_the_speed_file_keys() {
        let dir = tempfile::tempdir().unwrap();
        let phase = phase_config(dir.path());
        assert_eq!(id_property(&phase, "block"), "geoid10");
        assert_eq!(id_property(&phase, "county"), "county_id");
        assert_eq!(id_property(&phase, "cbsa"), "geoid");
        assert!(!with_bbox(&phase, "block"));
        assert!(with_bbox(&phase, "state"));
    }

    #[test]
    fn tiles_use_the_configured_zoom_range() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let layout = settings.phase.layout();
        let job = tile_job(&settings, &layout, "county").unwrap();
        assert_eq!(job.program, "tippecanoe");
        assert!(job.args.contains(&"-Z0".to_string()));
        assert!(job.args.contains(&"-z7".to_string()));
        assert!(job.output.ends_with("outputs/mapbox_tile/nbm2_county_2018.mbtiles"));
        assert!(matches!(
            tile_job(&settings, &layout, "zcta"),
            Err(Error::InvalidConfig(_))
        ));
    }
}
