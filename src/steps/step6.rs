//! Step 6: speed and provider tile sets.
//!
//! Every sub-step is a list of external tool invocations planned on the
//! master; servants only run them. One tool handler serves all six tasks.

use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};
use tokio::time::Instant;

use super::{files, handler, unexpected};
use crate::{
    config::Settings,
    driver::Pipeline,
    error::Result,
    layout::Layout,
    master::PhasePlan,
    protocol::{Payload, TaskName, ToolJob, WorkItem},
    servant::{Context, ItemScope, PreparedTask, TaskError, TaskHandler},
    tools,
};

pub const TASKS: [TaskName; 6] = [
    TaskName::InitialGeojson,
    TaskName::ZoomMbtiles,
    TaskName::LargeZoomMbtiles,
    TaskName::SpeedMbtile,
    TaskName::PrepProviders,
    TaskName::MakeProviders,
];

const TIPPECANOE: &str = "tippecanoe";
const JSON_TOOL: &str = "tippecanoe-json-tool";
const TILE_JOIN: &str = "tile-join";

/// The geometry a speed band is cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    County,
    Tracts,
    Block,
}

impl Level {
    fn name(self) -> &'static str {
        match self {
            Level::County => "county",
            Level::Tracts => "tracts",
            Level::Block => "block",
        }
    }

    /// The join key, kept out of the tiles.
    fn id(self, settings: &Settings) -> String {
        match self {
            Level::County => "county_id".into(),
            Level::Tracts => "tract_id".into(),
            Level::Block => settings.phase.geoid_column(),
        }
    }
}

struct Band {
    name: &'static str,
    level: Level,
    zoom: &'static [&'static str],
}

static ZOOM_BANDS: [Band; 4] = [
    Band {
        name: "county",
        level: Level::County,
        zoom: &["-Z0", "-z4"],
    },
    Band {
        name: "tract_z5",
        level: Level::Tracts,
        zoom: &["-Z5", "-z5", "-S", "8", "--coalesce"],
    },
    Band {
        name: "tract_z6",
        level: Level::Tracts,
        zoom: &["-Z6", "-z8"],
    },
    Band {
        name: "tract_z9",
        level: Level::Tracts,
        zoom: &["-Z9", "-z9"],
    },
];

static LARGE_ZOOM_BANDS: [Band; 2] = [
    Band {
        name: "block_z10",
        level: Level::Block,
        zoom: &["-Z10", "-z10", "-S", "8", "--coalesce"],
    },
    Band {
        name: "block_z11",
        level: Level::Block,
        zoom: &["-Z11", "-z14", "-d", "14"],
    },
];

/// Large providers get their own tile set with a different zoom split.
static PROVIDER_SETS: [(&str, bool, [(&str, &[&str]); 2]); 2] = [
    (
        "large_prov",
        true,
        [("prov_lg_z0", &["-Z0", "-z7", "-S", "8"]), ("prov_lg_z8", &["-Z8", "-z12"])],
    ),
    (
        "other_prov",
        false,
        [("prov_other_z0", &["-Z0", "-z8", "-S", "8"]), ("prov_other_z9", &["-Z9", "-z12"])],
    ),
];

pub async fn run(pipeline: &mut Pipeline) -> Result<bool> {
    let settings = pipeline.settings();
    let layout = pipeline.layout();
    let toggles = &settings.phase.step6;
    let enabled = [
        toggles.make_data_files,
        toggles.create_zoom_files,
        toggles.create_large_zoom_files,
        toggles.combine_speeds,
        toggles.prepare_provider,
        toggles.make_provider_files,
    ];

    for (task, enabled) in TASKS.into_iter().zip(enabled) {
        if !enabled {
            continue;
        }
        let started = Instant::now();
        let items = jobs(task, &settings, &layout)
            .into_iter()
            .map(WorkItem::Tool)
            .collect();
        let plan = PhasePlan::new(task, pipeline.lanes(task), items);
        if !pipeline.distribute(plan).await?.succeeded {
            return Ok(false);
        }
        pipeline.task_done(task.as_str(), started);
    }
    Ok(true)
}

/// The tool invocations of one step 6 task.
pub fn jobs(task: TaskName, settings: &Settings, layout: &Layout) -> Vec<ToolJob> {
    let speeds = &settings.phase.speed_list;
    match task {
        TaskName::InitialGeojson => speeds
            .iter()
            .flat_map(|speed| {
                [Level::Tracts, Level::County, Level::Block]
                    .map(|level| join_speeds(settings, layout, level, speed))
            })
            .collect(),
        TaskName::ZoomMbtiles => band_jobs(settings, layout, &ZOOM_BANDS),
        TaskName::LargeZoomMbtiles => band_jobs(settings, layout, &LARGE_ZOOM_BANDS),
        TaskName::SpeedMbtile => speeds
            .iter()
            .map(|speed| {
                let bands = ZOOM_BANDS
                    .iter()
                    .chain(&LARGE_ZOOM_BANDS)
                    .map(|band| files::zoom_tiles(layout, band.name, speed));
                let name = format!("{}_{speed}", settings.phase.fbd_vintage);
                let output = files::speed_tiles(layout, speed, &settings.phase.fbd_vintage);
                tile_join(&name, &output.display().to_string(), bands.map(|p| p.display().to_string()))
            })
            .collect(),
        TaskName::PrepProviders => PROVIDER_SETS
            .iter()
            .flat_map(|(layer, large, bands)| {
                let fbd = &settings.phase.fbd_vintage;
                let input = if *large {
                    files::large_providers(layout, fbd)
                } else {
                    files::other_providers(layout, fbd)
                };
                bands.map(|(band, zoom)| {
                    let output = files::provider_band_tiles(layout, band).display().to_string();
                    let mut args: Vec<String> = zoom.iter().map(|z| z.to_string()).collect();
                    args.extend(
                        ["-x", "county_id", "--preserve-input-order", "-l", *layer, "-f", "-o"]
                            .map(String::from),
                    );
                    args.push(output.clone());
                    args.push(input.display().to_string());
                    ToolJob {
                        label: band.to_string(),
                        program: TIPPECANOE.into(),
                        args,
                        output,
                        capture_stdout: false,
                    }
                })
            })
            .collect(),
        TaskName::MakeProviders => PROVIDER_SETS
            .iter()
            .map(|(layer, _, bands)| {
                let output = files::provider_tiles(layout, layer, &settings.phase.fbd_vintage);
                let inputs = bands
                    .iter()
                    .map(|(band, _)| files::provider_band_tiles(layout, band).display().to_string());
                tile_join(layer, &output.display().to_string(), inputs)
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Joins a numprov CSV onto the geometry of one level.
fn join_speeds(settings: &Settings, layout: &Layout, level: Level, speed: &str) -> ToolJob {
    let phase = &settings.phase;
    let fbd = &phase.fbd_vintage;
    let (csv, geometry) = match level {
        Level::Tracts => (
            files::tract_numprov(layout, speed, fbd),
            files::sorted_tracts(layout, settings),
        ),
        Level::County => (
            files::county_numprov(layout, speed, fbd),
            files::geography_geojson(layout, "county", &phase.geometry_vintage),
        ),
        Level::Block => (
            files::block_numprov(layout, speed, fbd),
            files::geography_geojson(layout, "block", &phase.geometry_vintage),
        ),
    };
    ToolJob {
        label: format!("{} {speed}", level.name()),
        program: JSON_TOOL.into(),
        args: vec![
            "-c".into(),
            csv.display().to_string(),
            geometry.display().to_string(),
        ],
        output: files::speed_geojson(layout, level.name(), speed)
            .display()
            .to_string(),
        capture_stdout: true,
    }
}

fn band_jobs(settings: &Settings, layout: &Layout, bands: &[Band]) -> Vec<ToolJob> {
    let fbd = &settings.phase.fbd_vintage;
    let mut jobs = Vec::new();
    for speed in &settings.phase.speed_list {
        for band in bands {
            let output = files::zoom_tiles(layout, band.name, speed).display().to_string();
            let input = files::speed_geojson(layout, band.level.name(), speed);
            let mut args: Vec<String> = band.zoom.iter().map(|z| z.to_string()).collect();
            args.extend([
                "--detect-shared-borders".to_string(),
                "-l".into(),
                format!("{fbd}_{speed}"),
                "-x".into(),
                band.level.id(settings),
                "-f".into(),
                "-o".into(),
                output.clone(),
                input.display().to_string(),
            ]);
            jobs.push(ToolJob {
                label: format!("{} {speed}", band.name),
                program: TIPPECANOE.into(),
                args,
                output,
                capture_stdout: false,
            });
        }
    }
    jobs
}

fn tile_join(name: &str, output: &str, inputs: impl Iterator<Item = String>) -> ToolJob {
    let mut args: Vec<String> = ["-n", name, "-f", "-o", output].map(String::from).to_vec();
    args.extend(inputs);
    ToolJob {
        label: name.to_string(),
        program: TILE_JOIN.into(),
        args,
        output: output.to_string(),
        capture_stdout: false,
    }
}

struct ToolRunner {
    task: TaskName,
}

pub(super) fn tool_handler(task: TaskName) -> Arc<dyn TaskHandler> {
    handler(task, move |_: Arc<Context>| async move {
        let runner: Arc<dyn PreparedTask> = Arc::new(ToolRunner { task });
        Ok(runner)
    })
}

impl PreparedTask for ToolRunner {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
        async move {
            let job = match item {
                WorkItem::Tool(job) => job,
                other => return Err(unexpected(self.task, &other)),
            };
            tools::run(&job).await?;
            scope
                .progress(format!("{} done", job.label), Some(Payload::File(job.output)))
                .await?;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

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
    fn every_speed_gets_every_band() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let layout = settings.phase.layout();
        let speeds = settings.phase.speed_list.len();

        assert_eq!(jobs(TaskName::InitialGeojson, &settings, &layout).len(), speeds * 3);
        assert_eq!(jobs(TaskName::ZoomMbtiles, &settings, &layout).len(), speeds * 4);
        assert_eq!(jobs(TaskName::LargeZoomMbtiles, &settings, &layout).len(), speeds * 2);
        assert_eq!(jobs(TaskName::PrepProviders, &settings, &layout).len(), 4);
        assert_eq!(jobs(TaskName::MakeProviders, &settings, &layout).len(), 2);
        assert!(jobs(TaskName::ParseFbd, &settings, &layout).is_empty());
    }

    #[test]
    fn speed_tiles_join_bands_in_zoom_order() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let layout = settings.phase.layout();
        let joins = jobs(TaskName::SpeedMbtile, &settings, &layout);
        let job = joins.iter().find(|job| job.label == "jun2018_25_3").unwrap();
        assert_eq!(job.program, "tile-join");
        let inputs: Vec<_> = job.args[5..]
            .iter()
            .map(|p| Path::new(p).file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(
            inputs,
            [
                "county_25_3.mbtiles",
                "tract_z5_25_3.mbtiles",
                "tract_z6_25_3.mbtiles",
                "tract_z9_25_3.mbtiles",
                "block_z10_25_3.mbtiles",
                "block_z11_25_3.mbtiles",
            ]
        );
        assert!(job.output.ends_with("outputs/mapbox_tile/jun2018_25_3.mbtiles"));
    }

    #[test]
    fn joins_capture_stdout_and_bands_drop_the_join_key() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let layout = settings.phase.layout();

        let joins = jobs(TaskName::InitialGeojson, &settings, &layout);
        assert!(joins.iter().all(|job| job.capture_stdout && job.program == "tippecanoe-json-tool"));
        let tracts = &joins[0];
        assert!(tracts.output.ends_with("temp/speed_geojson/tracts_200.geojson"));
        assert!(tracts.args[2].ends_with("tracts_2018_2010.sort.geojson"));

        let bands = jobs(TaskName::LargeZoomMbtiles, &settings, &layout);
        let block = &bands[0];
        let exclude = block.args.iter().position(|a| a == "-x").unwrap();
        assert_eq!(block.args[exclude + 1], "geoid10");
        assert!(block.args.last().unwrap().ends_with("block_200.geojson"));
    }

    #[tokio::test]
    async fn tool_items_report_their_output() {
        use crate::{
            protocol::{Origin, Report},
            queue::QueueSet,
            servant::Reporter,
        };

        let dir = tempfile::tempdir().unwrap();
        let queues = QueueSet::local();
        let reporter = Reporter::new(
            queues.result.clone(),
            Origin {
                host: "servant-1".into(),
                pid: 1,
                lane: 0,
            },
            9,
        );
        let scope = ItemScope::new(reporter, 0);
        let output = dir.path().join("out.txt").display().to_string();
        let runner = ToolRunner {
            task: TaskName::SpeedMbtile,
        };
        let job = ToolJob {
            label: "echo".into(),
            program: "echo".into(),
            args: vec!["tiles".into()],
            output: output.clone(),
            capture_stdout: true,
        };
        runner.run(&scope, WorkItem::Tool(job)).await.unwrap();
        let message = queues.result.try_get().await.unwrap().unwrap();
        assert_eq!(
            message.report,
            Report::Progress {
                message: "echo done".into(),
                payload: Some(Payload::File(output)),
            }
        );

        let wrong = runner
            .run(&scope, WorkItem::SplitFbd {
                county: "01001".into(),
            })
            .await
            .unwrap_err();
        assert!(wrong.message.contains("speed_mbtile"));
    }
}
