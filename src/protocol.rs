//! Messages exchanged between the master and servants through the queue set.
//!
//! Every type here is archived with `rkyv` so it can cross the registry wire
//! unchanged. Work items are self-describing: a lane needs nothing besides
//! its own identity, the shared settings and the item to do the work.

use std::fmt;

use chrono::Utc;
use rkyv::Archive;

/// Named units of distributed work. Each directive announces one of these.
#[derive(
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    LoadComplexShape,
    LoadOtherFiles,
    InitialSpatialIntersection,
    ParseFbd,
    CreateBlockNumprov,
    CreateTractNumprov,
    TractSort,
    ProviderFiles,
    InitialGeojson,
    ZoomMbtiles,
    LargeZoomMbtiles,
    SpeedMbtile,
    PrepProviders,
    MakeProviders,
}

impl TaskName {
    /// Lanes per servant when the configuration does not override it.
    pub fn default_lanes(self) -> usize {
        match self {
            TaskName::LoadComplexShape => 6,
            TaskName::LoadOtherFiles => 3,
            TaskName::InitialSpatialIntersection => 8,
            TaskName::ParseFbd => 8,
            TaskName::CreateBlockNumprov => 3,
            TaskName::CreateTractNumprov => 3,
            TaskName::TractSort => 32,
            TaskName::ProviderFiles => 32,
            TaskName::InitialGeojson => 8,
            TaskName::ZoomMbtiles => 4,
            TaskName::LargeZoomMbtiles => 2,
            TaskName::SpeedMbtile => 3,
            TaskName::PrepProviders => 2,
            TaskName::MakeProviders => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskName::LoadComplexShape => "load_complex_shape",
            TaskName::LoadOtherFiles => "load_other_files",
            TaskName::InitialSpatialIntersection => "initial_spatial_intersection",
            TaskName::ParseFbd => "parse_fbd",
            TaskName::CreateBlockNumprov => "create_block_numprov",
            TaskName::CreateTractNumprov => "create_tract_numprov",
            TaskName::TractSort => "tract_sort",
            TaskName::ProviderFiles => "provider_files",
            TaskName::InitialGeojson => "initial_geojson",
            TaskName::ZoomMbtiles => "zoom_mbtiles",
            TaskName::LargeZoomMbtiles => "large_zoom_mbtiles",
            TaskName::SpeedMbtile => "speed_mbtile",
            TaskName::PrepProviders => "prep_providers",
            TaskName::MakeProviders => "make_providers",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a shape load creates its table or appends to it.
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum LoadMode {
    Create,
    Append,
}

/// A download/upload threshold pair with its column label (`25_3`).
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Tier {
    pub label: String,
    pub down: f64,
    pub up: f64,
}

/// An external command whose only contract is "exit zero and leave the
/// expected file behind".
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct ToolJob {
    /// Short description for log lines, e.g. `tract_z5 25`.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    /// File the command must produce.
    pub output: String,
    /// Write the command's stdout into `output` instead of letting the
    /// command create it.
    pub capture_stdout: bool,
}

#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum WorkItem {
    /// Sentinel: the lane that takes it stops.
    Stop,
    /// One block or place shapefile into its `nbm2_<kind>_<vintage>` table.
    LoadShape {
        file_number: u32,
        table: String,
        kind: String,
        path: String,
        mode: LoadMode,
    },
    /// A whole-table shapefile, followed by GiST indexes.
    LoadShapeTable {
        table: String,
        path: String,
        indexes: Vec<String>,
    },
    /// A CSV copied into a fresh table, followed by a lookup index.
    LoadCsvTable {
        table: String,
        path: String,
        index_column: String,
    },
    /// Overlay of the blocks of one county on one geography feature.
    SpatialIntersection {
        kind: String,
        county: String,
        geoid: String,
    },
    /// Slice the deployment file down to one county.
    SplitFbd { county: String },
    BlockNumprov { tier: Tier },
    TractNumprov { tier: Tier },
    DissolveTracts { county: String },
    DissolveProviders { county: String },
    Tool(ToolJob),
}

impl WorkItem {
    pub fn is_stop(&self) -> bool {
        matches!(self, WorkItem::Stop)
    }

    /// Short human description for log lines.
    pub fn describe(&self) -> String {
        match self {
            WorkItem::Stop => "stop".into(),
            WorkItem::LoadShape {
                kind, file_number, ..
            } => format!("{kind} shapefile #{file_number}"),
            WorkItem::LoadShapeTable { table, .. } | WorkItem::LoadCsvTable { table, .. } => {
                format!("table {table}")
            }
            WorkItem::SpatialIntersection {
                kind,
                county,
                geoid,
            } => format!("{kind} {geoid} in county {county}"),
            WorkItem::SplitFbd { county }
            | WorkItem::DissolveTracts { county }
            | WorkItem::DissolveProviders { county } => format!("county {county}"),
            WorkItem::BlockNumprov { tier } | WorkItem::TractNumprov { tier } => {
                format!("speed {}", tier.label)
            }
            WorkItem::Tool(job) => job.label.clone(),
        }
    }
}

/// A work item stamped with the phase it belongs to.
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct WorkEnvelope {
    pub epoch: u64,
    pub item: WorkItem,
}

impl WorkEnvelope {
    pub fn stop(epoch: u64) -> Self {
        Self {
            epoch,
            item: WorkItem::Stop,
        }
    }
}

/// The announcement a servant acts on.
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Directive {
    Run(PhaseOrder),
    /// The servant exits its loop.
    Shutdown,
}

#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct PhaseOrder {
    pub task: TaskName,
    pub lanes: u32,
    pub epoch: u64,
    pub config_digest: [u8; 32],
}

/// Which lane of which servant produced a result.
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct Origin {
    pub host: String,
    pub pid: u32,
    pub lane: u32,
}

impl Origin {
    pub fn master() -> Self {
        Self {
            host: "master".into(),
            pid: std::process::id(),
            lane: 0,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.pid, self.lane)
    }
}

/// Data a worker hands back to the master with a progress report.
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Payload {
    /// GeoJSON features, one serialized feature per entry.
    Features(Vec<String>),
    /// A file the worker wrote.
    File(String),
}

#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Report {
    Info {
        message: String,
    },
    /// One unit of completion.
    Progress {
        message: String,
        payload: Option<Payload>,
    },
    Error {
        message: String,
        trace: String,
    },
    Debug {
        message: String,
    },
    /// The lane is alive and still working on an item.
    Heartbeat,
    /// The lane left its loop.
    Stopped {
        consumed_sentinel: bool,
    },
}

/// Numeric classification the master drains by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Info = 0,
    Progress = 1,
    Error = 2,
    Debug = 3,
}

impl Report {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Report::Info { .. } => StatusCode::Info,
            Report::Progress { .. } => StatusCode::Progress,
            Report::Error { .. } => StatusCode::Error,
            Report::Debug { .. } | Report::Heartbeat | Report::Stopped { .. } => {
                StatusCode::Debug
            }
        }
    }

    /// Progress and error both count towards a phase's completion target.
    pub fn counts_towards_completion(&self) -> bool {
        matches!(
            self.status_code(),
            StatusCode::Progress | StatusCode::Error
        )
    }
}

#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct ResultMessage {
    pub epoch: u64,
    pub origin: Origin,
    /// Microseconds since the Unix epoch.
    pub started_at: i64,
    pub finished_at: i64,
    pub report: Report,
}

impl ResultMessage {
    pub fn new(epoch: u64, origin: Origin, started_at: i64, report: Report) -> Self {
        Self {
            epoch,
            origin,
            started_at,
            finished_at: now_micros(),
            report,
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        (self.finished_at - self.started_at) / 1_000
    }
}

pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_reports_are_debug_traffic() {
        assert_eq!(Report::Heartbeat.status_code(), StatusCode::Debug);
        assert_eq!(
            Report::Stopped {
                consumed_sentinel: true
            }
            .status_code() as u8,
            3
        );
        assert!(!Report::Heartbeat.counts_towards_completion());
    }

    #[test]
    fn progress_and_error_count_towards_completion() {
        let progress = Report::Progress {
            message: "done".into(),
            payload: None,
        };
        let error = Report::Error {
            message: "boom".into(),
            trace: String::new(),
        };
        let info = Report::Info {
            message: "note".into(),
        };
        assert_eq!(progress.status_code() as u8, 1);
        assert_eq!(error.status_code() as u8, 2);
        assert_eq!(info.status_code() as u8, 0);
        assert!(progress.counts_towards_completion());
        assert!(error.counts_towards_completion());
        assert!(!info.counts_towards_completion());
    }

    #[test]
    fn task_names_match_their_config_keys() {
        let json = serde_json::to_string(&TaskName::InitialSpatialIntersection).unwrap();
        assert_eq!(json, "\"initial_spatial_intersection\"");
        assert_eq!(
            TaskName::InitialSpatialIntersection.to_string(),
            "initial_spatial_intersection"
        );
    }
}
