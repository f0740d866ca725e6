//! Run configuration.
//!
//! Two JSON documents drive a run: the process configuration (vintages,
//! inputs, taxonomy, per-step switches) and the database configuration
//! (database credentials plus the queue registry endpoint). Both are read
//! once, validated, and then shared read-only by every phase and servant.

use std::{
    collections::BTreeMap,
    fs,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    aggregate::{SpeedTier, Taxonomy, MAX_TECH_BUCKETS},
    digest::{self, Digest},
    error::{Error, Result},
    layout::Layout,
    protocol::TaskName,
};

/// Which numbered steps the driver runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct StepToggles {
    #[builder(default)]
    pub step0: bool,
    #[builder(default)]
    pub step1: bool,
    #[builder(default)]
    pub step2: bool,
    #[builder(default)]
    pub step3: bool,
    #[builder(default)]
    pub step4: bool,
    #[builder(default)]
    pub step5: bool,
    #[builder(default)]
    pub step6: bool,
}

impl StepToggles {
    pub fn enabled(&self, step: u8) -> bool {
        match step {
            0 => self.step0,
            1 => self.step1,
            2 => self.step2,
            3 => self.step3,
            4 => self.step4,
            5 => self.step5,
            6 => self.step6,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step0Toggles {
    pub check_files: bool,
    pub census_block_shape: bool,
    pub census_place_shape: bool,
    pub census_csv: bool,
    pub census_shape: bool,
    pub initial_spatial: bool,
    pub block_master: bool,
    pub parse_fbd: bool,
}

impl Default for Step0Toggles {
    fn default() -> Self {
        Self {
            check_files: false,
            census_block_shape: false,
            census_place_shape: false,
            census_csv: true,
            census_shape: false,
            initial_spatial: false,
            block_master: true,
            parse_fbd: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step4Toggles {
    pub bounding_box: bool,
    pub block_bounding_box: bool,
    pub make_tiles: bool,
}

impl Default for Step4Toggles {
    fn default() -> Self {
        Self {
            bounding_box: true,
            block_bounding_box: false,
            make_tiles: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step5Toggles {
    pub tracts: bool,
    pub providers: bool,
}

impl Default for Step5Toggles {
    fn default() -> Self {
        Self {
            tracts: true,
            providers: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step6Toggles {
    pub make_data_files: bool,
    pub create_zoom_files: bool,
    pub create_large_zoom_files: bool,
    pub combine_speeds: bool,
    pub prepare_provider: bool,
    pub make_provider_files: bool,
}

impl Default for Step6Toggles {
    fn default() -> Self {
        Self {
            make_data_files: true,
            create_zoom_files: true,
            create_large_zoom_files: true,
            combine_speeds: true,
            prepare_provider: true,
            make_provider_files: true,
        }
    }
}

/// A shapefile loaded whole into `nbm2_<geography>_<geometry_vintage>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeFile {
    pub geography: String,
    /// Relative to `inputs/shape`.
    pub path: String,
    #[serde(default = "defaults::geometry_indexes")]
    pub indexes: Vec<String>,
}

/// A CSV file copied into `nbm2_<table>_<geometry_vintage>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvTable {
    pub table: String,
    /// Relative to `inputs/csv`.
    pub file: String,
    pub index_column: String,
}

/// Lifecycle timing for the master/servant protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Coordination {
    /// How long the master waits without hearing anything from the current
    /// phase before it declares the phase hung.
    pub idle_timeout_secs: u64,
    /// How long the master waits for stop acknowledgements during a flush.
    pub stop_ack_timeout_secs: u64,
    /// Interval between heartbeats while a lane works on an item.
    pub heartbeat_secs: u64,
}

impl Default for Coordination {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            stop_ack_timeout_secs: 120,
            heartbeat_secs: 15,
        }
    }
}

impl Coordination {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stop_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_ack_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// The immutable process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct PhaseConfig {
    /// How many servant servers take part in the run.
    pub number_servers: usize,
    pub steps: StepToggles,
    pub nbm2_root: PathBuf,

    #[serde(rename = "fbData")]
    #[builder(default = String::from("fbd.csv"), setter(into))]
    pub fbd_file: String,
    #[builder(default = String::from("blockmaster.csv"), setter(into))]
    pub blockmaster_data_file: String,

    #[builder(default = String::from("2010"), setter(into))]
    pub census_vintage: String,
    #[builder(default = String::from("2018"), setter(into))]
    pub geometry_vintage: String,
    #[builder(default = String::from("jun2018"), setter(into))]
    pub fbd_vintage: String,

    #[serde(default)]
    #[builder(default)]
    pub step0: Step0Toggles,
    #[serde(default)]
    #[builder(default)]
    pub step4: Step4Toggles,
    #[serde(default)]
    #[builder(default)]
    pub step5: Step5Toggles,
    #[serde(default)]
    #[builder(default)]
    pub step6: Step6Toggles,

    #[serde(default)]
    #[builder(default)]
    pub shape_files: Vec<ShapeFile>,
    #[serde(default)]
    #[builder(default)]
    pub csv_tables: Vec<CsvTable>,
    #[serde(default = "defaults::block_shape_dir")]
    #[builder(default = defaults::block_shape_dir())]
    pub block_shape_dir_name: String,
    #[serde(default = "defaults::place_shape_dir")]
    #[builder(default = defaults::place_shape_dir())]
    pub place_shape_dir_name: String,
    #[serde(default = "defaults::block_indexes")]
    #[builder(default = defaults::block_indexes())]
    pub block_indexes: Vec<String>,
    #[serde(default = "defaults::geometry_indexes")]
    #[builder(default = defaults::geometry_indexes())]
    pub place_indexes: Vec<String>,
    #[serde(default = "defaults::spatial_list")]
    #[builder(default = defaults::spatial_list())]
    pub spatial_list: Vec<String>,
    /// Directory of operator-supplied SQL scripts that build the block
    /// master table, relative to the root.
    #[serde(default = "defaults::sql_dir")]
    #[builder(default = defaults::sql_dir())]
    pub sql_dir: String,

    #[serde(default = "defaults::fbd_rename_columns")]
    #[builder(default = defaults::fbd_rename_columns())]
    pub fbd_rename_columns: BTreeMap<String, String>,

    pub d_column_list: Vec<String>,
    pub d_val_arr: Vec<f64>,
    pub u_column_list: Vec<String>,
    pub u_val_arr: Vec<f64>,
    #[serde(default = "defaults::tech_stack")]
    #[builder(default = defaults::tech_stack())]
    pub tech_stack: Vec<(String, String)>,

    pub tech_dict: BTreeMap<String, Vec<u16>>,
    pub techlist: Vec<String>,
    #[serde(rename = "speedList")]
    pub speed_list: Vec<String>,
    pub down_speed: Vec<f64>,
    pub up_speed: Vec<f64>,

    /// Block master column to area-table geography type, in output order.
    #[serde(default = "defaults::geog_dict")]
    #[builder(default = defaults::geog_dict())]
    pub geog_dict: Vec<(String, String)>,

    #[serde(default = "defaults::basic_geojson")]
    #[builder(default = defaults::basic_geojson())]
    pub basic_geojson: Vec<String>,
    #[serde(default = "defaults::zoom_params")]
    #[builder(default = defaults::zoom_params())]
    pub zoom_params: BTreeMap<String, (u8, u8)>,
    /// `(geography, geoid, [west, south, east, north])` overrides for
    /// features whose computed extent crosses the antimeridian.
    #[serde(default = "defaults::modify_bbox")]
    #[builder(default = defaults::modify_bbox())]
    pub modify_bbox: Vec<(String, String, [f64; 4])>,
    #[serde(default)]
    #[builder(default)]
    pub large_providers: Vec<String>,

    /// Lane counts per task, overriding the built-in pool sizes.
    #[serde(default)]
    #[builder(default)]
    pub pool_sizes: BTreeMap<TaskName, usize>,
    #[serde(default)]
    #[builder(default)]
    pub coordination: Coordination,
}

impl PhaseConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants the algorithms depend on.
    pub fn validate(&self) -> Result<()> {
        if self.number_servers == 0 {
            Err(invalid("number_servers must be at least 1"))?
        }
        if self.census_vintage.len() != 4
            || !self.census_vintage.bytes().all(|b| b.is_ascii_digit())
        {
            Err(invalid("census_vintage must be a four digit year"))?
        }
        if self.speed_list.is_empty() {
            Err(invalid("speedList must not be empty"))?
        }
        if self.speed_list.len() != self.down_speed.len()
            || self.speed_list.len() != self.up_speed.len()
        {
            Err(invalid("speedList, down_speed and up_speed differ in length"))?
        }
        if !non_decreasing(&self.down_speed) || !non_decreasing(&self.up_speed) {
            Err(invalid("down_speed and up_speed must be non-decreasing"))?
        }
        if self.d_column_list.len() != self.d_val_arr.len()
            || self.u_column_list.len() != self.u_val_arr.len()
        {
            Err(invalid("threshold column lists and value arrays differ in length"))?
        }
        if !non_decreasing(&self.d_val_arr) || !non_decreasing(&self.u_val_arr) {
            Err(invalid("d_val_arr and u_val_arr must be non-decreasing"))?
        }
        if self.techlist.is_empty() {
            Err(invalid("techlist must not be empty"))?
        }
        if self.techlist.len() > MAX_TECH_BUCKETS {
            Err(invalid(format!("techlist has more than {MAX_TECH_BUCKETS} buckets")))?
        }
        for bucket in &self.techlist {
            if bucket.chars().count() != 1 {
                Err(invalid(format!("technology bucket {bucket:?} must be one letter")))?
            }
            if !self.tech_dict.contains_key(bucket) {
                Err(invalid(format!("techlist bucket {bucket:?} is missing from tech_dict")))?
            }
        }
        for (bucket, _) in &self.tech_stack {
            if !self.tech_dict.contains_key(bucket) {
                Err(invalid(format!("tech_stack bucket {bucket:?} is missing from tech_dict")))?
            }
        }
        if let Some((task, _)) = self.pool_sizes.iter().find(|(_, lanes)| **lanes == 0) {
            Err(invalid(format!("pool size for {task} must be at least 1")))?
        }
        if self.coordination.heartbeat_secs == 0
            || self.coordination.heartbeat_secs >= self.coordination.idle_timeout_secs
        {
            Err(invalid("heartbeat_secs must be non-zero and below idle_timeout_secs"))?
        }
        Ok(())
    }

    /// The census vintage's two-digit suffix, as used in `geoid10`.
    pub fn census_suffix(&self) -> &str {
        &self.census_vintage[2..]
    }

    /// Name of the block identifier column in block-level files.
    pub fn geoid_column(&self) -> String {
        format!("geoid{}", self.census_suffix())
    }

    pub fn speed_tiers(&self) -> Vec<SpeedTier> {
        self.speed_list
            .iter()
            .zip(&self.down_speed)
            .zip(&self.up_speed)
            .map(|((label, down), up)| SpeedTier::new(label.clone(), *down, *up))
            .collect()
    }

    pub fn taxonomy(&self) -> Taxonomy {
        Taxonomy::new(&self.tech_dict, &self.techlist)
    }

    /// Lanes per servant for the given task.
    pub fn lanes(&self, task: TaskName) -> usize {
        self.pool_sizes
            .get(&task)
            .copied()
            .unwrap_or_else(|| task.default_lanes())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.nbm2_root)
    }
}

/// Database credentials and spatial reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct DbConfig {
    #[serde(rename = "db_schema")]
    #[builder(setter(into))]
    pub schema: String,
    #[serde(rename = "db_host")]
    #[builder(setter(into))]
    pub host: String,
    #[serde(rename = "db_port")]
    #[builder(default = 5432)]
    pub port: u16,
    #[serde(rename = "db_user")]
    #[builder(setter(into))]
    pub user: String,
    #[serde(rename = "db_password")]
    #[builder(default, setter(into))]
    pub password: String,
    #[serde(rename = "db")]
    #[builder(setter(into))]
    pub database: String,
    #[serde(rename = "SRID")]
    #[builder(default = 4269)]
    pub srid: u32,
}

/// Where the queue registry listens and the secret that guards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct QueueConfig {
    #[serde(rename = "queue_ip")]
    #[builder(setter(into))]
    pub host: String,
    #[serde(rename = "distributed_port")]
    #[builder(default = 50000)]
    pub port: u16,
    #[serde(rename = "queue_auth_key")]
    #[builder(setter(into))]
    pub auth_key: String,
    /// PEM certificate for the registry; a self-signed one is generated when
    /// absent.
    #[serde(default)]
    #[builder(default)]
    pub queue_cert: Option<PathBuf>,
    #[serde(default)]
    #[builder(default)]
    pub queue_key: Option<PathBuf>,
}

impl QueueConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| invalid(format!("queue_ip {:?} does not resolve", self.host)))
    }
}

#[derive(Deserialize)]
struct DbFile {
    #[serde(flatten)]
    db: DbConfig,
    #[serde(flatten)]
    queue: QueueConfig,
}

/// Everything a master or servant process needs, validated once.
#[derive(Debug, Clone)]
pub struct Settings {
    pub phase: PhaseConfig,
    pub db: DbConfig,
    pub queue: QueueConfig,
    digest: Digest,
}

impl Settings {
    pub fn load(process_config: &Path, db_config: &Path) -> Result<Self> {
        let phase = PhaseConfig::from_json(&read(process_config)?)?;
        let DbFile { db, queue } = serde_json::from_slice(&read(db_config)?)?;
        Self::new(phase, db, queue)
    }

    pub fn new(phase: PhaseConfig, db: DbConfig, queue: QueueConfig) -> Result<Self> {
        phase.validate()?;
        if queue.auth_key.is_empty() {
            Err(invalid("queue_auth_key must not be empty"))?
        }
        if queue.queue_cert.is_some() != queue.queue_key.is_some() {
            Err(invalid("queue_cert and queue_key must be given together"))?
        }
        let digest = digest::of_json(&phase)?;
        Ok(Self {
            phase,
            db,
            queue,
            digest,
        })
    }

    /// Digest of the process configuration. Directives carry it so servants
    /// can refuse work planned against a different configuration.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn short_digest(&self) -> String {
        digest::short(&self.digest).to_string()
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::MissingInput(path.to_path_buf()),
        _ => Error::Io(e),
    })
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidConfig(reason.into())
}

fn non_decreasing(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] <= w[1])
}

/// Values a fresh deployment starts from.
pub mod defaults {
    use std::collections::BTreeMap;

    pub fn block_shape_dir() -> String {
        "block".into()
    }

    pub fn place_shape_dir() -> String {
        "place".into()
    }

    pub fn sql_dir() -> String {
        "sql".into()
    }

    pub fn block_indexes() -> Vec<String> {
        vec!["BLOCK_FIPS".into(), "COUNTY_FIPS".into(), "GEOMETRY".into()]
    }

    pub fn geometry_indexes() -> Vec<String> {
        vec!["GEOMETRY".into()]
    }

    pub fn spatial_list() -> Vec<String> {
        vec!["tribe".into(), "place".into(), "congress".into()]
    }

    pub fn fbd_rename_columns() -> BTreeMap<String, String> {
        [
            ("Census Block FIPS Code", "BlockCode"),
            ("Consumer", "Consumer"),
            ("Holding Company Number", "HocoNum"),
            ("Technology Code", "TechCode"),
            ("Max Advertised Downstream Speed (mbps)", "MaxAdDown"),
            ("Max Advertised Upstream Speed (mbps)", "MaxAdUp"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    pub fn d_columns() -> (Vec<String>, Vec<f64>) {
        let values = vec![0.2, 4., 10., 25., 100., 250., 500., 1000.];
        let names = (1..=values.len()).map(|i| format!("d_{i}")).collect();
        (names, values)
    }

    pub fn u_columns() -> (Vec<String>, Vec<f64>) {
        let values = vec![0.2, 1., 3., 10., 25., 100., 250., 500., 1000.];
        let names = (1..=values.len()).map(|i| format!("u_{i}")).collect();
        (names, values)
    }

    pub fn tech_stack() -> Vec<(String, String)> {
        vec![
            ("a".into(), "adsl".into()),
            ("c".into(), "cable".into()),
            ("o".into(), "other".into()),
        ]
    }

    pub fn tech_dict() -> BTreeMap<String, Vec<u16>> {
        [
            ("a", vec![10, 11, 12, 13]),
            ("c", vec![40, 41, 42, 43]),
            ("f", vec![50]),
            ("o", vec![0, 90, 20, 30]),
            ("s", vec![60]),
            ("w", vec![70]),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    pub fn techlist() -> Vec<String> {
        ["a", "c", "f", "o", "s", "w"].map(String::from).to_vec()
    }

    pub fn speed_list() -> Vec<String> {
        ["200", "4_1", "10_1", "25_3", "100_10", "250_25", "1000_100"]
            .map(String::from)
            .to_vec()
    }

    pub fn down_speed() -> Vec<f64> {
        vec![0.2, 4., 10., 25., 100., 250., 1000.]
    }

    pub fn up_speed() -> Vec<f64> {
        vec![0.2, 1., 1., 3., 10., 25., 100.]
    }

    pub fn geog_dict() -> Vec<(String, String)> {
        [
            ("cplace_id", "place"),
            ("cdist_id", "cd"),
            ("cbsa_code", "cbsa"),
            ("county_fips", "county"),
            ("tribal_id", "tribal"),
            ("state_fips", "state"),
            ("country", "nation"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    pub fn basic_geojson() -> Vec<String> {
        ["congress", "tribe", "cbsa", "county", "state", "place", "block"]
            .map(String::from)
            .to_vec()
    }

    pub fn zoom_params() -> BTreeMap<String, (u8, u8)> {
        [
            ("state", (2, 5)),
            ("county", (0, 7)),
            ("carto", (3, 9)),
            ("congress", (2, 8)),
            ("tribe", (4, 9)),
            ("place", (6, 14)),
            ("cbsa", (3, 6)),
            ("block", (10, 14)),
            ("tract", (8, 9)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    pub fn modify_bbox() -> Vec<(String, String, [f64; 4])> {
        vec![
            ("state".into(), "02".into(), [-188.148909, 51.214183, -128.77847, 71.365162]),
            ("county".into(), "02016".into(), [-187.75585, 51.214183, -165.77847, 57.249626]),
            ("congress".into(), "0200".into(), [-188.148909, 51.214183, -128.77847, 71.365162]),
        ]
    }
}
