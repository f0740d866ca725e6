//! Step 0: load the census geometry, build the block master and split the
//! deployment data by county.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{blocking, files, load_prepared, prepare_inputs, unexpected};
use crate::{
    aggregate::{split_county, CountyIndex, PreparedInputs},
    config::{DbConfig, Settings},
    db::{column, table_name, Database, TableName},
    driver::Pipeline,
    error::{Error, Result},
    layout::Layout,
    master::PhasePlan,
    protocol::{LoadMode, TaskName, WorkItem},
    servant::{Context, ItemScope, PreparedTask, TaskError},
    tools,
};

const BLOCK: &str = "block";
const PLACE: &str = "place";
const COUNTY: &str = "county";

pub async fn run(pipeline: &mut Pipeline) -> Result<bool> {
    let settings = pipeline.settings();
    let toggles = settings.phase.step0.clone();

    if toggles.check_files && !check_files(pipeline) {
        return Ok(false);
    }
    if (toggles.census_block_shape || toggles.census_place_shape)
        && !load_complex_shapes(pipeline).await?
    {
        return Ok(false);
    }
    if (toggles.census_shape || toggles.census_csv) && !load_other_files(pipeline).await? {
        return Ok(false);
    }
    if toggles.initial_spatial && !spatial_intersection(pipeline).await? {
        return Ok(false);
    }
    if toggles.block_master && !block_master(pipeline).await? {
        return Ok(false);
    }
    if toggles.parse_fbd && !parse_fbd(pipeline).await? {
        return Ok(false);
    }
    Ok(true)
}

fn check_files(pipeline: &Pipeline) -> bool {
    let missing = missing_inputs(&pipeline.settings(), &pipeline.layout());
    for path in &missing {
        error!(path = %path.display(), "required input is missing");
    }
    if missing.is_empty() {
        info!("all required inputs are present");
    }
    missing.is_empty()
}

/// Inputs the enabled parts of the pipeline will read.
pub fn missing_inputs(settings: &Settings, layout: &Layout) -> Vec<PathBuf> {
    let phase = &settings.phase;
    let toggles = &phase.step0;
    let mut required = Vec::new();
    if toggles.census_block_shape {
        required.push(layout.input_shape().join(&phase.block_shape_dir_name));
    }
    if toggles.census_place_shape {
        required.push(layout.input_shape().join(&phase.place_shape_dir_name));
    }
    if toggles.census_shape {
        required.extend(phase.shape_files.iter().map(|s| layout.input_shape().join(&s.path)));
    }
    if toggles.census_csv {
        required.extend(phase.csv_tables.iter().map(|t| layout.input_csv().join(&t.file)));
    }
    if toggles.block_master {
        required.push(layout.root().join(&phase.sql_dir));
    } else {
        required.push(files::block_master_input(layout, settings));
    }
    if toggles.parse_fbd || phase.steps.step1 || phase.steps.step2 {
        required.push(files::fbd_input(layout, settings));
    }
    required.into_iter().filter(|path| !path.exists()).collect()
}

/// Block and place shapefiles come in many parts. The first part of each
/// kind creates its table; the rest append once that wave is done.
async fn load_complex_shapes(pipeline: &mut Pipeline) -> Result<bool> {
    let started = Instant::now();
    let settings = pipeline.settings();
    let layout = pipeline.layout();
    let phase = &settings.phase;

    let mut kinds = Vec::new();
    if phase.step0.census_block_shape {
        kinds.push((BLOCK, &phase.block_shape_dir_name, &phase.block_indexes));
    }
    if phase.step0.census_place_shape {
        kinds.push((PLACE, &phase.place_shape_dir_name, &phase.place_indexes));
    }

    let mut waves = vec![Vec::new(), Vec::new()];
    for (kind, dir, _) in &kinds {
        let table = table_name(kind, &phase.geometry_vintage);
        for (number, path) in shapefiles(&layout.input_shape().join(dir))?.into_iter().enumerate() {
            let mode = if number == 0 {
                LoadMode::Create
            } else {
                LoadMode::Append
            };
            waves[usize::from(number > 0)].push(WorkItem::LoadShape {
                file_number: number as u32,
                table: table.clone(),
                kind: kind.to_string(),
                path: path.display().to_string(),
                mode,
            });
        }
    }

    let task = TaskName::LoadComplexShape;
    let plan = PhasePlan::in_waves(task, pipeline.lanes(task), waves);
    if !pipeline.distribute(plan).await?.succeeded {
        return Ok(false);
    }

    let db = pipeline.database().await?;
    for (kind, _, indexes) in &kinds {
        let table = db.table(kind, &phase.geometry_vintage);
        create_indexes(&db, &table, indexes).await?;
    }
    pipeline.task_done("load_complex_shape", started);
    Ok(true)
}

/// `*.shp` files of a directory, sorted by name.
pub fn shapefiles(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        Err(Error::MissingInput(dir.to_path_buf()))?
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("shp")) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

async fn load_other_files(pipeline: &mut Pipeline) -> Result<bool> {
    let started = Instant::now();
    let settings = pipeline.settings();
    let layout = pipeline.layout();
    let phase = &settings.phase;
    let vintage = &phase.geometry_vintage;

    let mut items = Vec::new();
    if phase.step0.census_shape {
        items.extend(phase.shape_files.iter().map(|shape| WorkItem::LoadShapeTable {
            table: table_name(&shape.geography, vintage),
            path: layout.input_shape().join(&shape.path).display().to_string(),
            indexes: shape.indexes.clone(),
        }));
    }
    if phase.step0.census_csv {
        items.extend(phase.csv_tables.iter().map(|csv| WorkItem::LoadCsvTable {
            table: table_name(&csv.table, vintage),
            path: layout.input_csv().join(&csv.file).display().to_string(),
            index_column: csv.index_column.clone(),
        }));
    }

    let task = TaskName::LoadOtherFiles;
    let plan = PhasePlan::new(task, pipeline.lanes(task), items);
    if !pipeline.distribute(plan).await?.succeeded {
        return Ok(false);
    }
    pipeline.task_done("load_other_files", started);
    Ok(true)
}

/// Only keeps pairs of geographies that can overlap: congressional
/// districts and places never cross a state line.
pub fn overlay_items(kind: &str, mut pairs: Vec<(String, String)>) -> Vec<WorkItem> {
    pairs.retain(|(county, geoid)| match kind {
        "congress" | PLACE => county.get(..2) == geoid.get(..2),
        _ => true,
    });
    pairs.sort();
    pairs.dedup();
    pairs
        .into_iter()
        .map(|(county, geoid)| WorkItem::SpatialIntersection {
            kind: kind.to_string(),
            county,
            geoid,
        })
        .collect()
}

fn staging_table(db: &Database, kind: &str, vintage: &str) -> TableName {
    db.table(&format!("{kind}_block_overlay_stg"), vintage)
}

async fn spatial_intersection(pipeline: &mut Pipeline) -> Result<bool> {
    let started = Instant::now();
    let settings = pipeline.settings();
    let vintage = &settings.phase.geometry_vintage;
    let db = pipeline.database().await?;
    let srid = settings.db.srid;

    let county_table = db.table(COUNTY, vintage);
    let (geoid, geometry) = (column("GEOID"), column("GEOMETRY"));
    let mut items = Vec::new();
    for kind in &settings.phase.spatial_list {
        let staging = staging_table(&db, kind, vintage);
        db.drop_table(&staging).await?;
        db.batch_execute(&format!(
            "CREATE TABLE {staging} ({} text, {geoid} text, {geometry} geometry(Geometry, {srid}))",
            column("BLOCK_FIPS"),
        ))
        .await?;

        let overlay = db.table(kind, vintage);
        let rows = db
            .query(
                &format!(
                    "SELECT c.{geoid}::text, g.{geoid}::text FROM {county_table} c \
                     JOIN {overlay} g ON ST_Intersects(c.{geometry}, g.{geometry})"
                ),
                &[],
            )
            .await?;
        let pairs = rows.iter().map(|row| (row.get(0), row.get(1))).collect();
        let kind_items = overlay_items(kind, pairs);
        debug!(kind, pairs = kind_items.len(), "overlay pairs");
        items.extend(kind_items);
    }

    let task = TaskName::InitialSpatialIntersection;
    let plan = PhasePlan::new(task, pipeline.lanes(task), items);
    if !pipeline.distribute(plan).await?.succeeded {
        return Ok(false);
    }
    for kind in &settings.phase.spatial_list {
        let staging = staging_table(&db, kind, vintage);
        create_indexes(&db, &staging, &["BLOCK_FIPS".to_string(), "GEOMETRY".to_string()]).await?;
    }
    pipeline.task_done("initial_spatial_intersection", started);
    Ok(true)
}

/// Runs the block master scripts and exports the result for the
/// aggregation steps.
async fn block_master(pipeline: &mut Pipeline) -> Result<bool> {
    let started = Instant::now();
    let settings = pipeline.settings();
    let layout = pipeline.layout();
    let phase = &settings.phase;
    let db = pipeline.database().await?;

    let schema = column(db.schema());
    let srid = settings.db.srid.to_string();
    let vars = [
        ("schema", schema.as_str()),
        ("geometry_vintage", phase.geometry_vintage.as_str()),
        ("census_vintage", phase.census_vintage.as_str()),
        ("srid", srid.as_str()),
    ];
    for script in scripts(&layout.root().join(&phase.sql_dir))? {
        let text = fs::read_to_string(&script)?;
        db.batch_execute(&render_script(&text, &vars)).await?;
        debug!(script = %script.display(), "ran block master script");
    }

    let table = db.table("block_master", &phase.geometry_vintage);
    let out = files::block_master_input(&layout, &settings);
    db.copy_out_csv(&format!("SELECT * FROM {table}"), &out)
        .await?;
    pipeline.task_done("block_master", started);
    Ok(true)
}

/// `*.sql` files of a directory in lexical order.
fn scripts(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        Err(Error::MissingInput(dir.to_path_buf()))?
    }
    let mut found: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    found.retain(|path| path.extension().is_some_and(|ext| ext == "sql"));
    found.sort();
    Ok(found)
}

/// Replaces `{name}` placeholders.
pub fn render_script(text: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(text.to_string(), |text, (name, value)| {
        text.replace(&format!("{{{name}}}"), value)
    })
}

async fn parse_fbd(pipeline: &mut Pipeline) -> Result<bool> {
    let started = Instant::now();
    let settings = pipeline.settings();
    let inputs = prepare_inputs(&settings, &pipeline.layout()).await?;
    let counties: BTreeSet<&str> = inputs.fbd.iter().map(|record| record.county()).collect();
    let items = counties
        .into_iter()
        .map(|county| WorkItem::SplitFbd {
            county: county.to_string(),
        })
        .collect();

    let task = TaskName::ParseFbd;
    let plan = PhasePlan::new(task, pipeline.lanes(task), items);
    if !pipeline.distribute(plan).await?.succeeded {
        return Ok(false);
    }
    pipeline.task_done("parse_fbd", started);
    Ok(true)
}

/// Indexes named `GEOMETRY` are spatial, all others b-tree.
pub(crate) async fn create_indexes(db: &Database, table: &TableName, columns: &[String]) -> Result<()> {
    for name in columns {
        if name.eq_ignore_ascii_case("geometry") {
            db.create_gist_index(table, name).await?;
        } else {
            db.create_index(table, name).await?;
        }
    }
    Ok(())
}

/// Arguments loading one shapefile into `<schema>.<table>`.
pub fn ogr2ogr_args(db: &DbConfig, source: &Path, table: &str, mode: LoadMode) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-f".into(),
        "PostgreSQL".into(),
        format!(
            "PG:host={} port={} dbname={} user={}",
            db.host, db.port, db.database, db.user
        ),
        source.display().to_string(),
        "-nln".into(),
        format!("{}.{table}", db.schema),
        "-nlt".into(),
        "PROMOTE_TO_MULTI".into(),
        "-t_srs".into(),
        format!("EPSG:{}", db.srid),
    ];
    match mode {
        LoadMode::Create => args.extend(
            ["-overwrite", "-lco", "GEOMETRY_NAME=GEOMETRY", "-lco", "LAUNDER=NO"].map(String::from),
        ),
        LoadMode::Append => args.push("-append".into()),
    }
    args
}

async fn load_shape(db: &DbConfig, source: &str, table: &str, mode: LoadMode) -> Result<()> {
    let source = Path::new(source);
    if !source.exists() {
        Err(Error::MissingInput(source.to_path_buf()))?
    }
    // the password stays out of the argument list
    let env = [("PGPASSWORD", db.password.as_str())];
    tools::run_command("ogr2ogr", &ogr2ogr_args(db, source, table, mode), &env).await
}

struct ShapeLoader {
    db: DbConfig,
}

pub(super) async fn prepare_shape_loader(ctx: Arc<Context>) -> Result<Arc<dyn PreparedTask>> {
    Ok(Arc::new(ShapeLoader {
        db: ctx.settings.db.clone(),
    }))
}

impl PreparedTask for ShapeLoader {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
        async move {
            let (file_number, table, kind, path, mode) = match item {
                WorkItem::LoadShape {
                    file_number,
                    table,
                    kind,
                    path,
                    mode,
                } => (file_number, table, kind, path, mode),
                other => return Err(unexpected(TaskName::LoadComplexShape, &other)),
            };
            load_shape(&self.db, &path, &table, mode).await?;
            scope
                .progress(format!("loaded {kind} shapefile #{file_number} into {table}"), None)
                .await?;
            Ok(())
        }
        .boxed()
    }
}

struct TableLoader {
    db: Database,
    config: DbConfig,
}

pub(super) async fn prepare_table_loader(ctx: Arc<Context>) -> Result<Arc<dyn PreparedTask>> {
    Ok(Arc::new(TableLoader {
        db: Database::connect(&ctx.settings.db).await?,
        config: ctx.settings.db.clone(),
    }))
}

impl PreparedTask for TableLoader {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
        async move {
            match item {
                WorkItem::LoadShapeTable {
                    table,
                    path,
                    indexes,
                } => {
                    load_shape(&self.config, &path, &table, LoadMode::Create).await?;
                    let name = TableName::new(self.db.schema(), &table);
                    create_indexes(&self.db, &name, &indexes).await?;
                    scope.progress(format!("loaded {name}"), None).await?;
                }
                WorkItem::LoadCsvTable {
                    table,
                    path,
                    index_column,
                } => {
                    let name = TableName::new(self.db.schema(), &table);
                    let rows = self.db.copy_in_csv(&name, Path::new(&path)).await?;
                    self.db.create_index(&name, &index_column).await?;
                    scope.progress(format!("copied {rows} rows into {name}"), None).await?;
                }
                other => return Err(unexpected(TaskName::LoadOtherFiles, &other)),
            }
            Ok(())
        }
        .boxed()
    }
}

struct Overlay {
    db: Database,
    vintage: String,
    kinds: Vec<String>,
}

pub(super) async fn prepare_overlay(ctx: Arc<Context>) -> Result<Arc<dyn PreparedTask>> {
    Ok(Arc::new(Overlay {
        db: Database::connect(&ctx.settings.db).await?,
        vintage: ctx.settings.phase.geometry_vintage.clone(),
        kinds: ctx.settings.phase.spatial_list.clone(),
    }))
}

impl PreparedTask for Overlay {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
        async move {
            let WorkItem::SpatialIntersection {
                kind,
                county,
                geoid,
            } = &item
            else {
                return Err(unexpected(TaskName::InitialSpatialIntersection, &item));
            };
            if !self.kinds.contains(kind) {
                return Err(unexpected(TaskName::InitialSpatialIntersection, &item));
            }
            let staging = staging_table(&self.db, kind, &self.vintage);
            let blocks = self.db.table(BLOCK, &self.vintage);
            let overlay = self.db.table(kind, &self.vintage);
            let (block_fips, id, geometry) =
                (column("BLOCK_FIPS"), column("GEOID"), column("GEOMETRY"));
            let inserted = self
                .db
                .execute(
                    &format!(
                        "INSERT INTO {staging} ({block_fips}, {id}, {geometry}) \
                         SELECT b.{block_fips}, g.{id}::text, ST_Intersection(b.{geometry}, g.{geometry}) \
                         FROM {blocks} b JOIN {overlay} g ON ST_Intersects(b.{geometry}, g.{geometry}) \
                         WHERE SUBSTR(b.{block_fips}, 1, 5) = $1 AND g.{id}::text = $2"
                    ),
                    &[county, geoid],
                )
                .await?;
            scope
                .progress(format!("{inserted} {kind} overlay rows for {geoid} in {county}"), None)
                .await?;
            Ok(())
        }
        .boxed()
    }
}

struct CountySplit {
    inputs: Arc<PreparedInputs>,
    index: Arc<CountyIndex>,
    layout: Layout,
}

pub(super) async fn prepare_county_split(ctx: Arc<Context>) -> Result<Arc<dyn PreparedTask>> {
    let inputs = load_prepared(&ctx).await?;
    let index = {
        let inputs = inputs.clone();
        blocking(move || Ok(Arc::new(CountyIndex::new(&inputs.fbd)))).await?
    };
    debug!(counties = index.counties(), "indexed deployment records");
    Ok(Arc::new(CountySplit {
        inputs,
        index,
        layout: ctx.layout.clone(),
    }))
}

impl PreparedTask for CountySplit {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
        async move {
            let county = match item {
                WorkItem::SplitFbd { county } => county,
                other => return Err(unexpected(TaskName::ParseFbd, &other)),
            };
            let (inputs, index) = (self.inputs.clone(), self.index.clone());
            let out = files::county_fbd(&self.layout, &county);
            let rows = blocking(move || split_county(&inputs.fbd, &index, &county, &out)).await?;
            scope.progress(format!("wrote {rows} records"), None).await?;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(county: &str, geoid: &str) -> (String, String) {
        (county.into(), geoid.into())
    }

    #[test]
    fn state_bound_overlays_drop_cross_state_pairs() {
        let pairs = vec![
            pair("01003", "0101"),
            pair("01001", "0102"),
            pair("01001", "1301"),
        ];
        let items = overlay_items("congress", pairs.clone());
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0],
            WorkItem::SpatialIntersection {
                kind: "congress".into(),
                county: "01001".into(),
                geoid: "0102".into(),
            }
        );
        // tribal areas cross state lines
        assert_eq!(overlay_items("tribe", pairs).len(), 3);
    }

    #[test]
    fn scripts_get_their_placeholders() {
        let sql = "CREATE TABLE {schema}.nbm2_block_master_{geometry_vintage} AS \
                   SELECT ST_Transform(g, {srid}) FROM {schema}.nbm2_block_{geometry_vintage}";
        let rendered = render_script(sql, &[("schema", "\"nbm2\""), ("geometry_vintage", "2018"), ("srid", "4269")]);
        assert_eq!(
            rendered,
            "CREATE TABLE \"nbm2\".nbm2_block_master_2018 AS \
             SELECT ST_Transform(g, 4269) FROM \"nbm2\".nbm2_block_2018"
        );
    }

    #[test]
    fn shapefiles_are_listed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["tl_2018_02_tabblock10.shp", "tl_2018_01_tabblock10.shp", "tl_2018_01_tabblock10.dbf"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = shapefiles(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["tl_2018_01_tabblock10.shp", "tl_2018_02_tabblock10.shp"]);
        assert!(matches!(
            shapefiles(&dir.path().join("absent")),
            Err(Error::MissingInput(_))
        ));
    }

    #[test]
    fn appends_skip_table_creation_options() {
        let db = DbConfig::builder()
            .schema("nbm2")
            .host("db.internal")
            .user("loader")
            .database("broadband")
            .build();
        let create = ogr2ogr_args(&db, Path::new("/in/block/a.shp"), "nbm2_block_2018", LoadMode::Create);
        assert!(create.contains(&"-overwrite".to_string()));
        assert!(create.contains(&"nbm2.nbm2_block_2018".to_string()));
        assert!(create.contains(&"EPSG:4269".to_string()));
        assert!(!create.iter().any(|a| a.contains("password")));

        let append = ogr2ogr_args(&db, Path::new("/in/block/b.shp"), "nbm2_block_2018", LoadMode::Append);
        assert_eq!(append.last().map(String::as_str), Some("-append"));
        assert!(!append.contains(&"-lco".to_string()));
    }
}
