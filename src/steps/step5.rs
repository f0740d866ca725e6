//! Step 5: dissolved tract and provider geometries.
//!
//! Servants dissolve one county at a time in the database and send the
//! features back as payloads; the master sorts them and writes the GeoJSON
//! files the speed tiles are built from.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::info;

use super::{
    blocking, files,
    geojson::{feature, property, FeatureWriter},
    unexpected,
};
use crate::{
    aggregate::read_fbd,
    db::{column, Database},
    driver::Pipeline,
    error::{Error, Result},
    layout::Layout,
    master::PhasePlan,
    protocol::{Payload, TaskName, WorkItem},
    servant::{Context, ItemScope, PreparedTask, TaskError},
};

pub async fn run(pipeline: &mut Pipeline) -> Result<bool> {
    let settings = pipeline.settings();
    let db = pipeline.database().await?;
    let blocks = db.table("block", &settings.phase.geometry_vintage);
    let counties = db.counties(&blocks).await?;
    info!(counties = counties.len(), "dissolving by county");

    if settings.phase.step5.tracts && !tracts(pipeline, &counties).await? {
        return Ok(false);
    }
    if settings.phase.step5.providers && !providers(pipeline, &counties).await? {
        return Ok(false);
    }
    Ok(true)
}

async fn tracts(pipeline: &mut Pipeline, counties: &[String]) -> Result<bool> {
    let started = Instant::now();
    let settings = pipeline.settings();
    let items = counties
        .iter()
        .map(|county| WorkItem::DissolveTracts {
            county: county.clone(),
        })
        .collect();
    let task = TaskName::TractSort;
    let outcome = pipeline
        .distribute(PhasePlan::new(task, pipeline.lanes(task), items))
        .await?;
    if !outcome.succeeded {
        return Ok(false);
    }

    let mut features = collect_features(outcome.payloads)?;
    sort_features(&mut features, &["tract_id"]);
    let out = files::sorted_tracts(&pipeline.layout(), &settings);
    let written = blocking(move || write_features(&out, &features)).await?;
    info!(tracts = written, "wrote sorted tracts");
    pipeline.task_done("tract_sort", started);
    Ok(true)
}

async fn providers(pipeline: &mut Pipeline, counties: &[String]) -> Result<bool> {
    let started = Instant::now();
    let settings = pipeline.settings();
    let layout = pipeline.layout();
    let items = counties
        .iter()
        .map(|county| WorkItem::DissolveProviders {
            county: county.clone(),
        })
        .collect();
    let task = TaskName::ProviderFiles;
    let outcome = pipeline
        .distribute(PhasePlan::new(task, pipeline.lanes(task), items))
        .await?;
    if !outcome.succeeded {
        return Ok(false);
    }

    let features = collect_features(outcome.payloads)?;
    let (large, other) = split_providers(features, &settings.phase.large_providers);
    let fbd_vintage = &settings.phase.fbd_vintage;
    let (large_out, other_out) = (
        files::large_providers(&layout, fbd_vintage),
        files::other_providers(&layout, fbd_vintage),
    );
    let (large, other) = blocking(move || {
        Ok((write_features(&large_out, &large)?, write_features(&other_out, &other)?))
    })
    .await?;
    info!(large, other, "wrote provider footprints");
    pipeline.task_done("provider_files", started);
    Ok(true)
}

fn write_features(path: &Path, features: &[Value]) -> Result<usize> {
    let mut writer = FeatureWriter::create(path)?;
    for feature in features {
        writer.write(feature)?;
    }
    writer.finish()
}

/// Parses the features every servant sent back.
pub fn collect_features(payloads: Vec<Payload>) -> Result<Vec<Value>> {
    let mut features = Vec::new();
    for payload in payloads {
        if let Payload::Features(list) = payload {
            for feature in list {
                features.push(serde_json::from_str(&feature)?);
            }
        }
    }
    Ok(features)
}

/// Sorts features by string properties; ties keep their arrival order.
pub fn sort_features(features: &mut [Value], keys: &[&str]) {
    features.sort_by(|a, b| {
        keys.iter()
            .map(|key| property(a, key).cmp(property(b, key)))
            .find(|order| order.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Separates the footprints of the configured large providers, each side
/// sorted by holding company and county.
pub fn split_providers(features: Vec<Value>, large: &[String]) -> (Vec<Value>, Vec<Value>) {
    let (mut big, mut rest): (Vec<_>, Vec<_>) = features
        .into_iter()
        .partition(|f| large.iter().any(|hoconum| hoconum == property(f, "hoconum")));
    sort_features(&mut big, &["hoconum", "county_id"]);
    sort_features(&mut rest, &["hoconum", "county_id"]);
    (big, rest)
}

fn serialize(features: &[Value]) -> Result<Vec<String>> {
    features
        .iter()
        .map(|f| serde_json::to_string(f).map_err(Error::from))
        .collect()
}

struct TractDissolve {
    db: Database,
    vintage: String,
    land_area: String,
}

pub(super) async fn prepare_tracts(ctx: Arc<Context>) -> Result<Arc<dyn PreparedTask>> {
    let phase = &ctx.settings.phase;
    Ok(Arc::new(TractDissolve {
        db: Database::connect(&ctx.settings.db).await?,
        vintage: phase.geometry_vintage.clone(),
        land_area: format!("ALAND{}", phase.census_suffix()),
    }))
}

impl PreparedTask for TractDissolve {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
        async move {
            let county = match item {
                WorkItem::DissolveTracts { county } => county,
                other => return Err(unexpected(TaskName::TractSort, &other)),
            };
            let blocks = self.db.table("block", &self.vintage);
            let (block_fips, geometry) = (column("BLOCK_FIPS"), column("GEOMETRY"));
            let rows = self
                .db
                .query(
                    &format!(
                        "SELECT SUBSTR({block_fips}, 1, 11) AS tract_id, \
                         ST_AsGeoJSON(ST_Multi(ST_Union({geometry}))) \
                         FROM {blocks} WHERE {} = $1 AND {} > 0 \
                         GROUP BY 1 ORDER BY 1",
                        column("COUNTY_FIPS"),
                        column(&self.land_area),
                    ),
                    &[&county],
                )
                .await?;
            let features = rows
                .iter()
                .map(|row| {
                    let mut properties = Map::new();
                    properties.insert("tract_id".into(), row.get::<_, String>(0).into());
                    feature(properties, row.get(1), None)
                })
                .collect::<Result<Vec<_>>>()?;
            scope
                .progress(
                    format!("{} tracts in {county}", features.len()),
                    Some(Payload::Features(serialize(&features)?)),
                )
                .await?;
            Ok(())
        }
        .boxed()
    }
}

struct ProviderDissolve {
    db: Database,
    vintage: String,
    layout: Layout,
    rename: BTreeMap<String, String>,
}

pub(super) async fn prepare_providers(ctx: Arc<Context>) -> Result<Arc<dyn PreparedTask>> {
    Ok(Arc::new(ProviderDissolve {
        db: Database::connect(&ctx.settings.db).await?,
        vintage: ctx.settings.phase.geometry_vintage.clone(),
        layout: ctx.layout.clone(),
        rename: ctx.settings.phase.fbd_rename_columns.clone(),
    }))
}

impl ProviderDissolve {
    /// Distinct (holding company, block) pairs of one county, as two
    /// parallel columns.
    async fn footprints(&self, county: &str) -> Result<(Vec<String>, Vec<String>)> {
        let path = files::county_fbd(&self.layout, county);
        if !path.exists() {
            return Ok(Default::default());
        }
        let rename = self.rename.clone();
        let records = blocking(move || read_fbd(&path, &rename)).await?;
        let pairs: BTreeSet<(String, String)> = records
            .into_iter()
            .map(|record| (record.hoconum, record.block))
            .collect();
        Ok(pairs.into_iter().unzip())
    }
}

impl PreparedTask for ProviderDissolve {
    fn run<'a>(&'a self, scope: &'a ItemScope, item: WorkItem) -> BoxFuture<'a, Result<(), TaskError>> {
        async move {
            let county = match item {
                WorkItem::DissolveProviders { county } => county,
                other => return Err(unexpected(TaskName::ProviderFiles, &other)),
            };
            let (hoconums, block_ids) = self.footprints(&county).await?;
            let mut features = Vec::new();
            if !hoconums.is_empty() {
                let blocks = self.db.table("block", &self.vintage);
                let (block_fips, geometry) = (column("BLOCK_FIPS"), column("GEOMETRY"));
                let rows = self
                    .db
                    .query(
                        &format!(
                            "SELECT h.hoconum, ST_AsGeoJSON(ST_Multi(ST_Union(b.{geometry}))) \
                             FROM {blocks} b \
                             JOIN unnest($1::text[], $2::text[]) AS h(hoconum, block_fips) \
                             ON b.{block_fips} = h.block_fips \
                             GROUP BY h.hoconum ORDER BY h.hoconum"
                        ),
                        &[&hoconums, &block_ids],
                    )
                    .await?;
                for row in &rows {
                    let mut properties = Map::new();
                    properties.insert("hoconum".into(), row.get::<_, String>(0).into());
                    properties.insert("county_id".into(), county.clone().into());
                    features.push(feature(properties, row.get(1), None)?);
                }
            }
            scope
                .progress(
                    format!("{} providers in {county}", features.len()),
                    Some(Payload::Features(serialize(&features)?)),
                )
                .await?;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn provider(hoconum: &str, county: &str) -> Value {
        json!({
            "type": "Feature",
            "properties": {"hoconum": hoconum, "county_id": county},
            "geometry": null,
        })
    }

    #[test]
    fn large_providers_are_split_out_and_sorted() {
        let features = vec![
            provider("300167", "01003"),
            provider("130077", "01003"),
            provider("300167", "01001"),
            provider("130228", "01001"),
        ];
        let (large, other) = split_providers(features, &["300167".to_string()]);
        let keys = |list: &[Value]| {
            list.iter()
                .map(|f| format!("{}/{}", property(f, "hoconum"), property(f, "county_id")))
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(&large), ["300167/01001", "300167/01003"]);
        assert_eq!(keys(&other), ["130077/01003", "130228/01001"]);
    }

    #[test]
    fn payloads_become_features() {
        let payloads = vec![
            Payload::Features(vec![provider("1", "01001").to_string()]),
            Payload::File("ignored.csv".into()),
            Payload::Features(vec![]),
        ];
        let features = collect_features(payloads).unwrap();
        assert_eq!(features.len(), 1);
        assert!(collect_features(vec![Payload::Features(vec!["{".into()])]).is_err());
    }

    #[test]
    fn tracts_sort_by_id() {
        let mut features = vec![
            json!({"properties": {"tract_id": "01003010100"}}),
            json!({"properties": {"tract_id": "01001020100"}}),
        ];
        sort_features(&mut features, &["tract_id"]);
        assert_eq!(property(&features[0], "tract_id"), "01001020100");
    }
}
