//! File names of every intermediate and final artifact.
//!
//! Directories come from [`Layout`]; the names carry the vintages so runs of
//! different releases can share a root.

use std::path::PathBuf;

use crate::{config::Settings, layout::Layout};

pub fn fbd_input(layout: &Layout, settings: &Settings) -> PathBuf {
    layout.input_csv().join(&settings.phase.fbd_file)
}

pub fn block_master_input(layout: &Layout, settings: &Settings) -> PathBuf {
    layout.input_csv().join(&settings.phase.blockmaster_data_file)
}

/// Named after the configuration digest so a changed configuration never
/// reuses an old cache.
pub fn prepared_inputs(layout: &Layout, settings: &Settings) -> PathBuf {
    layout
        .temp_pickles()
        .join(format!("prepared_inputs_{}.bin", settings.short_digest()))
}

pub fn county_fbd(layout: &Layout, county: &str) -> PathBuf {
    layout.county_fbd().join(format!("fbd_{county}.csv"))
}

pub fn provider_table(layout: &Layout, fbd_vintage: &str) -> PathBuf {
    layout
        .output_csv()
        .join(format!("provider_table_{fbd_vintage}.csv"))
}

pub fn block_numprov(layout: &Layout, speed: &str, fbd_vintage: &str) -> PathBuf {
    layout
        .block_numprov()
        .join(format!("block_numprov_{speed}_{fbd_vintage}.csv"))
}

pub fn block_numprov_zero(layout: &Layout, speed: &str, fbd_vintage: &str) -> PathBuf {
    layout
        .block_numprov()
        .join(format!("block_numprov_{speed}_with_zero_{fbd_vintage}.csv"))
}

pub fn area_table_part(layout: &Layout, speed: &str, fbd_vintage: &str) -> PathBuf {
    layout
        .temp_csv()
        .join(format!("area_table_{speed}_{fbd_vintage}.csv"))
}

pub fn area_table(layout: &Layout, fbd_vintage: &str) -> PathBuf {
    layout
        .output_csv()
        .join(format!("area_table_{fbd_vintage}.csv"))
}

pub fn tract_numprov(layout: &Layout, speed: &str, fbd_vintage: &str) -> PathBuf {
    layout
        .tract_numprov()
        .join(format!("tract_numprov_sort_round_{speed}_{fbd_vintage}.csv"))
}

pub fn county_numprov(layout: &Layout, speed: &str, fbd_vintage: &str) -> PathBuf {
    layout
        .county_numprov()
        .join(format!("county_numprov_sort_round_{speed}_{fbd_vintage}.csv"))
}

/// GeoJSON of one geography exported from the database.
pub fn geography_geojson(layout: &Layout, geography: &str, geometry_vintage: &str) -> PathBuf {
    layout
        .temp_geo_geojson()
        .join(format!("nbm2_{geography}_{geometry_vintage}.geojson"))
}

pub fn geography_tiles(layout: &Layout, geography: &str, geometry_vintage: &str) -> PathBuf {
    layout
        .output_mbtiles()
        .join(format!("nbm2_{geography}_{geometry_vintage}.mbtiles"))
}

pub fn sorted_tracts(layout: &Layout, settings: &Settings) -> PathBuf {
    let phase = &settings.phase;
    layout.temp_speed_geojson().join(format!(
        "tracts_{}_{}.sort.geojson",
        phase.geometry_vintage, phase.census_vintage
    ))
}

pub fn large_providers(layout: &Layout, fbd_vintage: &str) -> PathBuf {
    layout
        .temp_speed_geojson()
        .join(format!("{fbd_vintage}_prov_lg.geojson"))
}

pub fn other_providers(layout: &Layout, fbd_vintage: &str) -> PathBuf {
    layout
        .temp_speed_geojson()
        .join(format!("{fbd_vintage}_prov_other.geojson"))
}

/// A speed-joined GeoJSON for one level, e.g. `tracts_25_3.geojson`.
pub fn speed_geojson(layout: &Layout, level: &str, speed: &str) -> PathBuf {
    layout
        .temp_speed_geojson()
        .join(format!("{level}_{speed}.geojson"))
}

/// One zoom band of one speed, e.g. `tract_z5_25_3.mbtiles`.
pub fn zoom_tiles(layout: &Layout, band: &str, speed: &str) -> PathBuf {
    layout
        .temp_mbtiles()
        .join(format!("{band}_{speed}.mbtiles"))
}

pub fn speed_tiles(layout: &Layout, speed: &str, fbd_vintage: &str) -> PathBuf {
    layout
        .output_mbtiles()
        .join(format!("{fbd_vintage}_{speed}.mbtiles"))
}

pub fn provider_band_tiles(layout: &Layout, band: &str) -> PathBuf {
    layout.temp_mbtiles().join(format!("{band}.mbtiles"))
}

pub fn provider_tiles(layout: &Layout, name: &str, fbd_vintage: &str) -> PathBuf {
    layout
        .output_mbtiles()
        .join(format!("{name}_{fbd_vintage}.mbtiles"))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn numprov_files_sit_in_their_roles() {
        let layout = Layout::new("/srv/nbm2");
        assert_eq!(
            block_numprov_zero(&layout, "25_3", "jun2018"),
            Path::new("/srv/nbm2/temp/csv/block_numprov/block_numprov_25_3_with_zero_jun2018.csv")
        );
        assert_eq!(
            tract_numprov(&layout, "200", "jun2018"),
            Path::new("/srv/nbm2/temp/csv/tract_numprov/tract_numprov_sort_round_200_jun2018.csv")
        );
        assert_eq!(
            area_table(&layout, "jun2018"),
            Path::new("/srv/nbm2/outputs/csv/area_table_jun2018.csv")
        );
    }
}
