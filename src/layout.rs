//! Directory roles under the run root.
//!
//! Phases only address files through these roles so the directory names can
//! move without touching phase code.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_csv(&self) -> PathBuf {
        self.root.join("inputs/csv")
    }

    pub fn input_shape(&self) -> PathBuf {
        self.root.join("inputs/shape")
    }

    pub fn temp_csv(&self) -> PathBuf {
        self.root.join("temp/csv")
    }

    pub fn temp_geo_geojson(&self) -> PathBuf {
        self.root.join("temp/geo_geojson")
    }

    pub fn temp_speed_geojson(&self) -> PathBuf {
        self.root.join("temp/speed_geojson")
    }

    /// Binary caches shared between the master and servants.
    pub fn temp_pickles(&self) -> PathBuf {
        self.root.join("temp/pickles")
    }

    pub fn temp_mbtiles(&self) -> PathBuf {
        self.root.join("temp/mapbox_tiles")
    }

    pub fn output_csv(&self) -> PathBuf {
        self.root.join("outputs/csv")
    }

    pub fn output_mbtiles(&self) -> PathBuf {
        self.root.join("outputs/mapbox_tile")
    }

    /// Per-county slices of the deployment file.
    pub fn county_fbd(&self) -> PathBuf {
        self.temp_csv().join("county_fbd")
    }

    pub fn block_numprov(&self) -> PathBuf {
        self.temp_csv().join("block_numprov")
    }

    pub fn tract_numprov(&self) -> PathBuf {
        self.temp_csv().join("tract_numprov")
    }

    pub fn county_numprov(&self) -> PathBuf {
        self.temp_csv().join("county_numprov")
    }

    /// Creates every role directory that does not exist yet.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.input_csv(),
            self.input_shape(),
            self.temp_csv(),
            self.temp_geo_geojson(),
            self.temp_speed_geojson(),
            self.temp_pickles(),
            self.temp_mbtiles(),
            self.output_csv(),
            self.output_mbtiles(),
            self.county_fbd(),
            self.block_numprov(),
            self.tract_numprov(),
            self.county_numprov(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Removes a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
