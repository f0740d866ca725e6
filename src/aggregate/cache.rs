use std::{fs, path::Path};

use rkyv::{AlignedVec, Archive};
use tracing::debug;

use super::{blocks::BlockMaster, fbd::FbdRecord};
use crate::error::{Error, Result};

const ZSTD_LEVEL: i32 = 3;

/// Deployment records and block master, parsed once by the master and
/// shared with every servant through `temp/pickles`.
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Default)]
#[archive(check_bytes)]
pub struct PreparedInputs {
    pub fbd: Vec<FbdRecord>,
    pub blocks: BlockMaster,
}

impl PreparedInputs {
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = rkyv::to_bytes::<_, 4096>(self).map_err(|_| Error::CouldNotEncodeMessage)?;
        let compressed = zstd::encode_all(bytes.as_slice(), ZSTD_LEVEL)?;
        // write-then-rename so a reader never sees half a cache
        let partial = path.with_extension("partial");
        fs::write(&partial, &compressed)?;
        fs::rename(&partial, path)?;
        debug!(path = %path.display(), bytes = compressed.len(), "wrote prepared inputs");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let compressed = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::MissingInput(path.to_path_buf()))?
            }
            Err(e) => Err(e)?,
        };
        let corrupt = || Error::CorruptCache(path.to_path_buf());
        let raw = zstd::decode_all(compressed.as_slice()).map_err(|_| corrupt())?;
        let mut aligned = AlignedVec::with_capacity(raw.len());
        aligned.extend_from_slice(&raw);
        rkyv::from_bytes::<Self>(&aligned).map_err(|_| corrupt())
    }
}
