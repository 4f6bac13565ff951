//! Transcoding presets and the derived renditions created from them.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// A transcoding preset such as `720p`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quality {
    pub height: u32,
    pub name: String,
}

impl Quality {
    /// Whether a master of `master_height` pixels can be transcoded to this preset
    /// without upscaling.
    pub fn fits(&self, master_height: Option<u32>) -> bool {
        master_height.map_or(true, |h| self.height <= h)
    }
}

impl FromStr for Quality {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let height = name
            .strip_suffix('p')
            .and_then(|h| h.parse::<u32>().ok())
            .filter(|h| *h > 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid quality preset: {}", s))?;
        Ok(Quality {
            height,
            name: name.to_string(),
        })
    }
}

impl Display for Quality {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name)
    }
}

/// A derived rendition whose creation has been requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubformatDescriptor {
    pub key: String,
    pub preset_quality: String,
    pub master_version_id: Uuid,
    pub task_id: Uuid,
}

/// Key a derived rendition of `master_key` is stored under.
pub fn subformat_key(master_key: &str, quality: &Quality) -> String {
    let stem = master_key
        .rsplit_once('.')
        .map_or(master_key, |(stem, _)| stem);
    format!("{}-{}.mp4", stem, quality.name)
}
