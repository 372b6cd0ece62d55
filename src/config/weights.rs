//! Tx weights table.
//!
//! Maps a tile identity to per-channel phase/amplitude corrections applied to
//! START transmissions:
//!
//! ```toml
//! [[tile-a]]
//! ch = 1
//! phase = 0.42
//! ampl = 0.9
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::exit_code::NodeExit;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelWeight {
    pub ch: usize,
    /// Phase offset in radians
    pub phase: f64,
    /// Linear amplitude factor
    pub ampl: f64,
}

impl ChannelWeight {
    pub const fn unity(ch: usize) -> Self {
        Self {
            ch,
            phase: 0.0,
            ampl: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightsTable(HashMap<String, Vec<ChannelWeight>>);

impl WeightsTable {
    pub fn load(path: &Path) -> Result<Self, WeightsError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WeightsError::FileNotFound(path.to_path_buf())
            } else {
                WeightsError::Io(path.to_path_buf(), e)
            }
        })?;
        let table: Self =
            toml::from_str(&contents).map_err(|e| WeightsError::Parse(path.to_path_buf(), e))?;
        debug!(path = %path.display(), tiles = table.0.len(), "[Weights] Loaded table");
        Ok(table)
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<ChannelWeight>)>,
    {
        Self(entries.into_iter().collect())
    }

    pub fn get(&self, tile: &str) -> Option<&[ChannelWeight]> {
        self.0.get(tile).map(Vec::as_slice)
    }

    /// Entry for `tile`, which must exist.
    pub fn require(&self, tile: &str) -> Result<TileWeights, WeightsError> {
        self.get(tile)
            .map(|w| TileWeights {
                tile: tile.to_string(),
                weights: w.to_vec(),
            })
            .ok_or_else(|| WeightsError::MissingTile(tile.to_string()))
    }
}

/// Weights selected for one transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct TileWeights {
    pub tile: String,
    pub weights: Vec<ChannelWeight>,
}

impl TileWeights {
    /// No correction on any channel.
    pub fn unity(tile: &str) -> Self {
        Self {
            tile: tile.to_string(),
            weights: Vec::new(),
        }
    }

    /// Weight for `ch`; channels without an entry are left uncorrected.
    pub fn channel(&self, ch: usize) -> ChannelWeight {
        self.weights
            .iter()
            .find(|w| w.ch == ch)
            .copied()
            .unwrap_or(ChannelWeight::unity(ch))
    }
}

#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("weights file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("weights I/O error ({}): {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("weights parse error ({}): {1}", .0.display())]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("no weights for tile '{0}'")]
    MissingTile(String),
}

impl WeightsError {
    pub const fn exit_code(&self) -> NodeExit {
        match self {
            Self::FileNotFound(_) | Self::MissingTile(_) => NodeExit::WeightsNotFound,
            Self::Parse(..) => NodeExit::WeightsParse,
            Self::Io(..) => NodeExit::ConfigUnexpected,
        }
    }
}
