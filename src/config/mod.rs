//! Node Configuration Module
//!
//! Per-node configuration loaded once from a TOML file at start-up.
//!
//! ## Loading Order
//!
//! 1. `--config-file` command-line argument
//! 2. `TILESYNC_CONFIG` environment variable (path to TOML file)
//!
//! A missing or malformed file is fatal; each failure maps to its own exit
//! code. The loaded config is wrapped in an `Arc` by `main` and handed to
//! every component that needs it.

mod node_config;
pub mod defaults;
pub mod validation;
pub mod weights;

pub use node_config::*;
pub use weights::{ChannelWeight, TileWeights, WeightsError, WeightsTable};
