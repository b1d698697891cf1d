//! Configuration system for the weft workflow file processor.
//!
//! Provides TOML-based configuration with:
//! - A `[processor]` section for the parsing loop (pool size, intervals, timeouts)
//! - A `[discovery]` section for source scanning (patterns, ignore files)
//! - A `[store]` section selecting the persistence backend
//! - A `[logging]` section for the log file location
//! - Config file layering (user config dir + project-local `weft.toml`)
//!
//! CLI flags are applied on top of the merged file config by the binary.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
