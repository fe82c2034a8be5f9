//! Unified configuration system.
//!
//! Consolidates configuration from tiers with field-by-field YAML merging:
//! 1. **Defaults** - `Config::default()`
//! 2. **Project** - `$CWD/tasking/config.yaml`
//! 3. **User** - `~/.tasking/config.yaml`
//! 4. **Environment** - variables below
//!
//! ## Environment Variables
//! - `TASKING_CONFIG_PATH` - Explicit config file (replaces the file tiers)
//! - `TASKING_DB_PATH` - Database path
//! - `TASKING_LOCK_TTL_SECONDS` - Sweeper lock TTL
//! - `TASKING_SWEEP_INTERVAL_SECONDS` - Sweeper interval
//! - `TASKING_USER_DIR` - User config dir (default: `~/.tasking`)
//! - `TASKING_PROJECT_DIR` - Project config dir (default: `./tasking`)

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::{deep_merge, deep_merge_all};
pub use types::*;
