pub mod init_config;
pub mod list_calls;
pub mod patch;

pub use init_config::*;
pub use list_calls::*;
pub use patch::*;

use anyhow::Result;
use callpatch_core::config::PatchConfig;

/// Load `--config` (or the defaults) and apply any flag overrides on top.
pub fn resolve_config(
    path: Option<&str>,
    source_symbol: Option<String>,
    target_section: Option<String>,
    target_name: Option<String>,
) -> Result<PatchConfig> {
    let base = match path {
        Some(p) => PatchConfig::from_path(p)?,
        None => PatchConfig::default(),
    };
    Ok(base.with_overrides(source_symbol, target_section, target_name))
}
