use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use callpatch_core::config::PatchConfig;

/// Write the default patch config to `path`; the extension picks YAML or JSON.
pub fn init_config_command(path: &str, force: bool) -> Result<()> {
    let path = Path::new(path);
    if path.exists() && !force {
        return Err(anyhow!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        ));
    }

    let body = PatchConfig::default().to_string_for(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
    }
    fs::write(path, body)
        .with_context(|| format!("Failed to write config: {}", path.display()))?;

    println!("Wrote default config to {}", path.display());
    Ok(())
}
