use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use trafcacc_core::Role;

pub fn config_file_name(role: Role) -> &'static str {
    match role {
        Role::Frontend => "trafcacc-frontend.toml",
        Role::Backend => "trafcacc-backend.toml",
    }
}

pub fn default_config_path(role: Role) -> Result<PathBuf> {
    let proj = ProjectDirs::from("io", "trafcacc", "trafcacc")
        .context("could not determine platform config directory")?;
    let dir = proj.config_dir();
    Ok(dir.join(config_file_name(role)))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Load a role config; a missing file yields the defaults.
pub fn load<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: T = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

pub fn save<T: Serialize>(path: &Path, cfg: &T, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    ensure_parent_dir(path)?;
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}
