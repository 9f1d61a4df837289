use anyhow::{Context, Result};
use clap::Args;
use credmesh_core::{MeshConfig, PolicyDocument};
use std::path::PathBuf;

/// Where the mesh configuration comes from
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Mesh configuration (TOML). Without it the reference topology is used.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Quorum policy document (TOML) replacing the configured one
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Tenant for the reference topology
    #[arg(long, default_value = "tenant-demo")]
    pub tenant: String,

    /// Data directory for the reference topology
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<MeshConfig> {
        let mut config = match &self.config {
            Some(path) => MeshConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => {
                let mut config = MeshConfig::demo(&self.tenant, &self.data_dir);
                config
                    .apply_env_overrides()
                    .context("invalid environment override")?;
                config
            }
        };
        if let Some(path) = &self.policy {
            config.policy = PolicyDocument::from_file(path)
                .with_context(|| format!("failed to load policy {}", path.display()))?;
        }
        config.validate().context("invalid mesh configuration")?;
        Ok(config)
    }
}
