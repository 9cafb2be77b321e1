use std::path::{Path, PathBuf};

use tally_core::TallyConfig;

/// Configuration from `path` (defaults when absent), with `data_dir`
/// taking precedence over the file's setting.
pub fn load(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<TallyConfig> {
    let mut config = match path {
        Some(path) => TallyConfig::from_file(path)?,
        None => TallyConfig::default(),
    };
    if data_dir.is_some() {
        config.data_dir = data_dir;
    }
    Ok(config)
}

pub fn print(config: &TallyConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}
