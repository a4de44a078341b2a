use std::path::Path;

use crate::config::config::{HostKeySource, ServerConfig};
use crate::error::StartupError;

pub fn print_banner(config: &ServerConfig) {
    let host_key = match &config.host_key {
        HostKeySource::File(path) => path.display().to_string(),
        HostKeySource::Ephemeral => "ephemeral".to_string(),
    };

    let ascii_art = format!(
        r#"
      __    _       __    __      __
     / /   (_)___ _/ /_  / /_____/ /
    / /   / / __ `/ __ \/ __/ __  /
   / /___/ / /_/ / / / / /_/ /_/ /  SFTP
  /_____/_/\__, /_/ /_/\__/\__,_/
          /____/

Lightd SFTP v{}
  listening on {}
  serving      {}
  host key     {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.listen,
        config.root.display(),
        host_key
    );

    println!("{}", ascii_art);
}

/// Check the served root
/// A missing root is created; anything else that is not a directory is fatal.
pub async fn prepare_root(root: &Path) -> Result<(), StartupError> {
    let fail = |source| StartupError::Root {
        path: root.to_path_buf(),
        source,
    };

    if !root.exists() {
        tracing::info!("Creating served root: {}", root.display());
        tokio::fs::create_dir_all(root).await.map_err(fail)?;
    }

    let metadata = tokio::fs::metadata(root).await.map_err(fail)?;
    if !metadata.is_dir() {
        tracing::error!("Served root is not a directory: {}", root.display());
        return Err(StartupError::RootNotDirectory(root.to_path_buf()));
    }

    if metadata.permissions().readonly() {
        tracing::warn!("Served root is read-only: {}", root.display());
    }

    tracing::info!("Served root ready: {}", root.display());
    Ok(())
}
