use std::path::{Path, PathBuf};
use anyhow::{Context, Result};

const HOME_DIRECTORY_NAME: &str = ".sap-discovery";
const TEMP_DIRECTORY_NAME: &str = "sap-discovery";
const DATABASE_FILE_NAME: &str = "SDP.db";

/// Per-user working directory, `$HOME/.sap-discovery`, falling back to
/// `<tmp>/sap-discovery` when the home directory is missing or unusable.
pub fn working_dir() -> Result<PathBuf> {
    resolve_working_dir(dirs::home_dir().as_deref(), &std::env::temp_dir())
}

/// Default location of the inventory database
pub fn default_db_path() -> Result<PathBuf> {
    Ok(working_dir()?.join(DATABASE_FILE_NAME))
}

pub fn resolve_working_dir(home: Option<&Path>, tmp: &Path) -> Result<PathBuf> {
    if let Some(home) = home {
        let dir = home.join(HOME_DIRECTORY_NAME);
        match std::fs::create_dir_all(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) => {
                tracing::debug!(
                    "Unable to use directory {}: {}. Falling back to temporary directory",
                    dir.display(),
                    e
                );
            }
        }
    }

    let dir = tmp.join(TEMP_DIRECTORY_NAME);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Unable to access working directory: {}", dir.display()))?;
    Ok(dir)
}
