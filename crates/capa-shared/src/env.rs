use std::path::PathBuf;

fn traverse_up_for_env_file(file_name: &str) -> Option<PathBuf> {
    let relative_workspace_root = PathBuf::from("./../../").join(file_name);

    if PathBuf::from(file_name).exists() {
        Some(PathBuf::from(file_name))
    } else if relative_workspace_root.exists() {
        Some(relative_workspace_root)
    } else {
        None
    }
}

/// Loads a `.env` file if present, walking up one level to support running
/// from a workspace member directory. Silently a no-op if none is found.
pub fn configure_env() -> Result<(), anyhow::Error> {
    if let Some(path) = traverse_up_for_env_file(".env") {
        dotenv::from_filename(path).ok();
    }
    Ok(())
}
