use std::fs;
use std::path::Path;

use capa_shared::error::CommonError;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Fails fast if `path` holds a `<pid>:<version>` record for a process that is
/// still alive, rather than binding a second listener on top of a running broker.
/// A record whose PID is dead is stale and silently ignored — the caller overwrites
/// it once the new process is up.
pub fn check_not_already_running(path: &Path) -> Result<(), CommonError> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Ok(());
    };
    let Some((pid_str, _version)) = contents.trim().split_once(':') else {
        return Ok(());
    };
    let Ok(pid) = pid_str.parse::<i32>() else {
        return Ok(());
    };

    if kill(Pid::from_raw(pid), None).is_ok() {
        return Err(CommonError::InvalidRequest {
                msg: format!(
                    "capa is already running (pid {pid}); remove {} if this is stale",
                    path.display()
                ),
                source: None,
        });
    }
    Ok(())
}

pub fn write(path: &Path, version: &str) -> Result<(), CommonError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}:{version}", std::process::id()))?;
    Ok(())
}

pub fn remove(path: &Path) {
    let _ = fs::remove_file(path);
}
