mod managed_files;
mod oauth;
mod projects;
mod sessions;
mod subprocesses;
mod tool_init;
mod variables;

pub use managed_files::*;
pub use oauth::*;
pub use projects::*;
pub use sessions::*;
pub use subprocesses::*;
pub use tool_init::*;
pub use variables::*;

use crate::connection::Connection;

/// Owns the single libsql connection and implements every `*RepositoryLike` trait
/// in this module.
#[derive(Debug, Clone)]
pub struct Repository {
    pub conn: Connection,
}

impl Repository {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}
