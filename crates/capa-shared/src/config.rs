use std::path::PathBuf;

use crate::error::CommonError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5912;
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Resolved broker configuration. Built once at startup from CLI flags (highest
/// precedence), then environment variables, then the defaults above.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub pid_file: PathBuf,
}

impl BrokerConfig {
    /// `cli_host`/`cli_port` come from explicit CLI flags and win over everything else.
    pub fn resolve(cli_host: Option<String>, cli_port: Option<u16>) -> Result<Self, CommonError> {
        let host = cli_host
            .or_else(|| std::env::var("HOST").ok())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = match cli_port {
            Some(p) => p,
            None => match std::env::var("PORT") {
                Ok(raw) => raw
                    .parse()
                    .map_err(|_| CommonError::InvalidRequest {
                        msg: format!("PORT environment variable is not a valid port number: {raw}"),
                        source: None,
                    })?,
                Err(_) => DEFAULT_PORT,
            },
        };

        let data_dir = match std::env::var("CAPA_DATA_DIR") {
            Ok(raw) => PathBuf::from(raw),
            Err(_) => dirs::home_dir()
                .ok_or_else(|| {
                    CommonError::Unknown(anyhow::anyhow!("could not determine home directory"))
                })?
                .join(".capa"),
        };

        let db_path = match std::env::var("CAPA_DB_PATH") {
            Ok(raw) => PathBuf::from(raw),
            Err(_) => data_dir.join("capa.db"),
        };

        let pid_file = data_dir.join("server.pid");

        Ok(Self {
            host,
            port,
            data_dir,
            db_path,
            pid_file,
        })
    }

    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, CommonError> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}
