use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 5000);
pub const DEFAULT_DATA_FILE: &str = "sheets.bin.gz";

/// Server configuration, read from the environment at startup.
///
/// * `COLLABSHEET_ADDR`: socket address to bind (default `127.0.0.1:5000`)
/// * `COLLABSHEET_DATA`: path of the persisted sheet snapshot
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let (ip, port) = DEFAULT_ADDR;
        Config {
            addr: SocketAddr::from((ip, port)),
            data_path: PathBuf::from(DEFAULT_DATA_FILE),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let addr = env::var("COLLABSHEET_ADDR")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.addr);
        let data_path = env::var("COLLABSHEET_DATA")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_path);

        Config { addr, data_path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.addr.to_string(), "127.0.0.1:5000");
        assert_eq!(config.data_path, PathBuf::from("sheets.bin.gz"));
    }
}
