use std::env;
use std::path::PathBuf;

pub const DEFAULT_LISTEN_PORT: u16 = 8000;

/// Node configuration assembled by the CLI and passed explicitly into the
/// core; nothing in the core reads the environment on its own.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub listen_port: u16,
    /// multiaddr of a known node to dial on startup
    pub bootstrap: Option<String>,
}

impl Config {
    pub fn from_env() -> Config {
        let data_dir = env::var("RUSTCOIN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        let listen_port = env::var("RUSTCOIN_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_LISTEN_PORT);
        Config {
            data_dir,
            listen_port,
            bootstrap: None,
        }
    }
}
