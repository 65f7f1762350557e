use clap::Parser;
use std::path::PathBuf;

/// KCP game session gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path. If the file does not exist, it is created with default settings.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Overrides the listen address from the configuration file, e.g. "0.0.0.0:22102"
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Overrides the client version that selects the message type table
    #[arg(long)]
    pub client_version: Option<String>,

    /// Enables debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.toml"),
            listen: None,
            client_version: None,
            debug: false,
        }
    }
}
