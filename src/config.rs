//! Command line arguments and the TOML configuration file

pub mod args;
pub mod settings;

pub use args::Args;
pub use settings::{LoggingSettings, ProtocolSettings, ServerSettings, Settings};

use std::path::Path;

use anyhow::{bail, Context};
use base64::Engine;

use crate::crypto::Keystream;

/// Where the settings returned by [load_config] came from. Loading happens before logging is
///  installed, so the caller reports this once it is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// the file did not exist and was created with the default settings
    CreatedDefault,
}

/// Loads the configuration file named in `args` and applies command line overrides. A missing
///  file is created with the default settings.
pub async fn load_config(args: &Args) -> anyhow::Result<(Settings, ConfigSource)> {
    let (mut settings, source) = if args.config.exists() {
        let text = tokio::fs::read_to_string(&args.config).await
            .with_context(|| format!("reading config file {}", args.config.display()))?;
        let settings = toml::from_str::<Settings>(&text)
            .with_context(|| format!("parsing config file {}", args.config.display()))?;
        (settings, ConfigSource::File)
    }
    else {
        let settings = Settings::default();
        tokio::fs::write(&args.config, toml::to_string_pretty(&settings)?).await
            .with_context(|| format!("writing default config file {}", args.config.display()))?;
        (settings, ConfigSource::CreatedDefault)
    };

    settings.apply_args(args);
    Ok((settings, source))
}

/// Reads the initial keystream: a file holding base64 text, surrounding whitespace is ignored
pub async fn load_initial_keystream(path: &Path) -> anyhow::Result<Keystream> {
    let text = tokio::fs::read_to_string(path).await
        .with_context(|| format!("reading initial keystream {}", path.display()))?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(text.trim())
        .with_context(|| format!("initial keystream {} is not valid base64", path.display()))?;
    if bytes.is_empty() {
        bail!("initial keystream {} is empty", path.display());
    }
    Keystream::new(bytes)
}
