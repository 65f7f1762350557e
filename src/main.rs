use std::sync::Arc;

use clap::Parser;
use tracing::{error, warn};

use kcpgate::config::{load_config, load_initial_keystream, Args, ConfigSource};
use kcpgate::frame::FrameCodec;
use kcpgate::handlers::register_builtin_handlers;
use kcpgate::logging::setup_logging;
use kcpgate::schema::{JsonSchemaProvider, MessageTypeRegistry};
use kcpgate::server::{Dispatcher, EndPoint};
use kcpgate::util::random::{Random, RngRandom};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (settings, config_source) = load_config(&args).await?;
    setup_logging(&args, settings.logging.json_format)?;
    if config_source == ConfigSource::CreatedDefault {
        warn!("configuration file {} not found, created it with default settings", args.config.display());
    }

    let registry = match MessageTypeRegistry::load(&settings.protocol.versions_dir, &settings.protocol.client_version) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("failed to load message types for client version {}: {}", settings.protocol.client_version, e);
            std::process::exit(1);
        }
    };

    let initial_keystream = match load_initial_keystream(&settings.protocol.initial_key_path).await {
        Ok(keystream) => keystream,
        Err(e) => {
            error!("failed to load initial keystream: {}", e);
            std::process::exit(1);
        }
    };

    let random: Arc<dyn Random> = Arc::new(RngRandom {});
    let schemas = Arc::new(JsonSchemaProvider::new(&registry));
    let codec = FrameCodec::new(registry, schemas);

    let mut dispatcher = Dispatcher::new(codec, settings.dispatcher_config());
    register_builtin_handlers(&mut dispatcher, &settings.protocol.bootstrap_message, random.clone(), settings.protocol.key_seed)?;

    let end_point = match EndPoint::new(settings.end_point_config()?, Arc::new(dispatcher), initial_keystream, random).await {
        Ok(end_point) => Arc::new(end_point),
        Err(e) => {
            error!("failed to start UDP end point on {}: {}", settings.server.listen_addr, e);
            std::process::exit(1);
        }
    };

    end_point.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
            futures::future::pending::<()>().await;
        }
    }).await;

    Ok(())
}
