use common::model::Config;
use engine::Engine;
use log::{error, info};
use std::path::PathBuf;
use std::process::exit;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {config_path}: {e}");
            exit(1);
        }
    };

    if let Err(e) = init_logging(&config).await {
        eprintln!("failed to initialize logging: {e}");
        exit(1);
    }

    info!("loaded configuration from {config_path}");

    let engine = match Engine::new(config).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("engine startup failed: {e}");
            exit(1);
        }
    };

    if let Err(e) = engine.run().await {
        error!("engine exited with error: {e}");
        exit(1);
    }
}

async fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    match &config.logger {
        Some(logger) => {
            let mut logger_config = utils::logger::LoggerConfig::new()
                .with_level(&logger.level)
                .with_console(logger.console)
                .with_json(logger.json);
            if let Some(dir) = &logger.dir {
                logger_config = logger_config
                    .with_file_path(PathBuf::from(dir).join(format!("conveyor.{}", config.name)));
            }
            logger_config.init().await
        }
        None => utils::logger::init_app_logger(&config.name).await.map(|_| ()),
    }
}
