mod message;
mod protocol;
mod runtime;
mod store;
mod utils;

use std::{ env, sync::Arc };
use std::path::Path;
use anyhow::Result;
use tracing::{ info, error };
use tracing_subscriber::filter::LevelFilter;

use crate::runtime::Runtime;
use crate::utils::config::ConfigLoader;

#[tokio::main]
async fn main() -> Result<()> {

    // rustls 0.23 needs a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config_path = String::from("/etc/lightbridge/config.ini");

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                match args.next() {
                    Some(path) => {
                        config_path = path;
                    }
                    None => {
                        eprintln!("--config needs a path");
                        std::process::exit(1);
                    }
                }
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(1);
            }
        }
    }

    let resolved_path = if Path::new(&config_path).exists() {
        config_path.clone()
    } else {
        let dev_path = "config/lightbridge.conf";
        if Path::new(dev_path).exists() {
            dev_path.to_string()
        } else {
            config_path.clone()
        }
    };

    let loader = match ConfigLoader::new(resolved_path).load().await {
        Ok(loader) => loader,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    let data = loader.get_config().clone();
    let config = Arc::new(data);

    let json_enabled = config.get_bool("logging", "json", false);
    let level = match config.get_value("logging", "level").unwrap_or("info").to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };
    if json_enabled {
        tracing_subscriber::fmt().with_max_level(level).json().init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    let runtime = match Runtime::new(config) {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!(error = %e, "Failed to initialise runtime");
            std::process::exit(1);
        }
    };
    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    info!(version = env!("CARGO_PKG_VERSION"), "lightbridge starting");
    runtime.run(&mut tasks).await?;

    for task in tasks {
        task.await?;
    }

    Ok(())
}
