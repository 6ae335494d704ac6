use actix_web::{middleware, web, App, HttpServer};
use anyhow::{Context, Result};
use cropdetect::annotate::Annotator;
use cropdetect::config::{Settings, DEFAULT_CONFIG_FILE, RUST_LOG};
use cropdetect::model::get_model;
use cropdetect::server::{routes, AppState};
use std::env;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: ./cropdetect [config file]";

fn get_args() -> PathBuf {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => PathBuf::from(DEFAULT_CONFIG_FILE),
        2 if args[1] != "-h" && args[1] != "--help" => PathBuf::from(&args[1]),
        _ => {
            println!("{USAGE}");
            std::process::exit(1);
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(RUST_LOG)),
        )
        .init();

    let config_file = get_args();
    let settings = Settings::load(&config_file)
        .with_context(|| format!("reading settings from {config_file:?}"))?;

    // The model is loaded once, here; the service is useless without it
    let model = get_model(&settings.model).map_err(|e| {
        error!("{e}");
        e
    })?;
    let model_info = model.info();

    let state = web::Data::new(AppState {
        model,
        annotator: Annotator::new(&settings.annotate)?,
        model_info,
    });

    let json_config = web::JsonConfig::default().limit(settings.server.max_payload_bytes);
    let addr = (settings.server.host.clone(), settings.server.port);
    info!("serving on http://{}:{}", addr.0, addr.1);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(json_config.clone())
            .wrap(middleware::Logger::default())
            .configure(routes::configure)
    })
    .bind(addr)?
    .run()
    .await?;

    Ok(())
}
