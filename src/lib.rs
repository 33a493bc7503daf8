use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{
    web::{Data, JsonConfig},
    App, HttpServer,
};
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

use crate::{
    config::Config,
    error::Error,
    messenger::{Messenger, TelegramApi},
    scheduler::Scheduler,
    service::Service,
};

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod messenger;
pub mod resolver;
pub mod scheduler;
pub mod sender;
pub mod service;

/// Returns a builder for the main application.
#[bon::builder(finish_fn = start)]
pub async fn run() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("COURIER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("COURIER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let messenger: Option<Arc<dyn Messenger>> = config
        .bot_token
        .clone()
        .map(|token| Arc::new(TelegramApi::new(token)) as Arc<dyn Messenger>);

    let service = Service::connect_with()
        .config(config.clone())
        .maybe_messenger(messenger)
        .connect()
        .await?;

    let scheduler = Arc::new(Scheduler::new(&service));

    match scheduler.start() {
        Ok(()) => {}
        Err(Error::Configuration { message }) => {
            tracing::warn!("{message}");
        }
        Err(e) => return Err(e.into()),
    }

    let data = Data::new(service);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_header()
            .allow_any_method();

        let json_cfg = JsonConfig::default().content_type_required(false);

        App::new()
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(api::broadcast::service())
            .service(api::users::service())
            .service(api::audit::service())
            .app_data(json_cfg)
            .app_data(data.clone())
    })
    .bind(config.listen_addr.as_str())?
    .run();

    let result = server.await;

    scheduler.stop();

    result?;

    Ok(())
}
