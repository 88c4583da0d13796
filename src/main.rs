use shopfinity::app::App;
use shopfinity::config::load_config;
use shopfinity::utils::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.log.level);
    info!(
        "Starting Shopfinity backend (broker: {:?}, rabbitmq: {})",
        settings.broker.kind,
        settings.rabbitmq.redacted_uri()
    );

    if let Err(e) = App::from_settings(settings).run().await {
        error!("Server failed: {e:#}");
    }
}
