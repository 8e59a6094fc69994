use log::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // `log` records from config and transport code are routed into tracing.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to install log bridge: {}", e);
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install tracing subscriber: {}", e);
    }

    if let Err(e) = mailscribe::run().await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
