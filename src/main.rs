use telesmtp::config::Settings;
use tracing::error;

#[tokio::main]
async fn main() {
    telesmtp::logging::init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // The only command-line argument is the hostname to announce
    let settings = match std::env::args().nth(1) {
        Some(hostname) => settings.with_hostname(hostname),
        None => settings,
    };

    if let Err(e) = telesmtp::run(settings).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
