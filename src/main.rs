// src/main.rs

use log::error;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = nym_directory::run().await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
