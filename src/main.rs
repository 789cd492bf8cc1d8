mod completion;
mod config;
mod handler;
mod transport;

use tracing::{error, info};
use tracing_subscriber::prelude::*;

use config::Config;
use transport::DeltaChat;

#[tokio::main]
async fn main() {
    // .env is optional; real deployments set the environment directly.
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("serve") => serve().await,
        Some("init") => match args.as_slice() {
            [_, addr, password] => init(addr, password).await,
            _ => usage(),
        },
        _ => usage(),
    }
}

fn usage() {
    eprintln!("usage: aibot serve");
    eprintln!("       aibot init <addr> <password>");
    std::process::exit(2);
}

async fn serve() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let ai = match completion::Client::new(&config) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build completion client: {e}");
            std::process::exit(1);
        }
    };

    info!("Starting bot. Responding to: {:?}", config.respond_to);
    info!("Using model: {}", config.model);

    let mut chat = match DeltaChat::spawn() {
        Ok(chat) => chat,
        Err(e) => {
            error!("Failed to start transport: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = chat.serve(&config, &ai).await {
        error!("Event loop terminated: {e}");
        std::process::exit(1);
    }
}

async fn init(addr: &str, password: &str) {
    let mut chat = match DeltaChat::spawn() {
        Ok(chat) => chat,
        Err(e) => {
            error!("Failed to start transport: {e}");
            std::process::exit(1);
        }
    };

    match chat.provision_account(addr, password).await {
        Ok(account_id) => info!("Account {account_id} configured for {addr}"),
        Err(e) => {
            error!("Failed to configure account: {e}");
            std::process::exit(1);
        }
    }
}
