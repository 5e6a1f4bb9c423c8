use clap::Parser;
use env_logger::Env;
use log::{error, info};
use server::config::{Args, CommonConfig, RelaySettings};
use server::network::Server;

/// Main-method of the relay server.
/// Parses command-line arguments, loads the common configuration and runs the
/// relay loop until it stops or Ctrl+C is received.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    // Without the movement speed, positions sent to late joiners would be
    // wrong, so a bad config is fatal.
    let config = match CommonConfig::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let settings = RelaySettings::new(config, &args);
    let server = Server::bind(&args.bind_address(), settings).await?;
    let handle = server.handle();

    let mut relay = tokio::spawn(server.run());

    tokio::select! {
        result = &mut relay => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Relay stopped: {}", e),
                Err(e) => error!("Relay task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.shutdown();
            let _ = relay.await;
        }
    }

    Ok(())
}
