//! sockconsole: drive line consoles on remote peers
//!
//! Two modes:
//! - `serve`: accept peers and run operator commands from stdin against
//!   their consoles (`list`, `echo`, `prompt`, `broadcast`, `clean`, `quit`)
//! - `connect`: act as a remote terminal, printing server lines and
//!   sending stdin lines back
//!
//! Configuration via CLI arguments or TOML file.

mod operator;

use operator::Command;
use sockconsole::config::{Config, Mode};
use sockconsole::{Client, ConsoleError, PromptOutcome, Server};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.mode.clone() {
        Mode::Serve { listen } => run_server(config, &listen).await,
        Mode::Connect { address } => run_client(config, &address).await,
    }
}

/// Serve peers and execute operator commands until `quit` or end of stdin
async fn run_server(config: Config, listen: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %listen,
        max_connections = config.server.max_connections,
        backlog = config.server.backlog,
        "Starting sockconsole server"
    );

    let server = Arc::new(Server::new(config.server));
    server.listen(listen)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match operator::parse(&line) {
            Ok(command) => command,
            Err(operator::ParseError::Empty) => continue,
            Err(e) => {
                println!("error: {e}");
                continue;
            }
        };

        match command {
            Command::List => {
                for key in server.get_keys() {
                    println!("{key}");
                }
            }
            Command::Echo { key, text } => {
                let result = match server.get_console(&key) {
                    Ok(console) => console.echo(&text).await,
                    Err(e) => Err(e),
                };
                report(result);
            }
            Command::Prompt { key, wait, text } => {
                // Answers can take a while; keep accepting operator commands
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    let console = match server.get_console(&key) {
                        Ok(console) => console,
                        Err(e) => return report::<()>(Err(e)),
                    };
                    match console.prompt(&text, wait).await {
                        Ok(PromptOutcome::Reply(reply)) => println!("{key}> {reply}"),
                        Ok(PromptOutcome::TimedOut) => println!("{key}: no reply"),
                        Ok(PromptOutcome::Disconnected) => println!("{key}: disconnected"),
                        Err(e) => println!("error: {e}"),
                    }
                });
            }
            Command::Broadcast(text) => {
                for key in server.get_keys() {
                    if let Ok(console) = server.get_console(&key) {
                        if let Err(e) = console.echo(&text).await {
                            warn!(peer = %key, error = %e, "Broadcast failed");
                        }
                    }
                }
            }
            Command::Clean => {
                let count = server.clean().await;
                println!("removed {count}");
            }
            Command::Quit => break,
        }
    }

    server.close().await;
    Ok(())
}

fn report<T>(result: Result<T, ConsoleError>) {
    if let Err(e) = result {
        println!("error: {e}");
    }
}

/// Print server lines and send stdin lines back until either side ends
async fn run_client(config: Config, address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(Client::connect_with(address, config.client).await?);

    let printer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            while let Ok(line) = client.read().await {
                println!("{line}");
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if client.write(&line).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = client.closed() => break,
        }
    }

    client.close().await;
    let _ = printer.await;
    info!("Disconnected");
    Ok(())
}
