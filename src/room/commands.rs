// Command handlers for the room CLI

use crate::room::*;
use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Execute a parsed CLI invocation
pub async fn execute_command(cli: KeyroomCli) -> Result<()> {
    match cli.command {
        KeyroomCommand::Listen { port, bind, username, key } => {
            let config = load_config(&cli.config, username)?;
            handle_listen(config, port, bind, key).await
        }
        KeyroomCommand::Connect { key, address, port, username } => {
            let config = load_config(&cli.config, username)?;
            handle_connect(config, key, address, port).await
        }
        KeyroomCommand::Keygen => {
            println!("{}", SharedSecret::generate().to_hex());
            Ok(())
        }
        KeyroomCommand::InitConfig { force } => handle_init_config(cli.config, force),
    }
}

fn load_config(path: &Option<std::path::PathBuf>, username: Option<String>) -> Result<PeerConfig> {
    let mut config = PeerConfig::load_or_default(path.as_deref())
        .context("Failed to load configuration")?;
    config.set_username(username);
    Ok(config)
}

async fn handle_listen(
    config: PeerConfig,
    port: Option<u16>,
    bind: Option<String>,
    key: Option<String>,
) -> Result<()> {
    let secret = match key {
        Some(key) => SharedSecret::from_hex(&key).context("Invalid room key")?,
        None => SharedSecret::generate(),
    };

    let (connection, events) =
        Connection::with_frame_limit(config.username.clone(), secret, config.max_frame_len);
    let connection = connection.with_bind_host(bind.unwrap_or(config.bind_host));

    let listening = connection
        .start_listening(port.unwrap_or(config.port))
        .await
        .context("Failed to start listening")?;

    println!("Listening on {}", listening.local_addr);
    println!("Encryption key: {}", listening.key_hex);
    println!("Type a message and press Enter to send; Ctrl+C to quit.");

    run_session(connection, events, &config.username).await
}

async fn handle_connect(
    config: PeerConfig,
    key: String,
    address: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let secret = SharedSecret::from_hex(&key).context("Invalid room key")?;

    let (connection, events) =
        Connection::with_frame_limit(config.username.clone(), secret, config.max_frame_len);
    let printer = spawn_printer(events);

    let address = address.unwrap_or(config.address);
    let port = port.unwrap_or(config.port);

    let connected = match connection.connect(&address, port).await {
        Ok(connected) => connected,
        Err(e) => {
            // Let the printer flush the handshake status before exiting
            drop(connection);
            let _ = printer.await;
            return Err(e).with_context(|| format!("Failed to join room at {}:{}", address, port));
        }
    };

    println!(
        "Joined room hosted by {} at {}",
        connected.host_identity, connected.peer_addr
    );

    read_input(&connection, &config.username).await?;
    connection.close_all().await;
    printer.abort();

    Ok(())
}

fn handle_init_config(path: Option<std::path::PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(PeerConfig::default_path);

    if path.exists() && !force {
        anyhow::bail!("Config file {:?} already exists (use --force to overwrite)", path);
    }

    PeerConfig::default()
        .save(&path)
        .context("Failed to write configuration")?;

    println!("✓ Wrote default configuration to {:?}", path);
    Ok(())
}

/// Print events and send stdin lines until EOF or Ctrl+C
async fn run_session(connection: Connection, events: EventReceiver, username: &str) -> Result<()> {
    let printer = spawn_printer(events);

    read_input(&connection, username).await?;

    println!("\nClosing connections...");
    connection.close_all().await;
    printer.abort();

    Ok(())
}

fn spawn_printer(mut events: EventReceiver) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", event);
        }
    })
}

async fn read_input(connection: &Connection, username: &str) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };

                let text = line.trim_end();
                if text.is_empty() {
                    continue;
                }

                match connection.send_message(text).await {
                    Ok(_) => println!("{}: {}", username, text),
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}
