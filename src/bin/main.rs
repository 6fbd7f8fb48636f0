use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tcpcom::{BindEvent, Connector, Listener, TransportConfig, TransportError};

/// Asynchronous TCP connector and listener
#[derive(Parser)]
#[command(name = "tcpcom")]
#[command(version)]
#[command(about = "Asynchronous TCP connector and listener")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/tcpcom/tcpcom.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept peers and echo back everything they send
    Listen {
        /// Address to bind (default: bind_address from config, 0.0.0.0:0)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Connect to a peer, send a message, and print whatever comes back
    Connect {
        /// Host name or IP address of the peer
        host: String,

        /// Port of the peer
        port: u16,

        /// Message sent once connected
        #[arg(long, default_value = "hello")]
        message: String,

        /// Heartbeat interval in milliseconds (overrides config, 0 disables)
        #[arg(long)]
        heartbeat_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen { bind } => listen(config, bind).await,
        Commands::Connect {
            host,
            port,
            message,
            heartbeat_ms,
        } => connect(config, &host, port, message, heartbeat_ms).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> tcpcom::Result<TransportConfig> {
    match path {
        Some(path) => TransportConfig::load(path),
        None => Ok(TransportConfig::load_user()?.unwrap_or_default()),
    }
}

async fn listen(config: TransportConfig, bind: Option<SocketAddr>) -> tcpcom::Result<()> {
    let listener = Listener::new()?.with_bind_address(bind.unwrap_or(config.bind_address));
    let buffer_size = config.read_buffer_size;
    let read_timeout = config.read_timeout();
    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();

    listener.bind(
        move |event| match event {
            BindEvent::Bound(port) => eprintln!("Listening on port {}", port),
            BindEvent::Failed(e) => {
                let _ = failed_tx.send(e);
            }
        },
        move |key, channel| {
            eprintln!("Peer connected: {}", key);
            let lost = key.clone();
            channel.set_on_disconnected_listener(move || eprintln!("Peer disconnected: {}", lost));

            let echo = channel.clone();
            let started = channel.start_receive(buffer_size, read_timeout, move |bytes| {
                echo.send(bytes.to_vec(), |_| {});
            });
            if let Err(e) = started {
                log::warn!(target: "tcpcom::cli", "Could not read from {}: {}", key, e);
            }
        },
    );

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        Some(e) = failed_rx.recv() => Err(e),
    };
    listener.unbind_all();
    outcome
}

async fn connect(
    config: TransportConfig,
    host: &str,
    port: u16,
    message: String,
    heartbeat_ms: Option<u64>,
) -> tcpcom::Result<()> {
    let connector = Connector::new()?;
    let (result_tx, result_rx) = oneshot::channel();
    let id = connector.connect(host, port, config.connect_timeout(), move |result| {
        let _ = result_tx.send(result);
    });

    // The callback only goes unsent if the attempt was torn down
    let connected = result_rx.await.map_err(|_| TransportError::Disconnected)??;
    eprintln!("Connected from local port {}", connected.local_port);
    let channel = connected.channel;

    let (lost_tx, lost_rx) = oneshot::channel();
    channel.set_on_disconnected_listener(move || {
        let _ = lost_tx.send(());
    });
    channel.start_receive(config.read_buffer_size, config.read_timeout(), |bytes| {
        println!("{}", String::from_utf8_lossy(bytes));
    })?;

    if let Some(interval) = heartbeat_interval(heartbeat_ms, &config) {
        channel.trigger_heart(interval, config.heartbeat_payload.clone())?;
    }

    channel.send(message.into_bytes(), |result| {
        if let Err(e) = result {
            log::warn!(target: "tcpcom::cli", "Send failed: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => eprintln!("Interrupted"),
        _ = lost_rx => eprintln!("Disconnected by peer"),
    }
    connector.disconnect(id);
    Ok(())
}

/// Heartbeat period from the command line, else from config. Zero disables.
fn heartbeat_interval(cli_ms: Option<u64>, config: &TransportConfig) -> Option<Duration> {
    match cli_ms {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => config.heartbeat_interval(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_heartbeat(ms: u64) -> TransportConfig {
        TransportConfig {
            heartbeat_interval_ms: ms,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn zero_heartbeat_flag_disables_heartbeat() {
        assert_eq!(heartbeat_interval(Some(0), &config_with_heartbeat(500)), None);
    }

    #[test]
    fn heartbeat_flag_overrides_config() {
        assert_eq!(
            heartbeat_interval(Some(250), &config_with_heartbeat(500)),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn heartbeat_falls_back_to_config() {
        assert_eq!(
            heartbeat_interval(None, &config_with_heartbeat(500)),
            Some(Duration::from_millis(500))
        );
        assert_eq!(heartbeat_interval(None, &config_with_heartbeat(0)), None);
    }
}
