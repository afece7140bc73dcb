//! PeerLink CLI
//!
//! Negotiates a peer connection through a signaling server, then relays
//! stdin lines to the peer and prints what the peer sends.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use peerlink::config::{default_config_path, Config};
use peerlink::{Connection, ConnectionRole};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// PeerLink - signaling-driven peer connections.
#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Negotiate a session and exchange messages over it
    Connect {
        /// Which side of the handshake to play
        #[arg(long, short, value_enum)]
        role: Option<RoleArg>,

        /// Session identifier shared with the peer
        #[arg(long)]
        session_id: Option<String>,

        /// Signaling server URL
        #[arg(long)]
        url: Option<String>,

        /// Seconds to wait for the data channel
        #[arg(long, short)]
        timeout: Option<u64>,

        /// Attach a video source once connected
        #[arg(long)]
        video: bool,

        /// Video device identifier
        #[arg(long)]
        device: Option<String>,
    },

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

/// Handshake role.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleArg {
    /// Wait for the client's offer
    Server,
    /// Send the offer
    Client,
}

impl From<RoleArg> for ConnectionRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Server => ConnectionRole::Server,
            RoleArg::Client => ConnectionRole::Client,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_filter()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    tracing::debug!("Using config file: {:?}", config_path);
    config.apply_env_overrides();

    match cli.command {
        Commands::Connect {
            role,
            session_id,
            url,
            timeout,
            video,
            device,
        } => {
            if let Some(role) = role {
                config.session.role = role.into();
            }
            if let Some(session_id) = session_id {
                config.session.id = session_id;
            }
            if let Some(url) = url {
                config.signaling.url = url;
            }
            if let Some(timeout) = timeout {
                config.session.timeout_secs = timeout;
            }
            if video {
                config.media.enabled = true;
            }
            if let Some(device) = device {
                config.media.device_id = device;
            }
            config.validate()?;

            let code = run_connect(&config).await?;
            std::process::exit(code);
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// Runs one session. Returns the process exit code.
async fn run_connect(config: &Config) -> anyhow::Result<i32> {
    let connection = Connection::from_config(config).await?;
    println!(
        "Session {} as {} via {}",
        connection.session_id(),
        connection.role(),
        config.signaling.url
    );

    let timed_out = match connection.wait_for_client().await {
        Ok(timed_out) => timed_out,
        Err(e) => {
            eprintln!("Negotiation failed ({}): {}", e.category(), e);
            let _ = connection.close().await;
            return Ok(1);
        }
    };

    if timed_out {
        eprintln!(
            "Timed out after {}s waiting for the data channel",
            config.session.timeout_secs
        );
        let _ = connection.close().await;
        return Ok(2);
    }

    println!("Connected. Type a line to send it; Ctrl-D to quit.");
    let result = relay(&connection).await;
    connection.close().await?;
    result.map(|()| 0)
}

/// Sends stdin lines and prints received messages until either side ends.
async fn relay(connection: &Connection) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => connection.send(&line).await?,
                None => break,
            },
            received = connection.receive() => {
                let messages = received?;
                if messages.is_empty() {
                    println!("Peer closed the data channel");
                    break;
                }
                for message in messages {
                    println!("< {}", message);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_connect_defaults() {
        let cli = Cli::try_parse_from(["peerlink", "connect"]).unwrap();
        match cli.command {
            Commands::Connect {
                role,
                session_id,
                url,
                timeout,
                video,
                device,
            } => {
                assert!(role.is_none());
                assert!(session_id.is_none());
                assert!(url.is_none());
                assert!(timeout.is_none());
                assert!(!video);
                assert!(device.is_none());
            }
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_connect_with_all_options() {
        let cli = Cli::try_parse_from([
            "peerlink",
            "connect",
            "--role",
            "client",
            "--session-id",
            "room-1",
            "--url",
            "wss://signal.example.com",
            "--timeout",
            "10",
            "--video",
            "--device",
            "cam0",
        ])
        .unwrap();

        match cli.command {
            Commands::Connect {
                role,
                session_id,
                url,
                timeout,
                video,
                device,
            } => {
                assert_eq!(role, Some(RoleArg::Client));
                assert_eq!(session_id.as_deref(), Some("room-1"));
                assert_eq!(url.as_deref(), Some("wss://signal.example.com"));
                assert_eq!(timeout, Some(10));
                assert!(video);
                assert_eq!(device.as_deref(), Some("cam0"));
            }
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_connect_rejects_unknown_role() {
        let result = Cli::try_parse_from(["peerlink", "connect", "--role", "observer"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::try_parse_from(["peerlink", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::try_parse_from(["peerlink", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "peerlink",
            "connect",
            "--config",
            "/tmp/peerlink.toml",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/peerlink.toml")));
    }

    #[test]
    fn test_role_conversion() {
        assert_eq!(ConnectionRole::from(RoleArg::Server), ConnectionRole::Server);
        assert_eq!(ConnectionRole::from(RoleArg::Client), ConnectionRole::Client);
    }
}
