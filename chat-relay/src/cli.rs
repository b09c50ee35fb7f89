use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    codec::Framing,
    config::{self, ClientConfig, ServerConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, forwarding chat between every connected client.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// JSON settings file. Flags given here override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Pending-connection queue length passed to listen(2).
    #[arg(long)]
    pub backlog: Option<u32>,

    #[arg(long, value_enum)]
    pub framing: Option<Framing>,
}

impl ServerArgs {
    /// Loads the settings file (if any), applies the flags, and validates.
    pub fn resolve(&self) -> Result<ServerConfig> {
        let mut config: ServerConfig = config::load(self.config.as_deref())?;
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
        if let Some(framing) = self.framing {
            config.framing = framing;
        }
        config.validate().context("invalid server settings")?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// JSON settings file. Flags given here override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address of the relay to connect to.
    #[arg(long)]
    pub server: Option<SocketAddr>,

    /// Display name announced to the relay. Defaults to a random `User-<n>`.
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long, value_enum)]
    pub framing: Option<Framing>,

    /// Seconds to wait for a connection attempt.
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<u64>,

    /// First reconnect delay in seconds.
    #[arg(long, value_name = "SECS")]
    pub reconnect_base: Option<u64>,

    /// Longest reconnect delay in seconds.
    #[arg(long, value_name = "SECS")]
    pub reconnect_max: Option<u64>,
}

impl ClientArgs {
    pub fn resolve(&self) -> Result<ClientConfig> {
        let mut config: ClientConfig = config::load(self.config.as_deref())?;
        if let Some(server) = self.server {
            config.server = server;
        }
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if let Some(framing) = self.framing {
            config.framing = framing;
        }
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reconnect_base {
            config.reconnect_base = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reconnect_max {
            config.reconnect_max = Duration::from_secs(secs);
        }
        config.validate().context("invalid client settings")?;
        Ok(config)
    }
}
