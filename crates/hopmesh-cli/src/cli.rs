//! Clap CLI definitions for hopmesh.

use clap::Parser;
use hopmesh_types::config::NodeConfig;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  hopmesh 4044                          Listen on 4044, dial the rendezvous host
  hopmesh 4044 --scan                   Scan the rendezvous port range at start
  hopmesh 4044 10.0.0.2:4001 10.0.0.3:4002
                                        Connect to seed servers first";

/// hopmesh — store-and-forward messaging overlay server.
#[derive(Parser, Debug)]
#[command(
    name = "hopmesh",
    version,
    about = "Store-and-forward messaging overlay server",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// TCP port to listen on.
    pub port: u16,

    /// Seed servers to connect to first (`ip:port`).
    pub seeds: Vec<String>,

    /// Run a full discovery scan at start.
    #[arg(long)]
    pub scan: bool,

    /// Path to config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Group id to announce (overrides config).
    #[arg(long)]
    pub group_id: Option<String>,

    /// Activity log path (overrides config).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Apply command-line values on top of the loaded config.
    pub fn apply(&self, config: &mut NodeConfig) {
        config.listen_port = self.port;
        config.scan_on_start |= self.scan;
        config.seeds.extend(self.seeds.iter().cloned());
        if let Some(group_id) = &self.group_id {
            config.group_id = group_id.clone();
        }
        if let Some(log_file) = &self.log_file {
            config.log_file = Some(log_file.clone());
        }
    }
}
