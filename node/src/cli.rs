//! # CLI Interface
//!
//! Defines the command-line argument structure for `keel-node` using
//! `clap` derive, and resolves the consensus [`Settings`] a command runs
//! with.
//!
//! Settings come from three layers, later ones winning field by field:
//!
//! 1. the built-in defaults for `--network`,
//! 2. `settings.json` in the data directory, written by `init`,
//! 3. the JSON file passed with `--settings`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use keel_protocol::config::{Network, Settings};

use crate::logging::LogFormat;

/// Name of the persisted settings file inside the data directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Directory under the data directory holding the chain store.
pub const CHAIN_DIR: &str = "chain";

/// Keel full node.
///
/// Maintains a memory-mapped chain store and organizes blocks fed to it
/// into the strongest valid chain.
#[derive(Parser, Debug)]
#[command(
    name = "keel-node",
    about = "Keel chain store and block organizer",
    version,
    propagate_version = true
)]
pub struct KeelNodeCli {
    /// Path to the node data directory.
    #[arg(long, short = 'd', global = true, env = "KEEL_DATA_DIR", default_value = "./keel-data")]
    pub data_dir: PathBuf,

    /// Network whose consensus rules apply: mainnet or regtest.
    #[arg(long, short = 'n', global = true, env = "KEEL_NETWORK", default_value = "regtest")]
    pub network: Network,

    /// Log output format.
    #[arg(long, global = true, env = "KEEL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// JSON file overriding individual settings fields.
    #[arg(long, global = true, env = "KEEL_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the Keel node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the data directory and a chain holding only the genesis block.
    Init,
    /// Organize hex-encoded blocks read line by line from stdin until EOF
    /// or Ctrl+C.
    Run(RunArgs),
    /// Organize every block in a file of hex-encoded blocks, one per line.
    Import(ImportArgs),
    /// Print chain and table statistics as JSON.
    Stat,
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Blocks buffered between the reader and the organizer.
    #[arg(long, env = "KEEL_QUEUE_DEPTH", default_value_t = 256)]
    pub queue_depth: usize,
}

/// Arguments for the `import` subcommand.
#[derive(Parser, Debug)]
pub struct ImportArgs {
    /// File of hex-encoded blocks.
    pub file: PathBuf,
}

impl KeelNodeCli {
    pub fn chain_dir(&self) -> PathBuf {
        self.data_dir.join(CHAIN_DIR)
    }

    /// Resolve the settings for this invocation.
    pub fn load_settings(&self) -> Result<Settings> {
        let mut settings = serde_json::to_value(Settings::for_network(self.network))
            .context("failed to encode default settings")?;

        let stored = self.data_dir.join(SETTINGS_FILE);
        if stored.exists() {
            merge(&mut settings, read_json(&stored)?);
        }
        if let Some(path) = &self.settings {
            merge(&mut settings, read_json(path)?);
        }

        let settings: Settings =
            serde_json::from_value(settings).context("invalid settings after overrides")?;
        if settings.network != self.network {
            bail!(
                "data directory holds a {} chain but --network is {}",
                settings.network,
                self.network
            );
        }
        Ok(settings)
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings from {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse settings in {}", path.display()))
}

/// Recursively overlay `overrides` onto `base`. Objects merge by key,
/// anything else replaces.
fn merge(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        KeelNodeCli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_the_subcommand() {
        let cli = KeelNodeCli::parse_from([
            "keel-node",
            "stat",
            "--network",
            "mainnet",
            "--log-format",
            "json",
            "-d",
            "/tmp/keel",
        ]);
        assert!(matches!(cli.command, Commands::Stat));
        assert_eq!(cli.network, Network::Mainnet);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/keel"));
    }

    #[test]
    fn merge_overlays_nested_fields() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}, "list": [1, 2]});
        merge(&mut base, json!({"nested": {"y": 5}, "list": [3], "b": true}));
        assert_eq!(
            base,
            json!({"a": 1, "nested": {"x": 1, "y": 5}, "list": [3], "b": true})
        );
    }

    #[test]
    fn overrides_file_wins_over_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let overrides = dir.path().join("overrides.json");
        std::fs::write(
            &overrides,
            r#"{"coinbase_maturity": 3, "buckets": {"block": 7}}"#,
        )
        .unwrap();

        let cli = KeelNodeCli::parse_from([
            "keel-node",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--settings",
            overrides.to_str().unwrap(),
            "stat",
        ]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.coinbase_maturity, 3);
        assert_eq!(settings.buckets.block, 7);
        assert_eq!(settings.buckets.spend, Settings::regtest().buckets.spend);
    }

    #[test]
    fn network_mismatch_is_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            serde_json::to_string(&Settings::mainnet()).unwrap(),
        )
        .unwrap();
        let cli = KeelNodeCli::parse_from([
            "keel-node",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "stat",
        ]);
        assert!(cli.load_settings().is_err());
    }
}
