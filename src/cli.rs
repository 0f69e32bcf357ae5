//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Edge cache node for a centrally controlled image-distribution network.
#[derive(Debug, Parser)]
#[command(name = "cachenode", version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Compact the on-disk index store and exit.
    #[arg(long)]
    pub shrink_database: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let cli = Cli::parse_from(["cachenode"]);
        assert_eq!(cli.config, PathBuf::from("config.toml"));
        assert!(!cli.shrink_database);
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::parse_from(["cachenode", "--config", "/etc/cachenode.toml", "--shrink-database"]);
        assert_eq!(cli.config, PathBuf::from("/etc/cachenode.toml"));
        assert!(cli.shrink_database);
    }
}
