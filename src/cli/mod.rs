use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "minutier")]
#[command(about = "Turns multi-track voice-meeting recordings into structured minutes", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to the YAML config file
    #[arg(long, default_value = "./config.yaml")]
    pub config: PathBuf,

    /// Override the log level from config (e.g. debug, info, warn)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["minutier"]);
        assert_eq!(cli.config, PathBuf::from("./config.yaml"));
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn overrides() {
        let cli = Cli::parse_from(["minutier", "--config", "/etc/minutier.yaml", "--log-level", "debug"]);
        assert_eq!(cli.config, PathBuf::from("/etc/minutier.yaml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
