use clap::Parser;
use std::path::PathBuf;

use crate::config::{Config, Environment};

#[derive(Parser, Debug)]
#[command(name = "hostwatch-daemon", version, about = "Host telemetry and process-watch agent")]
pub struct Cli {
    /// Config file; defaults to config.toml in the application directory.
    #[arg(short, long, env = "HOSTWATCH_CONFIG")]
    pub config: Option<PathBuf>,
    /// Deployment environment selecting the service endpoint preset.
    #[arg(short, long, env = "APP_ENV")]
    pub environment: Option<String>,
    /// Subject identifier for first-run setup without a prompt.
    #[arg(long)]
    pub subject_id: Option<String>,
    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    pub print_config: bool,
}

impl Cli {
    /// Applies command-line overrides on top of the loaded file. Returns the
    /// environment name when it was not recognized and production was used.
    pub fn apply(&self, cfg: &mut Config) -> Option<&str> {
        let name = self.environment.as_deref()?;
        match Environment::parse(name) {
            Some(env) => {
                cfg.agent.environment = env;
                None
            }
            None => {
                cfg.agent.environment = Environment::Production;
                Some(name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_flag_overrides_file() {
        let cli = Cli::try_parse_from(["hostwatch-daemon", "--environment", "development"]).unwrap();
        let mut cfg = Config::default();
        cfg.agent.environment = Environment::Production;
        assert_eq!(cli.apply(&mut cfg), None);
        assert_eq!(cfg.agent.environment, Environment::Development);
        assert_eq!(cfg.api_base(), "http://localhost:4000");
    }

    #[test]
    fn unknown_environment_is_handed_back() {
        let cli = Cli::try_parse_from(["hostwatch-daemon", "--environment", "staging"]).unwrap();
        let mut cfg = Config::default();
        cfg.agent.environment = Environment::Development;
        assert_eq!(cli.apply(&mut cfg), Some("staging"));
        assert_eq!(cfg.agent.environment, Environment::Production);
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::try_parse_from([
            "hostwatch-daemon",
            "--config",
            "/tmp/agent.toml",
            "--subject-id",
            "sub-9",
            "--print-config",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/agent.toml")));
        assert_eq!(cli.subject_id.as_deref(), Some("sub-9"));
        assert!(cli.print_config);
    }
}
