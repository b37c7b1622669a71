use clap::Parser;

use std::path::PathBuf;

use ovpn_steward_lib::settings;

/// OpenVPN server supervisor - drives daemon lifecycles for the admin service
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Service configuration file
    #[arg(
        short,
        long,
        env = settings::ENV_VAR,
        default_value = settings::DEFAULT_PATH
    )]
    pub config_path: PathBuf,

    /// Leave configured servers stopped on launch
    #[arg(long)]
    pub no_start: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_with_minimum_arguments() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["ovpn_steward"])?;
        assert_eq!(args.config_path, PathBuf::from(settings::DEFAULT_PATH));
        assert!(!args.no_start);
        Ok(())
    }

    #[test]
    fn accepts_a_config_override() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["ovpn_steward", "-c", "/tmp/steward.toml", "--no-start"])?;
        assert_eq!(args.config_path, PathBuf::from("/tmp/steward.toml"));
        assert!(args.no_start);
        Ok(())
    }
}
