use std::{net::IpAddr, path::PathBuf};

use clap::Parser;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(version, about = "Flow tagging daemon emitting Firefly packets", long_about = None)]
pub struct Cli {
    /// Set the path to the configuration file (e.g., "flowd.yaml").
    #[arg(short, long, value_name = "FILE", env = "FLOWD_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(short, long, value_name = "LEVEL", env = "FLOWD_LOG_LEVEL")]
    pub log_level: Option<Level>,

    /// Read flow identifiers from this file or named pipe instead of stdin.
    #[arg(short, long, value_name = "PATH")]
    pub source: Option<PathBuf>,

    /// UDP port fireflies are sent to.
    #[arg(long, value_name = "PORT")]
    pub destination_port: Option<u16>,

    /// Send every firefly to this collector instead of the flow destination.
    #[arg(long, value_name = "IP")]
    pub collector: Option<IpAddr>,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser as _;
    use figment::Jail;
    use tracing::Level;

    use super::Cli;

    #[test]
    fn parses_long_flags() {
        Jail::expect_with(|jail| {
            jail.set_env("FLOWD_CONFIG_PATH", "/tmp/flowd.yaml");
            jail.set_env("FLOWD_LOG_LEVEL", "debug");

            let cli = Cli::parse_from([
                "flowd",
                "--config",
                "/path/to/conf.yaml",
                "--log-level",
                "warn",
                "--source",
                "/run/flowd/np",
                "--destination-port",
                "20000",
                "--collector",
                "192.0.2.1",
            ]);
            assert_eq!(cli.config, Some(PathBuf::from("/path/to/conf.yaml")));
            assert_eq!(cli.log_level, Some(Level::WARN));
            assert_eq!(cli.source, Some(PathBuf::from("/run/flowd/np")));
            assert_eq!(cli.destination_port, Some(20000));
            assert_eq!(cli.collector, Some("192.0.2.1".parse().unwrap()));

            Ok(())
        });
    }

    #[test]
    fn parses_from_env_when_no_args() {
        Jail::expect_with(|jail| {
            jail.set_env("FLOWD_CONFIG_PATH", "/tmp/flowd.yaml");
            jail.set_env("FLOWD_LOG_LEVEL", "debug");

            let cli = Cli::parse_from(["flowd"]);
            assert_eq!(cli.config, Some(PathBuf::from("/tmp/flowd.yaml")));
            assert_eq!(cli.log_level, Some(Level::DEBUG));

            Ok(())
        });
    }

    #[test]
    fn everything_is_optional() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["flowd"]);
            assert_eq!(cli.config, None);
            assert_eq!(cli.log_level, None);
            assert_eq!(cli.source, None);
            assert_eq!(cli.destination_port, None);
            assert_eq!(cli.collector, None);

            Ok(())
        });
    }
}
