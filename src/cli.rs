#![allow(missing_docs)]

use std::path::PathBuf;

use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};

use crate::get_version;

#[derive(Parser, Debug)]
#[command(rename_all = "kebab-case")]
pub struct Opts {
    /// Read configuration from the given TOML file.
    #[arg(
        id = "config",
        short,
        long,
        env = "LOG2CLICKHOUSE_CONFIG",
        default_value = "log2clickhouse.toml"
    )]
    pub config_path: PathBuf,

    /// Exit on startup if the ClickHouse healthcheck fails.
    #[arg(short, long, env = "LOG2CLICKHOUSE_REQUIRE_HEALTHY")]
    pub require_healthy: Option<bool>,

    /// Number of worker threads for the runtime. Defaults to the number of
    /// available CPUs.
    #[arg(short, long, env = "LOG2CLICKHOUSE_THREADS")]
    pub threads: Option<usize>,

    /// Validate the configuration (including grammar and schema compilation)
    /// and exit without starting the pipeline.
    #[arg(long)]
    pub validate: bool,

    /// Enable more detailed internal logging. Repeat to increase level. Overridden by `--quiet`.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Reduce detail of internal logging. Repeat to reduce further. Overrides `--verbose`.
    #[arg(short, long, action = ArgAction::Count)]
    pub quiet: u8,
}

impl Opts {
    pub fn get_matches() -> Result<Self, clap::Error> {
        let version = get_version();
        let app = Opts::command().version(version);
        Opts::from_arg_matches(&app.get_matches())
    }

    pub const fn log_level(&self) -> &'static str {
        match self.quiet {
            0 => match self.verbose {
                0 => "info",
                1 => "debug",
                2..=255 => "trace",
            },
            1 => "warn",
            2 => "error",
            3..=255 => "off",
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Opts;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Opts::command().debug_assert();
    }

    #[test]
    fn log_level_resolution() {
        let mut opts = Opts::try_parse_from(["log2clickhouse"]).unwrap();
        assert_eq!(opts.log_level(), "info");
        opts.verbose = 1;
        assert_eq!(opts.log_level(), "debug");
        opts.quiet = 2;
        assert_eq!(opts.log_level(), "error");
    }
}
