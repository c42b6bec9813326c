// src/cli.rs

use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, time::Duration};

/// Amazon MWAA local runner controller.
///
/// `mwaactl.yaml` (if present) supplies defaults.
/// CLI flags override config values.
#[derive(Parser, Debug)]
#[command(name = "mwaactl", version, disable_help_subcommand = true)]
pub struct Cli {
    /// Path to config file
    ///
    /// Defaults to ./mwaactl.yaml (optional)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// AWS profile used to resolve credentials
    #[arg(long, global = true, env = "AWS_PROFILE")]
    pub profile: Option<String>,

    /// AWS region handed to the containers
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the local runner environment
    #[command(subcommand)]
    Local(LocalCommand),
}

#[derive(Subcommand, Debug)]
pub enum LocalCommand {
    /// Download the local runner files and sample DAGs.
    ///
    /// Refuses to overwrite a non-empty install directory.
    Init {
        /// Release tag
        ///
        /// Example:
        /// --version v2.10.3
        #[arg(long)]
        version: Option<String>,

        /// Repository to download from
        #[arg(long)]
        repo_url: Option<String>,
    },

    /// Build the runner image for the configured version.
    BuildImage,

    /// Start the database and the Airflow runner.
    Start {
        /// Host port for the Airflow UI
        ///
        /// Example:
        /// --port 8081
        #[arg(long)]
        port: Option<u16>,

        /// Wipe the persisted database before starting
        #[arg(long)]
        reset_db: bool,

        #[command(flatten)]
        creds: CredsArgs,

        /// Do not open the Airflow UI in a browser
        #[arg(long)]
        no_browser: bool,

        /// Stream runner logs after startup (Ctrl+C stops the environment)
        #[arg(long)]
        follow_logs: bool,

        /// How long to wait for the webserver
        ///
        /// Example:
        /// --wait 90s
        #[arg(long, value_parser = humantime::parse_duration)]
        wait: Option<Duration>,
    },

    /// Stop all containers of the local environment.
    Stop,

    /// Install requirements.txt in a throwaway container.
    TestRequirements,

    /// Download requirements as wheels into the requirements folder.
    PackageRequirements,

    /// Run startup.sh in a throwaway container.
    TestStartupScript {
        #[command(flatten)]
        creds: CredsArgs,
    },
}

/// Credential passing shared by `start` and `test-startup-script`.
#[derive(Args, Debug, Clone, Default)]
pub struct CredsArgs {
    /// Pass resolved AWS credentials into the containers
    #[arg(long)]
    pub aws_creds: bool,

    /// Assume this role and pass its temporary credentials (implies --aws-creds)
    ///
    /// Example:
    /// --role-arn arn:aws:iam::123456789012:role/airflow
    #[arg(long)]
    pub role_arn: Option<String>,
}

impl CredsArgs {
    pub fn wanted(&self) -> bool {
        self.aws_creds || self.role_arn.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn start_flags_parse() {
        let cli = Cli::try_parse_from([
            "mwaactl", "local", "start", "--port", "8081", "--reset-db", "--role-arn",
            "arn:aws:iam::123456789012:role/x", "--wait", "90s", "--no-browser",
        ])
        .unwrap();

        match cli.command {
            Command::Local(LocalCommand::Start {
                port,
                reset_db,
                creds,
                no_browser,
                follow_logs,
                wait,
            }) => {
                assert_eq!(port, Some(8081));
                assert!(reset_db);
                assert!(creds.wanted());
                assert!(no_browser);
                assert!(!follow_logs);
                assert_eq!(wait, Some(Duration::from_secs(90)));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn bad_wait_is_rejected() {
        assert!(Cli::try_parse_from(["mwaactl", "local", "start", "--wait", "soon"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["mwaactl", "local", "stop", "--region", "eu-west-1", "-v"])
            .unwrap();
        assert_eq!(cli.region.as_deref(), Some("eu-west-1"));
        assert!(cli.verbose);
    }
}
