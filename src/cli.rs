//! Command-line surface. Every server flag can also come from a `DLX_*`
//! environment variable; both sit above the config file.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Overrides;

#[derive(Debug, Parser)]
#[command(name = "dlx-orchestrator")]
#[command(about = "Drive the DLX exact-cover solver in batch or interactive mode")]
#[command(version)]
pub struct Cli {
    /// Config file (default: <config dir>/dlx-orchestrator/config.json)
    #[arg(long, global = true, env = "DLX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run batch pipelines, e.g. `execute sudoku --puzzle a.txt sudoku --puzzle b.txt`
    Execute {
        /// Build folder for invocations without their own --build-folder
        #[arg(long, env = "DLX_BUILD_FOLDER")]
        build_folder: Option<PathBuf>,

        /// <pipeline> [options] [<pipeline> [options]]...
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        pipeline_args: Vec<String>,
    },

    /// Start the solver server and solve puzzles read from stdin
    Interactive(ServerArgs),
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Host the solver server listens on
    #[arg(long, env = "DLX_HOST")]
    pub host: Option<String>,

    /// Request port
    #[arg(long, env = "DLX_REQUEST_PORT")]
    pub request_port: Option<u16>,

    /// Solution port
    #[arg(long, env = "DLX_SOLUTION_PORT")]
    pub solution_port: Option<u16>,

    /// Folder containing sudoku_encoder, dlx and sudoku_decoder
    #[arg(long, env = "DLX_BUILD_FOLDER")]
    pub build_folder: Option<PathBuf>,

    /// Run the server from this container image instead of the local build
    #[arg(long, env = "DLX_CONTAINER_IMAGE")]
    pub container_image: Option<String>,

    /// Container runtime binary
    #[arg(long, env = "DLX_CONTAINER_RUNTIME")]
    pub container_runtime: Option<String>,

    /// Container platform override (e.g. linux/amd64)
    #[arg(long, env = "DLX_CONTAINER_PLATFORM")]
    pub platform: Option<String>,

    /// Seconds to wait for the server to accept connections
    #[arg(long, env = "DLX_CONNECT_TIMEOUT_SECS")]
    pub connect_timeout_secs: Option<u64>,

    /// Seconds the server gets to exit before it is killed
    #[arg(long)]
    pub shutdown_grace_secs: Option<u64>,
}

impl From<ServerArgs> for Overrides {
    fn from(args: ServerArgs) -> Self {
        Overrides {
            host: args.host,
            request_port: args.request_port,
            solution_port: args.solution_port,
            build_folder: args.build_folder,
            container_image: args.container_image,
            container_runtime: args.container_runtime,
            platform: args.platform,
            connect_timeout_secs: args.connect_timeout_secs,
            shutdown_grace_secs: args.shutdown_grace_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, ResolvedSettings};
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    fn interactive_overrides(argv: &[&str]) -> Overrides {
        match Cli::try_parse_from(argv).expect("parse").command {
            Commands::Interactive(args) => args.into(),
            Commands::Execute { .. } => panic!("expected interactive"),
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_execute_keeps_pipeline_tokens() {
        let cli = Cli::try_parse_from([
            "dlx-orchestrator",
            "execute",
            "sudoku",
            "--puzzle",
            "a.txt",
            "sudoku",
            "--puzzle",
            "b.txt",
        ])
        .expect("parse");
        match cli.command {
            Commands::Execute { pipeline_args, .. } => assert_eq!(
                pipeline_args,
                vec!["sudoku", "--puzzle", "a.txt", "sudoku", "--puzzle", "b.txt"]
            ),
            Commands::Interactive(_) => panic!("expected execute"),
        }
    }

    /// Precedence is flag, then environment, then file, then default.
    #[test]
    fn test_env_sits_between_flag_and_file() {
        let file: FileConfig =
            serde_json::from_str(r#"{"request_port": 7000, "solution_port": 7100}"#)
                .expect("parse file");

        std::env::set_var("DLX_REQUEST_PORT", "7001");
        let from_env = interactive_overrides(&["dlx-orchestrator", "interactive"]);
        let from_flag = interactive_overrides(&[
            "dlx-orchestrator",
            "interactive",
            "--request-port",
            "7002",
        ]);
        std::env::remove_var("DLX_REQUEST_PORT");
        let from_file = interactive_overrides(&["dlx-orchestrator", "interactive"]);

        let settings = ResolvedSettings::merge(from_env, file.clone());
        assert_eq!(settings.endpoint.request_port, 7001);
        assert_eq!(settings.endpoint.solution_port, 7100);

        let settings = ResolvedSettings::merge(from_flag, file.clone());
        assert_eq!(settings.endpoint.request_port, 7002);

        let settings = ResolvedSettings::merge(from_file, file);
        assert_eq!(settings.endpoint.request_port, 7000);

        let settings = ResolvedSettings::merge(Overrides::default(), FileConfig::default());
        assert_eq!(settings.endpoint.request_port, 5555);
    }
}
