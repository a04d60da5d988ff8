use clap::{Args, Parser, Subcommand, ValueEnum};

/// Kiln - Monorepo task runner with output caching
///
/// Kiln reads a turbo.json pipeline, runs package scripts in dependency
/// order and replays tasks whose inputs were seen before from a local or
/// remote cache.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author = "Kiln Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Monorepo task runner with local and remote output caching", long_about = None)]
pub struct Cli {
    /// Log level (trace|debug|info|warn|error)
    #[arg(long, global = true, env = "KILN_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run tasks across the workspace
    Run(RunArgs),

    /// Inspect and manage the local task cache
    Cache(CacheArgs),

    /// Run a remote cache server
    Serve(ServeArgs),

    /// Configuration management utilities
    Config(ConfigArgs),

    /// Print the task graph
    Graph(GraphArgs),
}

/// Cache location and remote cache settings shared by `run` and `cache`
#[derive(Args, Debug, Clone, Default)]
pub struct CacheConfigArgs {
    /// Config file path (kiln.toml)
    #[arg(short = 'c', long, global = true, env = "KILN_CONFIG")]
    pub config: Option<String>,

    /// Local cache directory
    #[arg(long, global = true, env = "KILN_CACHE_DIR")]
    pub cache_dir: Option<String>,

    /// Remote cache base URL
    #[arg(long, global = true, env = "KILN_API")]
    pub api: Option<String>,

    /// Remote cache bearer token
    #[arg(long, global = true, env = "KILN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Remote cache team (sent as teamId when prefixed with "team_", else slug)
    #[arg(long, global = true, env = "KILN_TEAM")]
    pub team: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DryRunFormat {
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Tasks to run (`build`, `web#build`)
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Package selector (name glob, `name...`, `...name`, `./dir`, `!name`)
    #[arg(long = "filter", short = 'F')]
    pub filter: Vec<String>,

    /// Run only the requested tasks, not their dependencies
    #[arg(long)]
    pub only: bool,

    /// Ignore existing cache entries and execute every task
    #[arg(long, env = "KILN_FORCE")]
    pub force: bool,

    /// Do not write results to the cache
    #[arg(long)]
    pub no_cache: bool,

    /// Use only the remote cache
    #[arg(long, env = "KILN_REMOTE_ONLY")]
    pub remote_only: bool,

    /// Ignore task dependencies and run everything at once
    #[arg(long)]
    pub parallel: bool,

    /// Keep running independent tasks after a failure
    #[arg(long = "continue")]
    pub continue_on_error: bool,

    /// Max concurrent tasks: a number or a percentage of CPUs ("50%")
    #[arg(long, env = "KILN_CONCURRENCY")]
    pub concurrency: Option<String>,

    /// Output mode (full|hash-only|new-only|errors-only|none)
    #[arg(long, env = "KILN_OUTPUT_LOGS")]
    pub output_logs: Option<String>,

    /// Show what would run without executing
    #[arg(long, value_enum, num_args = 0..=1, require_equals = true, default_missing_value = "text")]
    pub dry_run: Option<DryRunFormat>,

    /// Write a JSON run summary to .kiln/runs/
    #[arg(long, env = "KILN_SUMMARIZE")]
    pub summarize: bool,

    #[command(flatten)]
    pub cache: CacheConfigArgs,

    /// Arguments passed to the requested tasks' scripts
    #[arg(last = true)]
    pub passthrough: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(flatten)]
    pub cache: CacheConfigArgs,

    #[command(subcommand)]
    pub command: CacheCommands,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show whether tasks would hit the cache
    Status {
        /// Tasks to check
        #[arg(required = true)]
        tasks: Vec<String>,

        /// Package selector
        #[arg(long = "filter", short = 'F')]
        filter: Vec<String>,
    },

    /// List cache entries
    List {
        /// Show details per entry
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show cache statistics
    Stats,

    /// Remove cache entries
    Clean {
        /// Remove a single entry
        hash: Option<String>,

        /// Remove every entry
        #[arg(long)]
        all: bool,

        /// Remove entries older than this (e.g., "7d"); defaults to cache.max_age
        #[arg(long)]
        older_than: Option<String>,
    },
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Config file path (kiln.toml)
    #[arg(short = 'c', long, env = "KILN_CONFIG")]
    pub config: Option<String>,

    /// Address to listen on
    #[arg(long, env = "KILN_SERVE_BIND", default_value = "0.0.0.0:3000")]
    pub bind: String,

    /// Artifact storage directory
    #[arg(long, env = "KILN_SERVE_DIR")]
    pub dir: Option<String>,

    /// Require this bearer token on artifact requests
    #[arg(long, env = "KILN_SERVE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Largest accepted artifact (e.g., "512MB")
    #[arg(long, env = "KILN_SERVE_MAX_ARTIFACT_SIZE", default_value = "512MB")]
    pub max_artifact_size: String,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate a kiln.toml file
    Validate {
        /// Path to config file
        path: String,
    },

    /// Print an example kiln.toml
    Example,

    /// Show the effective configuration
    Show {
        /// Config file path (discovered when omitted)
        #[arg(short = 'c', long)]
        config: Option<String>,
    },
}

#[derive(Parser, Debug)]
pub struct GraphArgs {
    /// Tasks to include
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Package selector
    #[arg(long = "filter", short = 'F')]
    pub filter: Vec<String>,

    /// Only the requested tasks, not their dependencies
    #[arg(long)]
    pub only: bool,

    /// Print Graphviz DOT instead of a list
    #[arg(long)]
    pub dot: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_passthrough() {
        let cli = Cli::try_parse_from([
            "kiln", "run", "build", "test", "--filter", "web...", "--", "--watch",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.tasks, vec!["build", "test"]);
        assert_eq!(args.filter, vec!["web..."]);
        assert_eq!(args.passthrough, vec!["--watch"]);
        assert!(args.dry_run.is_none());
    }

    #[test]
    fn test_parse_dry_run_forms() {
        let cli = Cli::try_parse_from(["kiln", "run", "build", "--dry-run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.dry_run, Some(DryRunFormat::Text));

        let cli = Cli::try_parse_from(["kiln", "run", "build", "--dry-run=json"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.dry_run, Some(DryRunFormat::Json));
    }

    #[test]
    fn test_parse_cache_clean() {
        let cli = Cli::try_parse_from(["kiln", "cache", "clean", "--older-than", "7d"]).unwrap();
        let Commands::Cache(args) = cli.command else {
            panic!("expected cache command");
        };
        match args.command {
            CacheCommands::Clean {
                hash,
                all,
                older_than,
            } => {
                assert!(hash.is_none());
                assert!(!all);
                assert_eq!(older_than.as_deref(), Some("7d"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["kiln", "serve"]).unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        assert_eq!(args.bind, "0.0.0.0:3000");
        assert_eq!(args.max_artifact_size, "512MB");
    }

    #[test]
    fn test_run_requires_task() {
        assert!(Cli::try_parse_from(["kiln", "run"]).is_err());
    }
}
