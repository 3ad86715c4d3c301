use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output the run summary as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Log every request and flush (or set RUST_LOG)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Firebase database name, e.g. `myapp` for https://myapp.firebaseio.com (or via FIREBASE_NAME)
    #[arg(short = 'f', long, env = "FIREBASE_NAME", global = true)]
    pub firebase: Option<String>,

    /// Full database URL, overrides --firebase (or via FIREBASE_URL)
    #[arg(long, env = "FIREBASE_URL", hide_env_values = true, global = true)]
    pub url: Option<String>,

    /// Database secret used to authenticate every request (or via FIREBASE_SECRET)
    #[arg(long, env = "FIREBASE_SECRET", hide_env_values = true, global = true)]
    pub secret: Option<String>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "FIREBAK_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
