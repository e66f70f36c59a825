use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

use rlhf_mini::cmd;
use rlhf_mini::envconfig::{expand_home, EnvConfig, Host};
use rlhf_mini::runner::{GenerationParams, DEFAULT_MAX_NEW_TOKENS, DEFAULT_TEMPERATURE};

#[derive(Parser)]
#[command(name = "rlhf-mini")]
#[command(version)]
#[command(about = "Serve Qwen2.5-0.5B-Instruct with a DPO LoRA adapter merged in", long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Flags that take precedence over the `RLHF_*` environment.
#[derive(Args)]
struct Overrides {
    /// Listen address, `host:port`
    #[arg(long, global = true)]
    host: Option<String>,
    /// Base model repository id or local directory
    #[arg(long, global = true)]
    base_model: Option<String>,
    /// Adapter repository id or local directory
    #[arg(long, global = true)]
    adapter: Option<String>,
    #[arg(long, global = true)]
    cache_dir: Option<String>,
    #[arg(long, global = true)]
    threads: Option<usize>,
    /// Fixed sampling seed
    #[arg(long, global = true)]
    seed: Option<u64>,
}

impl Overrides {
    fn apply(self, mut config: EnvConfig) -> EnvConfig {
        if let Some(host) = self.host {
            config.host = Host::parse(&host);
        }
        if let Some(base_model) = self.base_model {
            config.base_model = base_model;
        }
        if let Some(adapter) = self.adapter {
            config.adapter = adapter;
        }
        if let Some(dir) = self.cache_dir {
            config.cache_dir = Some(expand_home(&dir));
        }
        if let Some(threads) = self.threads.filter(|&n| n > 0) {
            config.threads = threads;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load the model and serve the web form (default)
    Serve,
    /// Answer one prompt and exit
    Generate {
        prompt: String,
        #[arg(short, long, default_value_t = DEFAULT_TEMPERATURE)]
        temperature: f64,
        #[arg(short = 'n', long, default_value_t = DEFAULT_MAX_NEW_TOKENS)]
        max_new_tokens: usize,
    },
    /// Strip unsupported keys from an adapter config file or directory
    Sanitize { path: PathBuf },
    /// Download the base model and adapter without loading them
    Fetch,
    Version,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = cli.overrides.apply(EnvConfig::from_env());

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd::serve(&config).await,
        Commands::Generate {
            prompt,
            temperature,
            max_new_tokens,
        } => {
            let params = GenerationParams {
                temperature,
                max_new_tokens,
            };
            cmd::generate(&config, &prompt, params).await
        }
        Commands::Sanitize { path } => cmd::sanitize(&path),
        Commands::Fetch => cmd::fetch(&config).await,
        Commands::Version => cmd::version(),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
