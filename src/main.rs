use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use wedgie::{AccumulatedResult, ApiClient, ApiError, AuthSettings, ClientConfig, RequestSpec, ResponseBody};

/// wedgie - resilient API client
///
/// Calls an HTTP API with retries, credential refresh and pagination, and
/// prints the result as JSON.
///
/// Settings are read from --config, or from the default config file
/// (<config dir>/wedgie/config.toml) when --base-url is not given.
///
/// Examples:
///   wedgie --base-url https://api.github.com get /repos/owner/repo/releases
///   wedgie -c api.toml post /posts --json '{"title": "hello"}'
#[derive(Parser, Debug)]
#[command(author, version = env!("WEDGIE_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (also via WEDGIE_CONFIG)
    #[arg(
        long,
        short = 'c',
        env = "WEDGIE_CONFIG",
        value_name = "PATH",
        global = true
    )]
    config: Option<PathBuf>,

    /// API base URL, overriding the config file
    #[arg(long = "base-url", env = "WEDGIE_BASE_URL", value_name = "URL", global = true)]
    base_url: Option<String>,

    /// Bearer token, overriding the configured authentication
    #[arg(
        long,
        env = "WEDGIE_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        global = true
    )]
    token: Option<String>,

    /// Log requests and retries
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send a GET request, following pagination
    Get(GetArgs),

    /// Send a POST request with a JSON body
    Post(PostArgs),
}

#[derive(clap::Args, Debug)]
struct GetArgs {
    /// Path relative to the base URL, or an absolute URL
    path: String,

    /// Query parameter, repeatable
    #[arg(short = 'q', long = "query", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    query: Vec<(String, String)>,

    /// Stop after collecting this many results
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Fetch only the first page
    #[arg(long)]
    no_paginate: bool,
}

#[derive(clap::Args, Debug)]
struct PostArgs {
    /// Path relative to the base URL, or an absolute URL
    path: String,

    /// Request body
    #[arg(long, value_name = "JSON")]
    json: Option<String>,

    /// Retry on transient failures even though POST is not idempotent
    #[arg(long)]
    retry: bool,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match (&cli.config, &cli.base_url) {
        (Some(path), _) => ClientConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        (None, Some(base_url)) => ClientConfig::new(base_url.clone()),
        (None, None) => {
            let path = ClientConfig::default_path()
                .context("No config directory; pass --base-url or --config")?;
            ClientConfig::from_file(&path).with_context(|| {
                format!(
                    "Failed to load config from {} (pass --base-url or --config)",
                    path.display()
                )
            })?
        }
    };

    if let Some(base_url) = &cli.base_url {
        config.base_url = base_url.clone();
    }
    if let Some(token) = &cli.token {
        config.auth = AuthSettings::Bearer {
            token: token.clone(),
        };
    }
    Ok(config)
}

fn build_request(command: Commands) -> Result<RequestSpec> {
    let spec = match command {
        Commands::Get(args) => {
            let mut spec = args
                .query
                .into_iter()
                .fold(RequestSpec::get(args.path), |spec, (k, v)| spec.query(k, v));
            if let Some(limit) = args.limit {
                spec = spec.result_limit(limit);
            }
            if args.no_paginate {
                spec = spec.paginate(false);
            }
            spec
        }
        Commands::Post(args) => {
            let mut spec = RequestSpec::post(args.path).retry_unsafe(args.retry);
            if let Some(body) = args.json {
                let body: Value =
                    serde_json::from_str(&body).context("--json is not valid JSON")?;
                spec = spec.json(body);
            }
            spec
        }
    };
    Ok(spec)
}

fn render(result: &AccumulatedResult) -> Result<String> {
    if result.is_paginated() {
        return Ok(serde_json::to_string_pretty(&result.paginated_results)?);
    }
    Ok(match &result.data {
        ResponseBody::Json(value) => serde_json::to_string_pretty(value)?,
        other => other.to_text(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = load_config(&cli)?;
    let client = ApiClient::new(config).context("Invalid client configuration")?;
    let spec = build_request(cli.command)?;
    let call = format!("{} {}", spec.method, spec.target);

    match client.execute(spec).await {
        Ok(result) => {
            println!("{}", render(&result)?);
            Ok(())
        }
        Err(e) => {
            if let ApiError::Pagination {
                partial: Some(partial),
                ..
            } = &e
            {
                println!("{}", render(partial)?);
            }
            Err(e).with_context(|| format!("{} failed", call))
        }
    }
}
