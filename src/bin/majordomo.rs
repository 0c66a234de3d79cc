use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use majordomo::auth::{generate_operator_key, generate_proxy_key, ProxyResolver, Resolver};
use majordomo::config::{BodyStorage, Config};
use majordomo::models::{CreateApiKeyInput, CreateProxyKeyInput, UpdateApiKeyInput};
use majordomo::pricing::PricingService;
use majordomo::providers::Provider;
use majordomo::proxy::upstream::UpstreamClient;
use majordomo::secrets::SecretBox;
use majordomo::server::{self, AppState};
use majordomo::storage::{self, api_keys, proxy_keys, S3BodyStore, Storage};
use majordomo::MajordomoError;

#[derive(Debug, Parser)]
#[command(name = "majordomo", version, about = "Authenticating reverse proxy for LLM APIs")]
struct Cli {
    /// JSON config file; MAJORDOMO_* environment variables override it.
    #[arg(long, global = true, env = "MAJORDOMO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway.
    Serve,
    /// Manage operator keys.
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
    /// Manage proxy keys and their provider credentials.
    ProxyKeys {
        #[command(subcommand)]
        command: ProxyKeysCommand,
    },
}

#[derive(Debug, Subcommand)]
enum KeysCommand {
    /// Create an operator key; the plaintext is printed once.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    Get {
        id: Uuid,
    },
    Update {
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Revoke {
        id: Uuid,
    },
}

#[derive(Debug, Subcommand)]
enum ProxyKeysCommand {
    /// Create a proxy key owned by an operator key; plaintext printed once.
    Create {
        #[arg(long)]
        owner: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List {
        #[arg(long)]
        owner: Uuid,
    },
    Get {
        id: Uuid,
    },
    Revoke {
        id: Uuid,
    },
    /// Store an encrypted upstream credential for a provider.
    SetProvider {
        id: Uuid,
        provider: String,
        #[arg(long = "key")]
        api_key: String,
    },
    RemoveProvider {
        id: Uuid,
        provider: String,
    },
    ListProviders {
        id: Uuid,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Serve => serve(config).await,
        Command::Keys { command } => run_keys(config, command).await,
        Command::ProxyKeys { command } => run_proxy_keys(config, command).await,
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn serve(config: Config) -> majordomo::Result<()> {
    let secret_box = SecretBox::new(&config.secrets.encryption_key)
        .map_err(|err| MajordomoError::Config(err.to_string()))?;

    let pool = storage::connect(&config.storage.postgres).await?;
    let store = Arc::new(Storage::new(pool.clone(), &config.metadata));

    match store.load_hll_state().await {
        Ok(loaded) if loaded > 0 => tracing::info!(count = loaded, "loaded HLL states"),
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "failed to load HLL state"),
    }

    let s3 = if config.s3.enabled {
        if config.s3.bucket.is_empty() {
            return Err(MajordomoError::Config("s3.bucket is required when s3 is enabled".into()));
        }
        Some(Arc::new(S3BodyStore::new(&config.s3).await?))
    } else {
        if config.logging.body_storage == BodyStorage::S3 {
            tracing::warn!("body storage is s3 but s3 is disabled; bodies will not be archived");
        }
        None
    };

    let pricing = PricingService::start(&config.pricing).await;
    let resolver = Arc::new(Resolver::new(Arc::new(pool.clone())));
    let proxy_resolver = Arc::new(ProxyResolver::new(Arc::new(pool), secret_box.clone()));

    let state = AppState {
        config: Arc::new(config),
        storage: store,
        s3,
        pricing,
        resolver,
        proxy_resolver,
        secret_box,
        upstream: Arc::new(UpstreamClient::new()),
    };

    server::serve(state).await
}

async fn run_keys(config: Config, command: KeysCommand) -> majordomo::Result<()> {
    let pool = storage::connect(&config.storage.postgres).await?;

    match command {
        KeysCommand::Create { name, description } => {
            let (plaintext, digest) = generate_operator_key();
            let input = CreateApiKeyInput { name, description };
            let key = api_keys::create(&pool, &digest, &input).await?;
            println!("{}", pretty(&key)?);
            println!();
            println!("API key (shown once, store it now):");
            println!("  {plaintext}");
        }
        KeysCommand::List => {
            let keys = api_keys::list(&pool).await?;
            println!("{}", pretty(&keys)?);
        }
        KeysCommand::Get { id } => {
            let key = api_keys::get_by_id(&pool, id)
                .await?
                .ok_or_else(|| MajordomoError::Internal("API key not found".into()))?;
            println!("{}", pretty(&key)?);
        }
        KeysCommand::Update { id, name, description } => {
            let input = UpdateApiKeyInput { name, description };
            let key = api_keys::update(&pool, id, &input)
                .await?
                .ok_or_else(|| MajordomoError::Internal("API key not found".into()))?;
            println!("{}", pretty(&key)?);
        }
        KeysCommand::Revoke { id } => {
            if !api_keys::revoke(&pool, id).await? {
                return Err(MajordomoError::Internal(
                    "API key not found or already revoked".into(),
                ));
            }
            println!("revoked {id}");
        }
    }
    Ok(())
}

async fn run_proxy_keys(config: Config, command: ProxyKeysCommand) -> majordomo::Result<()> {
    let pool = storage::connect(&config.storage.postgres).await?;

    match command {
        ProxyKeysCommand::Create { owner, name, description } => {
            let (plaintext, digest) = generate_proxy_key();
            let input = CreateProxyKeyInput { name, description };
            let key = proxy_keys::create(&pool, &digest, owner, &input).await?;
            println!("{}", pretty(&key)?);
            println!();
            println!("Proxy key (shown once, store it now):");
            println!("  {plaintext}");
        }
        ProxyKeysCommand::List { owner } => {
            let keys = proxy_keys::list(&pool, owner).await?;
            println!("{}", pretty(&keys)?);
        }
        ProxyKeysCommand::Get { id } => {
            let key = proxy_keys::get_by_id(&pool, id)
                .await?
                .ok_or_else(|| MajordomoError::Internal("proxy key not found".into()))?;
            println!("{}", pretty(&key)?);
        }
        ProxyKeysCommand::Revoke { id } => {
            if !proxy_keys::revoke(&pool, id).await? {
                return Err(MajordomoError::Internal(
                    "proxy key not found or already revoked".into(),
                ));
            }
            println!("revoked {id}");
        }
        ProxyKeysCommand::SetProvider { id, provider, api_key } => {
            let tag = resolve_provider(&provider)?;
            let secret_box = SecretBox::new(&config.secrets.encryption_key)
                .map_err(|err| MajordomoError::Config(err.to_string()))?;
            let encrypted = secret_box
                .encrypt(&api_key)
                .map_err(|err| MajordomoError::Internal(err.to_string()))?;
            proxy_keys::set_provider_mapping(&pool, id, tag, &encrypted).await?;
            println!("set {tag} credential for {id}");
        }
        ProxyKeysCommand::RemoveProvider { id, provider } => {
            let tag = resolve_provider(&provider)?;
            if !proxy_keys::delete_provider_mapping(&pool, id, tag).await? {
                return Err(MajordomoError::Internal("provider mapping not found".into()));
            }
            println!("removed {tag} credential for {id}");
        }
        ProxyKeysCommand::ListProviders { id } => {
            let mappings = proxy_keys::list_provider_mappings(&pool, id).await?;
            for mapping in mappings {
                println!("{}", mapping.provider);
            }
        }
    }
    Ok(())
}

fn resolve_provider(label: &str) -> majordomo::Result<&'static str> {
    match Provider::from_label(label) {
        Provider::Unknown => Err(MajordomoError::Config(format!("unknown provider: {label}"))),
        provider => Ok(provider.as_str()),
    }
}

fn pretty<T: serde::Serialize>(value: &T) -> majordomo::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
