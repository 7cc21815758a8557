//! oauthkit CLI - authorize against configured providers and inspect stored
//! credentials.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use oauthkit::auth::FileStore;
use oauthkit::config::Config;
use oauthkit::{GrantType, OAuth, Provider, State};

#[derive(Parser)]
#[command(name = "oauthkit")]
#[command(about = "OAuth 2.0 client for configured providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Provider descriptor JSON (overrides config)
    #[arg(long)]
    providers: Option<PathBuf>,

    /// Credential file path (overrides config)
    #[arg(long)]
    credentials: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured providers
    Providers,
    /// Authorize against a provider
    Authorize {
        /// Provider id
        id: String,
        #[arg(long, value_enum, default_value_t = GrantArg::Pkce)]
        grant: GrantArg,
    },
    /// Refresh a stored credential
    Refresh {
        /// Provider id
        id: String,
    },
    /// Show stored credentials
    Status,
    /// Delete every stored credential
    Clear,
    /// Print the Authorization header that would be sent to a URL
    Header { url: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum GrantArg {
    Code,
    Pkce,
    Device,
    ClientCredentials,
}

impl GrantArg {
    fn grant(self) -> GrantType {
        match self {
            Self::Code => GrantType::authorization_code(),
            Self::Pkce => GrantType::pkce(),
            Self::Device => GrantType::DeviceCode,
            Self::ClientCredentials => GrantType::ClientCredentials,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    if let Some(path) = cli.providers {
        config.providers_file = Some(path);
    }
    if let Some(path) = cli.credentials {
        config.engine.credentials_path = Some(path);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.engine.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let providers = config.resolve_providers()?;
    let store = FileStore::open(config.credentials_path()?)
        .context("Failed to open credential store")?;
    info!(path = %store.path().display(), "credential store opened");

    let engine = OAuth::new(providers, config.to_options().with_store(Arc::new(store)));
    engine.restore().await;

    match cli.command {
        Commands::Providers => list_providers(&engine)?,
        Commands::Authorize { id, grant } => {
            let provider = engine.provider(&id)?.clone();
            authorize(&engine, &provider, grant.grant()).await?;
        }
        Commands::Refresh { id } => {
            let provider = engine.provider(&id)?.clone();
            match engine.refresh(&provider).await? {
                Some(credential) => println!("{}: {}", provider.id, describe(&credential)),
                None => println!("{}: no credential", provider.id),
            }
        }
        Commands::Status => status(&engine)?,
        Commands::Clear => {
            engine.clear().await;
            println!("Cleared all credentials for '{}'", engine.application_tag());
        }
        Commands::Header { url } => match engine.injector().authorization_header(&url) {
            Some(header) => println!("Authorization: {}", header),
            None => println!("No credential matches {}", url),
        },
    }

    Ok(())
}

fn list_providers(engine: &OAuth) -> Result<()> {
    let stored = engine.stored_providers()?;
    for provider in engine.providers() {
        let mark = if stored.contains(&provider.id) { "*" } else { " " };
        let device = if provider.device_code_url.is_some() {
            " [device]"
        } else {
            ""
        };
        println!("{} {}{}  {}", mark, provider.id, device, provider.authorization_url);
    }
    Ok(())
}

fn status(engine: &OAuth) -> Result<()> {
    let mut any = false;
    for provider in engine.providers() {
        if let Some(credential) = engine.credential(provider)? {
            println!("{}: {}", provider.id, describe(&credential));
            any = true;
        }
    }
    if !any {
        println!("No stored credentials");
    }
    Ok(())
}

fn describe(credential: &oauthkit::Credential) -> String {
    let expiry = match credential.expiration() {
        Some(exp) if credential.is_expired() => format!("expired {}", exp.to_rfc3339()),
        Some(exp) => format!("expires {}", exp.to_rfc3339()),
        None => "no expiry".to_string(),
    };
    let refresh = if credential.refresh_token().is_some() {
        ", refreshable"
    } else {
        ""
    };
    format!("{} token, {}{}", credential.token.token_type, expiry, refresh)
}

async fn authorize(engine: &OAuth, provider: &Provider, grant: GrantType) -> Result<()> {
    match grant {
        GrantType::ClientCredentials => {
            let credential = engine.request_client_credentials(provider).await?;
            println!("Authorized {}: {}", provider.id, describe(&credential));
            Ok(())
        }
        GrantType::AuthorizationCode { .. } | GrantType::Pkce { .. } => {
            authorize_in_browser(engine, provider, grant).await
        }
        _ => authorize_device(engine, provider).await,
    }
}

async fn authorize_in_browser(engine: &OAuth, provider: &Provider, grant: GrantType) -> Result<()> {
    engine.authorize(provider, grant).await;
    let request = match engine.authorization_request() {
        Some(request) => request,
        None => match engine.state() {
            State::Error(_, e) => bail!("Cannot start authorization: {}", e),
            _ => bail!("Provider {} has no browser authorization", provider.id),
        },
    };

    println!("Open this URL to authorize:\n\n  {}\n", request.url);
    if let Err(e) = open::that(request.url.as_str()) {
        warn!(error = %e, "failed to open browser");
    }
    match request.redirect_uri {
        Some(ref uri) => println!("Paste the URL you were redirected to ({}...):", uri),
        None => bail!("Provider {} has no redirect URI", provider.id),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = lines
        .next_line()
        .await?
        .context("No redirect URL entered")?;
    let url = Url::parse(line.trim()).context("Invalid redirect URL")?;

    match engine.handle_redirect(&url).await? {
        Some(credential) => {
            println!("Authorized {}: {}", provider.id, describe(&credential));
            Ok(())
        }
        None => bail!("URL does not match the redirect URI"),
    }
}

async fn authorize_device(engine: &OAuth, provider: &Provider) -> Result<()> {
    let mut states = engine.subscribe();
    engine.authorize(provider, GrantType::DeviceCode).await;

    loop {
        let state = states.borrow_and_update().clone();
        match state {
            State::ReceivedDeviceCode(_, ref code) => {
                let uri = code
                    .verification_uri_complete
                    .as_deref()
                    .unwrap_or(&code.verification_uri);
                println!("Visit {} and enter code {}", code.verification_uri, code.user_code);
                if let Err(e) = open::that(uri) {
                    warn!(error = %e, "failed to open browser");
                }
            }
            State::Authorized(ref p, ref credential) if p == provider => {
                println!("Authorized {}: {}", provider.id, describe(credential));
                return Ok(());
            }
            State::Error(_, e) => bail!("Authorization failed: {}", e),
            State::Empty => bail!("Device code expired"),
            _ => {}
        }
        states
            .changed()
            .await
            .context("Engine stopped before authorization finished")?;
    }
}
