//! CMS API client
//!
//! Command-line front end over the request pipeline:
//! 1. Loads the TOML config and the persisted session
//! 2. Runs one command through `ApiClient` (refreshing the session as needed)
//! 3. Prints the response body to stdout; logs go to stderr
//!
//! Usage: `cms-client [--config PATH] <command> [args]`

mod config;

use anyhow::{Context, Result, bail};
use request_pipeline::{
    ApiClient, ApiResponse, RequestCoalescer, RequestOptions, RequestPipeline,
};
use serde_json::Value;
use session_auth::{
    CredentialPersistence, CredentialStore, FilePersistence, HttpRefresher, MemoryPersistence,
    RefreshCoordinator,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::ReqwestTransport;

use crate::config::Config;

const USAGE: &str = "usage: cms-client [--config PATH] <command>

commands:
  get <path> [key=value ...]      GET with optional query parameters
  delete <path>
  post|put|patch <path> <json>    send a JSON body
  login <path> <json>             exchange credentials for a session
  register <path> <json>          create an account and start its session
  logout                          forget the stored session
  status                          report whether a session is stored";

/// One invocation's work.
#[derive(Debug, PartialEq)]
enum Command {
    Get {
        path: String,
        query: Vec<(String, String)>,
    },
    Delete {
        path: String,
    },
    Send {
        method: &'static str,
        path: String,
        body: Value,
    },
    Login {
        path: String,
        body: Value,
    },
    Register {
        path: String,
        body: Value,
    },
    Logout,
    Status,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            bail!("missing command\n\n{USAGE}");
        };
        let path = || -> Result<String> {
            rest.first()
                .cloned()
                .with_context(|| format!("`{name}` needs a path\n\n{USAGE}"))
        };
        let body = || -> Result<Value> {
            let raw = rest
                .get(1)
                .with_context(|| format!("`{name}` needs a JSON body\n\n{USAGE}"))?;
            serde_json::from_str(raw).with_context(|| format!("body is not valid JSON: {raw}"))
        };

        let command = match name.as_str() {
            "get" => {
                let query = rest
                    .iter()
                    .skip(1)
                    .map(|pair| {
                        pair.split_once('=')
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .with_context(|| format!("query parameter must be key=value: {pair}"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Command::Get {
                    path: path()?,
                    query,
                }
            }
            "delete" => Command::Delete { path: path()? },
            "post" | "put" | "patch" => Command::Send {
                method: match name.as_str() {
                    "post" => "POST",
                    "put" => "PUT",
                    _ => "PATCH",
                },
                path: path()?,
                body: body()?,
            },
            "login" => Command::Login {
                path: path()?,
                body: body()?,
            },
            "register" => Command::Register {
                path: path()?,
                body: body()?,
            },
            "logout" => Command::Logout,
            "status" => Command::Status,
            other => bail!("unknown command `{other}`\n\n{USAGE}"),
        };
        Ok(command)
    }
}

/// Split `--config PATH` out of the arguments.
fn split_config_flag(args: &[String]) -> (Option<&str>, Vec<String>) {
    let mut config_path = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            config_path = iter.next().map(|s| s.as_str());
        } else {
            rest.push(arg.clone());
        }
    }
    (config_path, rest)
}

/// Compose transport, session and pipeline from the config.
fn build_client(config: &Config) -> Result<ApiClient> {
    let transport = Arc::new(ReqwestTransport::default());

    let persistence: Arc<dyn CredentialPersistence> = match &config.auth.credentials_file {
        Some(path) => Arc::new(FilePersistence::new(path)),
        None => Arc::new(MemoryPersistence),
    };
    let store = Arc::new(
        CredentialStore::load(persistence).context("failed to load stored session")?,
    );

    let refresher = Arc::new(
        HttpRefresher::new(transport.clone(), config.refresh_endpoint())
            .with_timeout(config.timeout()),
    );
    let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), refresher));
    let coalescer = Arc::new(RequestCoalescer::new(config.coalesce_window()));

    Ok(ApiClient::new(RequestPipeline::new(
        config.pipeline_config(),
        store,
        coordinator,
        coalescer,
        transport,
    )))
}

/// Run one command. Returns the text to print, if any.
async fn run(client: &ApiClient, command: Command) -> Result<Option<String>> {
    let outcome = match command {
        Command::Get { path, query } => {
            let options = query
                .into_iter()
                .fold(RequestOptions::new(), |options, (k, v)| options.query(k, v));
            client.get(&path, options).await
        }
        Command::Delete { path } => client.delete(&path, RequestOptions::new()).await,
        Command::Send { method, path, body } => match method {
            "POST" => client.post(&path, body, RequestOptions::new()).await,
            "PUT" => client.put(&path, body, RequestOptions::new()).await,
            _ => client.patch(&path, body, RequestOptions::new()).await,
        },
        Command::Login { path, body } => {
            client.login(&path, body).await.context("login failed")?;
            return Ok(Some("logged in".into()));
        }
        Command::Register { path, body } => {
            client
                .register(&path, body)
                .await
                .context("registration failed")?;
            return Ok(Some("registered and logged in".into()));
        }
        Command::Logout => {
            client.logout().context("failed to remove stored session")?;
            return Ok(Some("logged out".into()));
        }
        Command::Status => {
            let status = if client.is_authenticated() {
                "authenticated"
            } else {
                "unauthenticated"
            };
            return Ok(Some(status.into()));
        }
    };

    match outcome {
        Ok(response) => Ok(Some(render_body(&response))),
        Err(e) => {
            if e.kind.ends_session() {
                warn!("session is no longer valid, logging out");
                if let Err(clear_err) = client.logout() {
                    warn!(error = %clear_err, "failed to remove stored session");
                }
            }
            Err(anyhow::Error::new(e).context("request failed"))
        }
    }
}

/// Pretty-print JSON bodies; anything else is returned as-is.
fn render_body(response: &ApiResponse) -> String {
    response
        .json::<Value>()
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| response.body.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cli_config_path, rest) = split_config_flag(&args);
    let command = Command::parse(&rest)?;

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        timeout_secs = config.api.timeout_secs,
        persistent_session = config.auth.credentials_file.is_some(),
        "configuration loaded"
    );

    let client = build_client(&config)?;
    if let Some(output) = run(&client, command).await? {
        println!("{output}");
    }
    Ok(())
}
