//! Edge Gateway CLI entry point.
//!
//! `serve` runs the gateway with endpoints from the config file and the
//! optional admin API. `run` serves a single artifact locally, routing
//! every path to it. `endpoint` and `deploy` drive a running gateway's
//! admin API.

mod client;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use edge_gateway_common::{ConfigFile, DeployId, EndpointId, Runtime};
use edge_gateway_server::{AdminRouterConfig, GatewayServer, ServerConfig};

use crate::client::AdminClient;

#[derive(Debug, Parser)]
#[command(name = "edge-gateway", version, about = "Run edge functions in WebAssembly sandboxes")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "EDGE_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Address to listen on; overrides the config file.
        #[arg(long, env = "BIND_ADDR")]
        bind: Option<SocketAddr>,
    },
    /// Serve one artifact locally; every path invokes it.
    Run {
        /// Compiled module (go) or script (js).
        artifact: PathBuf,

        /// Guest runtime of the artifact.
        #[arg(long, default_value = "go")]
        runtime: Runtime,

        /// Environment variable for the guest, as KEY=VALUE. Repeatable.
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: SocketAddr,
    },
    /// Manage endpoints on a running gateway.
    Endpoint {
        #[command(flatten)]
        admin: AdminArgs,

        #[command(subcommand)]
        action: EndpointAction,
    },
    /// Upload an artifact as an endpoint's new active deploy.
    Deploy {
        #[command(flatten)]
        admin: AdminArgs,

        /// Endpoint to deploy to.
        endpoint: String,

        /// Compiled module (go) or script (js).
        artifact: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum EndpointAction {
    /// Create an endpoint.
    Create {
        name: String,

        /// Explicit endpoint id; generated by the gateway when omitted.
        #[arg(long)]
        id: Option<String>,

        #[arg(long, default_value = "go")]
        runtime: Runtime,

        /// Environment variable for the guest, as KEY=VALUE. Repeatable.
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },
    /// List endpoints.
    List,
    /// Make an earlier deploy active again.
    Rollback {
        endpoint: String,
        deploy: String,
    },
}

/// Where the admin API lives and how to authenticate.
#[derive(Debug, Args)]
struct AdminArgs {
    /// Admin API base URL, including its prefix.
    #[arg(
        long,
        global = true,
        env = "EDGE_GATEWAY_ADMIN_URL",
        default_value = "http://127.0.0.1:8080/admin"
    )]
    admin_url: String,

    /// Admin token sent as X-Admin-Token.
    #[arg(long, global = true, env = "EDGE_GATEWAY_ADMIN_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl AdminArgs {
    fn client(&self) -> anyhow::Result<AdminClient> {
        let Some(token) = &self.token else {
            bail!("An admin token is required (--token or EDGE_GATEWAY_ADMIN_TOKEN)");
        };
        Ok(AdminClient::new(&self.admin_url, token.clone()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    match cli.command {
        Command::Serve { bind } => serve(config, bind).await,
        Command::Run {
            artifact,
            runtime,
            env,
            bind,
        } => run_local(config, &artifact, runtime, env.into_iter().collect(), bind).await,
        Command::Endpoint { admin, action } => manage_endpoint(&admin.client()?, action).await,
        Command::Deploy {
            admin,
            endpoint,
            artifact,
        } => {
            let file_name = artifact
                .file_name()
                .map_or_else(|| "artifact".to_string(), |name| name.to_string_lossy().into_owned());
            let deploy = admin
                .client()?
                .deploy(&EndpointId::new(endpoint), &file_name, read_artifact(&artifact)?)
                .await?;
            print_json(&deploy)
        }
    }
}

async fn manage_endpoint(client: &AdminClient, action: EndpointAction) -> anyhow::Result<()> {
    let result = match action {
        EndpointAction::Create {
            name,
            id,
            runtime,
            env,
        } => {
            let id = id.map(EndpointId::new);
            client
                .create_endpoint(id.as_ref(), &name, runtime, &env.into_iter().collect())
                .await?
        }
        EndpointAction::List => client.list_endpoints().await?,
        EndpointAction::Rollback { endpoint, deploy } => {
            client
                .rollback(&EndpointId::new(endpoint), &DeployId::new(deploy))
                .await?
        }
    };
    print_json(&result)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,edge_gateway=debug"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn serve(config: ConfigFile, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    let mut server_config =
        ServerConfig::try_from(&config.server).context("Invalid [server] section")?;
    if let Some(addr) = bind {
        server_config = server_config.with_bind_addr(addr);
    }

    info!(bind_addr = %server_config.bind_addr, "Starting Edge Gateway");

    let mut server = GatewayServer::new(&config.runtime, server_config)
        .context("Failed to initialize runtime")?;

    for entry in &config.endpoints {
        let artifact = read_artifact(Path::new(&entry.path))?;
        let (endpoint, deploy) = server
            .state()
            .provision(&entry.name, entry.runtime, entry.env.clone(), artifact)
            .with_context(|| format!("Failed to provision endpoint '{}'", entry.name))?;
        info!(
            endpoint_id = %endpoint.id,
            deploy_id = %deploy.id,
            runtime = %endpoint.runtime,
            "Endpoint provisioned"
        );
    }

    if config.admin.is_configured() {
        info!(prefix = %config.admin.prefix, "Admin API enabled");
        server = server.with_admin(AdminRouterConfig {
            prefix: config.admin.prefix.clone(),
            token: config.admin.token.clone().unwrap_or_default(),
        });
    } else if config.admin.enabled {
        bail!("[admin] is enabled but no token is set");
    }

    info!("Available endpoints:");
    info!("  ANY  /functions/:endpoint_id[/*path]  - Invoke endpoint");
    info!("  GET  /health                          - Health check");
    info!("  GET  /ready                           - Readiness check");
    info!("  GET  /modules                         - List cached modules");

    server.run().await?;
    Ok(())
}

async fn run_local(
    config: ConfigFile,
    artifact: &Path,
    runtime: Runtime,
    env: BTreeMap<String, String>,
    bind: SocketAddr,
) -> anyhow::Result<()> {
    let server_config = ServerConfig::try_from(&config.server)
        .context("Invalid [server] section")?
        .with_bind_addr(bind);

    let server = GatewayServer::new(&config.runtime, server_config)
        .context("Failed to initialize runtime")?;

    let endpoint_id = EndpointId::new("local");
    server
        .state()
        .provision(endpoint_id.as_str(), runtime, env, read_artifact(artifact)?)
        .context("Failed to deploy artifact")?;

    info!(
        artifact = %artifact.display(),
        runtime = %runtime,
        "Serving artifact at http://{bind}/"
    );

    server.local(endpoint_id).run().await?;
    Ok(())
}

fn read_artifact(path: &Path) -> anyhow::Result<Bytes> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read artifact {}", path.display()))?;
    Ok(Bytes::from(bytes))
}

/// Parse a `KEY=VALUE` pair.
fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("GREETING=hi").unwrap(),
            ("GREETING".to_string(), "hi".to_string())
        );
        assert_eq!(
            parse_env_pair("URL=a=b").unwrap(),
            ("URL".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_env_pair("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_env_pair("novalue").is_err());
        assert!(parse_env_pair("=value").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "edge-gateway",
            "run",
            "guest.wasm",
            "--runtime",
            "js",
            "--env",
            "A=1",
            "--env",
            "B=2",
        ])
        .unwrap();

        match cli.command {
            Command::Run {
                runtime, env, bind, ..
            } => {
                assert_eq!(runtime, Runtime::Js);
                assert_eq!(env.len(), 2);
                assert_eq!(bind.port(), 3000);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_env() {
        let result = Cli::try_parse_from(["edge-gateway", "run", "guest.wasm", "--env", "oops"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::try_parse_from([
            "edge-gateway",
            "--log-format",
            "json",
            "serve",
            "--bind",
            "127.0.0.1:9000",
        ])
        .unwrap();

        assert!(matches!(cli.log_format, LogFormat::Json));
        assert!(matches!(
            cli.command,
            Command::Serve { bind: Some(addr) } if addr.port() == 9000
        ));
    }

    #[test]
    fn test_cli_parses_endpoint_create() {
        let cli = Cli::try_parse_from([
            "edge-gateway",
            "endpoint",
            "--token",
            "secret",
            "create",
            "hello",
            "--id",
            "hello",
            "--runtime",
            "js",
            "--env",
            "A=1",
        ])
        .unwrap();

        match cli.command {
            Command::Endpoint {
                admin,
                action:
                    EndpointAction::Create {
                        name,
                        id,
                        runtime,
                        env,
                    },
            } => {
                assert_eq!(admin.token.as_deref(), Some("secret"));
                assert_eq!(admin.admin_url, "http://127.0.0.1:8080/admin");
                assert_eq!(name, "hello");
                assert_eq!(id.as_deref(), Some("hello"));
                assert_eq!(runtime, Runtime::Js);
                assert_eq!(env, [("A".to_string(), "1".to_string())]);
            }
            other => panic!("expected endpoint create, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_deploy_and_rollback() {
        let cli = Cli::try_parse_from([
            "edge-gateway",
            "deploy",
            "api",
            "guest.wasm",
            "--admin-url",
            "http://gw:9000/ops",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Deploy { ref endpoint, ref admin, .. }
                if endpoint == "api" && admin.admin_url == "http://gw:9000/ops"
        ));

        let cli =
            Cli::try_parse_from(["edge-gateway", "endpoint", "rollback", "api", "d-1"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Endpoint { action: EndpointAction::Rollback { ref deploy, .. }, .. }
                if deploy == "d-1"
        ));
    }

    #[test]
    fn test_admin_commands_need_a_token() {
        let args = AdminArgs {
            admin_url: "http://127.0.0.1:8080/admin".into(),
            token: None,
        };
        assert!(args.client().is_err());
    }
}
