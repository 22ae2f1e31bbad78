//! Controller entrypoint: resolve configuration, wire the pipeline, run
//! until SIGINT/SIGTERM. Exit code 0 on a clean shutdown, 1 on a fatal
//! configuration or startup error.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use ci_stack_k8s::config::{Config, Overrides};
use ci_stack_k8s::{buildkite, scheduler};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "controller",
    version,
    about = "Run scheduled Buildkite jobs as ephemeral Kubernetes batch jobs"
)]
struct Cli {
    /// Path to a YAML or JSON configuration file
    #[arg(long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Buildkite organization slug
    #[arg(long, env = "ORG")]
    org: Option<String>,

    /// Buildkite GraphQL API token
    #[arg(long, env = "BUILDKITE_TOKEN", hide_env_values = true)]
    buildkite_token: Option<String>,

    /// Name of the secret holding the agent registration token
    #[arg(long, env = "AGENT_TOKEN_SECRET")]
    agent_token_secret: Option<String>,

    /// Namespace to create jobs in
    #[arg(long, env = "NAMESPACE")]
    namespace: Option<String>,

    /// Default container image for job, agent and checkout containers
    #[arg(long, env = "IMAGE")]
    image: Option<String>,

    /// Seconds between queries against the Buildkite job queue
    #[arg(long, env = "POLL_INTERVAL")]
    poll_interval: Option<u64>,

    /// Seconds a finished job is kept before the cluster reaps it
    #[arg(long, env = "JOB_TTL")]
    job_ttl: Option<u64>,

    /// Agent tags (`key=value`), comma separated or repeated
    #[arg(long, env = "TAGS", value_delimiter = ',')]
    tags: Vec<String>,

    /// Maximum number of jobs in flight, 0 for unbounded
    #[arg(long, env = "MAX_IN_FLIGHT")]
    max_in_flight: Option<usize>,

    /// Cluster UUID for clustered organizations
    #[arg(long, env = "CLUSTER_UUID")]
    cluster_uuid: Option<String>,

    /// Seconds an image pull may back off before the job is cancelled
    #[arg(long, env = "IMAGE_PULL_BACKOFF_GRACE_PERIOD")]
    image_pull_backoff_grace_period: Option<u64>,

    /// Fail jobs that carry a kubernetes plugin instead of honouring it
    #[arg(long, env = "PROHIBIT_KUBERNETES_PLUGIN")]
    prohibit_kubernetes_plugin: bool,

    /// Extra variable name patterns to redact from build logs
    #[arg(long, env = "ADDITIONAL_REDACTED_VARS", value_delimiter = ',')]
    additional_redacted_vars: Vec<String>,

    /// Override for the Buildkite GraphQL endpoint
    #[arg(long, env = "GRAPHQL_ENDPOINT")]
    graphql_endpoint: Option<String>,

    /// Enable debug logging
    #[arg(long, env = "DEBUG")]
    debug: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            org: self.org.clone(),
            buildkite_token: self.buildkite_token.clone(),
            agent_token_secret: self.agent_token_secret.clone(),
            namespace: self.namespace.clone(),
            image: self.image.clone(),
            poll_interval: self.poll_interval,
            job_ttl: self.job_ttl,
            tags: (!self.tags.is_empty()).then(|| self.tags.clone()),
            max_in_flight: self.max_in_flight,
            cluster_uuid: self.cluster_uuid.clone(),
            image_pull_backoff_grace_period: self.image_pull_backoff_grace_period,
            prohibit_kubernetes_plugin: self.prohibit_kubernetes_plugin,
            additional_redacted_vars: (!self.additional_redacted_vars.is_empty())
                .then(|| self.additional_redacted_vars.clone()),
            graphql_endpoint: self.graphql_endpoint.clone(),
            debug: self.debug,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::resolve(cli.config.as_deref(), cli.overrides())?;
    config.validate()?;

    let default_filter = if config.debug {
        "info,ci_stack_k8s=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config,
        "starting agent stack controller"
    );

    let kube_client = kube::Client::try_default()
        .await
        .context("failed to initialize the kubernetes client")?;
    let buildkite_client =
        buildkite::Client::new(&config.buildkite_token, config.graphql_endpoint.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    scheduler::run(kube_client, buildkite_client, Arc::new(config), shutdown).await?;

    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
