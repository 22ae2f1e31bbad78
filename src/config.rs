//! Controller configuration.
//!
//! A single immutable [`Config`] drives the whole controller. Values are
//! resolved in precedence order: command-line flag, environment variable,
//! `--config` file (YAML or JSON, kebab-case keys), built-in default.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::agent_tags;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_JOB_TTL_SECONDS: u64 = 600;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 25;
pub const DEFAULT_IMAGE_PULL_BACKOFF_GRACE_PERIOD_SECONDS: u64 = 30;

#[derive(Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Buildkite organization slug.
    pub org: String,

    /// GraphQL API token.
    pub buildkite_token: String,

    /// Name of the Kubernetes secret holding `BUILDKITE_AGENT_TOKEN`.
    pub agent_token_secret: String,

    /// Namespace jobs are created in.
    pub namespace: String,

    /// Default container image for job, agent and checkout containers.
    pub image: String,

    /// Seconds between queries against the scheduled-job queue.
    #[serde(with = "duration_seconds")]
    pub poll_interval: Duration,

    /// Seconds a finished job is kept before the cluster reaps it.
    #[serde(with = "duration_seconds")]
    pub job_ttl: Duration,

    /// Agent tags (`key=value`) this controller serves. At least one required.
    pub tags: Vec<String>,

    /// Maximum number of jobs in flight; 0 means unbounded.
    pub max_in_flight: usize,

    /// Cluster UUID for clustered organizations; empty for unclustered setups.
    pub cluster_uuid: String,

    /// How long an image pull may back off before the job is cancelled.
    #[serde(with = "duration_seconds")]
    pub image_pull_backoff_grace_period: Duration,

    /// Fail jobs that carry a kubernetes plugin instead of honouring it.
    pub prohibit_kubernetes_plugin: bool,

    /// Extra variable name patterns redacted from build logs.
    pub additional_redacted_vars: Vec<String>,

    /// Operator-supplied pod spec patch, applied before any plugin patch.
    pub pod_spec_patch: Option<serde_json::Value>,

    /// Override for the GraphQL endpoint.
    pub graphql_endpoint: Option<String>,

    /// Enable debug logging for the controller.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            org: String::new(),
            buildkite_token: String::new(),
            agent_token_secret: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            image: String::new(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS),
            job_ttl: Duration::from_secs(DEFAULT_JOB_TTL_SECONDS),
            tags: Vec::new(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            cluster_uuid: String::new(),
            image_pull_backoff_grace_period: Duration::from_secs(
                DEFAULT_IMAGE_PULL_BACKOFF_GRACE_PERIOD_SECONDS,
            ),
            prohibit_kubernetes_plugin: false,
            additional_redacted_vars: Vec::new(),
            pod_spec_patch: None,
            graphql_endpoint: None,
            debug: false,
        }
    }
}

/// Values collected from flags and environment, layered over file and
/// defaults by [`Config::resolve`]. `None` means "not given".
#[derive(Debug, Default)]
pub struct Overrides {
    pub org: Option<String>,
    pub buildkite_token: Option<String>,
    pub agent_token_secret: Option<String>,
    pub namespace: Option<String>,
    pub image: Option<String>,
    pub poll_interval: Option<u64>,
    pub job_ttl: Option<u64>,
    pub tags: Option<Vec<String>>,
    pub max_in_flight: Option<usize>,
    pub cluster_uuid: Option<String>,
    pub image_pull_backoff_grace_period: Option<u64>,
    pub prohibit_kubernetes_plugin: bool,
    pub additional_redacted_vars: Option<Vec<String>>,
    pub graphql_endpoint: Option<String>,
    pub debug: bool,
}

impl Config {
    /// Load a configuration file. YAML is a superset of JSON, so both work.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Resolve the effective configuration from an optional file plus
    /// flag/environment overrides.
    pub fn resolve(path: Option<&Path>, overrides: Overrides) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        Ok(config)
    }

    fn apply(&mut self, o: Overrides) {
        if let Some(v) = o.org {
            self.org = v;
        }
        if let Some(v) = o.buildkite_token {
            self.buildkite_token = v;
        }
        if let Some(v) = o.agent_token_secret {
            self.agent_token_secret = v;
        }
        if let Some(v) = o.namespace {
            self.namespace = v;
        }
        if let Some(v) = o.image {
            self.image = v;
        }
        if let Some(v) = o.poll_interval {
            self.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = o.job_ttl {
            self.job_ttl = Duration::from_secs(v);
        }
        if let Some(v) = o.tags {
            if !v.is_empty() {
                self.tags = v;
            }
        }
        if let Some(v) = o.max_in_flight {
            self.max_in_flight = v;
        }
        if let Some(v) = o.cluster_uuid {
            self.cluster_uuid = v;
        }
        if let Some(v) = o.image_pull_backoff_grace_period {
            self.image_pull_backoff_grace_period = Duration::from_secs(v);
        }
        if o.prohibit_kubernetes_plugin {
            self.prohibit_kubernetes_plugin = true;
        }
        if let Some(v) = o.additional_redacted_vars {
            if !v.is_empty() {
                self.additional_redacted_vars = v;
            }
        }
        if let Some(v) = o.graphql_endpoint {
            self.graphql_endpoint = Some(v);
        }
        if o.debug {
            self.debug = true;
        }
    }

    /// Validate required fields. Any failure here is fatal at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.org.is_empty() {
            bail!("org is required");
        }
        if self.buildkite_token.is_empty() {
            bail!("buildkite-token is required");
        }
        if self.agent_token_secret.is_empty() {
            bail!("agent-token-secret is required");
        }
        if self.namespace.is_empty() {
            bail!("namespace is required");
        }
        if self.image.is_empty() {
            bail!("image is required");
        }
        if self.tags.is_empty() {
            bail!("at least one agent tag is required");
        }
        agent_tags::parse(&self.tags).context("invalid agent tag")?;
        Ok(())
    }

    /// Cluster UUID as an optional value; empty string means unclustered.
    pub fn cluster_uuid(&self) -> Option<&str> {
        if self.cluster_uuid.is_empty() {
            None
        } else {
            Some(&self.cluster_uuid)
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("org", &self.org)
            .field("buildkite-token", &"<redacted>")
            .field("agent-token-secret", &self.agent_token_secret)
            .field("namespace", &self.namespace)
            .field("image", &self.image)
            .field("poll-interval", &self.poll_interval)
            .field("job-ttl", &self.job_ttl)
            .field("tags", &self.tags)
            .field("max-in-flight", &self.max_in_flight)
            .field("cluster-uuid", &self.cluster_uuid)
            .field(
                "image-pull-backoff-grace-period",
                &self.image_pull_backoff_grace_period,
            )
            .field(
                "prohibit-kubernetes-plugin",
                &self.prohibit_kubernetes_plugin,
            )
            .field("additional-redacted-vars", &self.additional_redacted_vars)
            .field("pod-spec-patch", &self.pod_spec_patch)
            .field("graphql-endpoint", &self.graphql_endpoint)
            .field("debug", &self.debug)
            .finish()
    }
}

mod duration_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
