//! Transforms a scheduled Buildkite job into a Kubernetes batch Job.
//!
//! The transform is pure: job descriptor + parsed plugins + configuration in,
//! Job manifest out. User-supplied container commands are never executed
//! directly; they are captured into `BUILDKITE_COMMAND` and every container
//! runs the agent binary in bootstrap mode instead, so the agent owns the
//! lifecycle of the command.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvFromSource, EnvVar, EnvVarSource, ObjectFieldSelector,
    PodSpec, PodTemplateSpec, SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::patch;
use crate::agent_tags::{self, AgentTag};
use crate::buildkite::CommandJob;
use crate::config::Config;

pub const JOB_NAME_PREFIX: &str = "ci-";
pub const JOB_UUID_LABEL: &str = "job-uuid";
pub const BUILD_URL_ANNOTATION: &str = "build-url";
pub const JOB_URL_ANNOTATION: &str = "job-url";
pub const AGENT_CONTAINER_NAME: &str = "agent";

/// Plugin key whose value customises the generated pod.
const KUBERNETES_PLUGIN_KEY: &str =
    "github.com/buildkite-plugins/kubernetes-buildkite-plugin";

const AGENT_TOKEN_KEY: &str = "BUILDKITE_AGENT_TOKEN";
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 60;

/// Public image used for failure jobs. The configured image may be private or
/// unpullable; the failure job must still run so the user sees the reason.
pub const FAILURE_JOB_IMAGE: &str = "ghcr.io/buildkite/agent:3";

/// Variable name patterns the agent redacts from build logs by default.
const DEFAULT_REDACTED_VARS: &[&str] = &[
    "*_PASSWORD",
    "*_SECRET",
    "*_TOKEN",
    "*_ACCESS_KEY",
    "*_SECRET_KEY",
    "*_PRIVATE_KEY",
    "*_CONNECTION_STRING",
];

/// Job name is a pure function of the job uuid.
pub fn job_name(uuid: &str) -> String {
    format!("{JOB_NAME_PREFIX}{uuid}")
}

/// Inverse of [`job_name`].
pub fn job_uuid_from_name(name: &str) -> Option<&str> {
    name.strip_prefix(JOB_NAME_PREFIX)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("failed parsing plugins: {0}")]
    PluginParse(String),

    #[error("found invalid plugin: {0}")]
    InvalidPlugin(String),

    #[error("failed parsing kubernetes plugin: {0}")]
    KubernetesPluginParse(String),

    #[error("the kubernetes plugin is prohibited by this agent stack")]
    ProhibitedPlugin,

    #[error("failed to apply pod spec patch from the controller configuration: {0}")]
    ControllerPatch(String),

    #[error("failed to apply pod spec patch from the kubernetes plugin: {0}")]
    PluginPatch(String),

    #[error("failed to serialize plugins: {0}")]
    Serialization(String),
}

/// Pod customisation carried by the kubernetes plugin entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesPlugin {
    #[serde(default)]
    pub pod_spec: Option<PodSpec>,
    #[serde(default)]
    pub pod_spec_patch: Option<Value>,
    #[serde(default)]
    pub git_env_from: Vec<EnvFromSource>,
    #[serde(default)]
    pub sidecars: Vec<Container>,
    #[serde(default)]
    pub metadata: PluginMetadata,
    #[serde(default)]
    pub extra_volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginMetadata {
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Builder for one job. Construct, [`parse_plugins`](Self::parse_plugins),
/// then [`build`](Self::build); parse failures are deferred so the caller can
/// still synthesise a failure job from the same builder.
pub struct JobBuilder<'a> {
    job: &'a CommandJob,
    cfg: &'a Config,
    env: BTreeMap<String, String>,
    k8s_plugin: KubernetesPlugin,
    other_plugins: Vec<Map<String, Value>>,
    parse_err: Option<BuildError>,
}

impl<'a> JobBuilder<'a> {
    pub fn new(job: &'a CommandJob, cfg: &'a Config) -> Self {
        Self {
            job,
            cfg,
            env: BTreeMap::new(),
            k8s_plugin: KubernetesPlugin::default(),
            other_plugins: Vec::new(),
            parse_err: None,
        }
    }

    /// Split the job environment and pull apart its `BUILDKITE_PLUGINS`
    /// entry: the kubernetes plugin becomes structured configuration, every
    /// other plugin is kept verbatim for the in-pod agent.
    pub fn parse_plugins(mut self) -> Self {
        for entry in &self.job.env {
            let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            self.env.insert(name.to_string(), value.to_string());
        }

        let Some(plugins_json) = self.env.get("BUILDKITE_PLUGINS") else {
            return self;
        };
        let plugins: Vec<Map<String, Value>> = match serde_json::from_str(plugins_json) {
            Ok(plugins) => plugins,
            Err(err) => {
                debug!(json = %plugins_json, "invalid plugin spec");
                self.parse_err = Some(BuildError::PluginParse(err.to_string()));
                return self;
            }
        };

        for plugin in plugins {
            if plugin.len() != 1 {
                self.parse_err =
                    Some(BuildError::InvalidPlugin(Value::Object(plugin).to_string()));
                return self;
            }
            if let Some(value) = plugin.get(KUBERNETES_PLUGIN_KEY) {
                if self.cfg.prohibit_kubernetes_plugin {
                    self.parse_err = Some(BuildError::ProhibitedPlugin);
                    return self;
                }
                match serde_json::from_value(value.clone()) {
                    Ok(parsed) => self.k8s_plugin = parsed,
                    Err(err) => {
                        self.parse_err =
                            Some(BuildError::KubernetesPluginParse(err.to_string()));
                        return self;
                    }
                }
            } else {
                self.other_plugins.push(plugin);
            }
        }
        self
    }

    pub fn build(&self, skip_checkout: bool) -> Result<Job, BuildError> {
        if let Some(err) = &self.parse_err {
            return Err(err.clone());
        }

        let mut pod_spec = match &self.k8s_plugin.pod_spec {
            Some(spec) => spec.clone(),
            None => PodSpec {
                containers: vec![Container {
                    image: Some(self.cfg.image.clone()),
                    command: Some(vec![self.job.command.clone()]),
                    ..Container::default()
                }],
                ..PodSpec::default()
            },
        };

        let (labels, annotations) = self.metadata();

        let env = self.shared_env()?;
        let container_env = self.container_env(&env);

        let mut volume_mounts = vec![VolumeMount {
            name: "workspace".to_string(),
            mount_path: "/workspace".to_string(),
            ..VolumeMount::default()
        }];
        volume_mounts.extend(self.k8s_plugin.extra_volume_mounts.iter().cloned());

        let system_container_count = usize::from(!skip_checkout);

        for (i, container) in pod_spec.containers.iter_mut().enumerate() {
            rewrite_container(
                container,
                i,
                system_container_count,
                &self.job.command,
                &container_env,
                &volume_mounts,
                &self.k8s_plugin.git_env_from,
            );
        }

        if pod_spec.containers.is_empty() {
            let mut container = Container {
                image: Some(self.cfg.image.clone()),
                ..Container::default()
            };
            rewrite_container(
                &mut container,
                0,
                system_container_count,
                &self.job.command,
                &container_env,
                &volume_mounts,
                &self.k8s_plugin.git_env_from,
            );
            pod_spec.containers.push(container);
        }

        let container_count = pod_spec.containers.len() + system_container_count;

        for (i, sidecar) in self.k8s_plugin.sidecars.iter().enumerate() {
            let mut container = sidecar.clone();
            if container.name.is_empty() {
                container.name = format!("sidecar-{i}");
            }
            append_mounts(&mut container, &volume_mounts);
            append_env_from(&mut container, &self.k8s_plugin.git_env_from);
            pod_spec.containers.push(container);
        }

        pod_spec
            .containers
            .push(self.agent_container(container_count, &env, &volume_mounts));

        if !skip_checkout {
            let checkout = self.checkout_container(&pod_spec, &env, &volume_mounts);
            pod_spec.containers.push(checkout);
        }

        let mut init_containers = pod_spec.init_containers.take().unwrap_or_default();
        init_containers.insert(0, self.copy_agent_container());
        pod_spec.init_containers = Some(init_containers);

        let mut volumes = pod_spec.volumes.take().unwrap_or_default();
        volumes.push(Volume {
            name: "workspace".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        });
        pod_spec.volumes = Some(volumes);

        pod_spec.restart_policy = Some("Never".to_string());
        pod_spec.termination_grace_period_seconds = Some(TERMINATION_GRACE_PERIOD_SECONDS);

        // Operator policy first, pipeline-author intent second. The order is
        // observable: the plugin patch can override the controller patch.
        if let Some(controller_patch) = &self.cfg.pod_spec_patch {
            info!(job = %self.job.uuid, "applying pod spec patch from the controller configuration");
            pod_spec = patch::strategic_merge(&pod_spec, controller_patch)
                .map_err(|err| BuildError::ControllerPatch(err.to_string()))?;
        }
        if let Some(plugin_patch) = &self.k8s_plugin.pod_spec_patch {
            info!(job = %self.job.uuid, "applying pod spec patch from the kubernetes plugin");
            pod_spec = patch::strategic_merge(&pod_spec, plugin_patch)
                .map_err(|err| BuildError::PluginPatch(err.to_string()))?;
        }

        let ttl = i32::try_from(self.cfg.job_ttl.as_secs()).unwrap_or(i32::MAX);

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(job_name(&self.job.uuid)),
                labels: Some(labels.clone()),
                annotations: Some(annotations.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(ttl),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..JobSpec::default()
            }),
            ..Job::default()
        })
    }

    /// Build a minimal job that surfaces `message` in the user's build logs
    /// and exits non-zero. Runs on a public image and skips checkout, so it
    /// works even when the user's image is unpullable.
    pub fn build_failure_job(&self, message: &str) -> Result<Job, BuildError> {
        let failure = JobBuilder {
            job: self.job,
            cfg: self.cfg,
            env: self.env.clone(),
            k8s_plugin: KubernetesPlugin {
                pod_spec: Some(PodSpec {
                    containers: vec![Container {
                        image: Some(FAILURE_JOB_IMAGE.to_string()),
                        command: Some(vec![format!("echo {message:?} && exit 1")]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
                ..KubernetesPlugin::default()
            },
            other_plugins: Vec::new(),
            parse_err: None,
        };
        failure.build(true)
    }

    fn metadata(&self) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let mut labels = self.k8s_plugin.metadata.labels.clone();
        let mut annotations = self.k8s_plugin.metadata.annotations.clone();

        labels.insert(JOB_UUID_LABEL.to_string(), self.job.uuid.clone());
        let (tag_labels, tag_errors) = agent_tags::to_labels(&self.job.agent_query_rules);
        if !tag_errors.is_empty() {
            warn!(job = %self.job.uuid, errors = ?tag_errors, "skipping agent tags that cannot become labels");
        }
        labels.extend(tag_labels);

        let build_url = self
            .env
            .get("BUILDKITE_BUILD_URL")
            .cloned()
            .unwrap_or_default();
        annotations.insert(BUILD_URL_ANNOTATION.to_string(), build_url.clone());
        match Url::parse(&build_url) {
            Ok(mut url) => {
                url.set_fragment(Some(&self.job.uuid));
                annotations.insert(JOB_URL_ANNOTATION.to_string(), url.to_string());
            }
            Err(_) => {
                warn!(job = %self.job.uuid, build_url = %build_url, "could not parse the build url, omitting the job-url annotation");
            }
        }

        // Keep the cluster autoscaler from evicting the pod mid-build.
        annotations.insert(
            "cluster-autoscaler.kubernetes.io/safe-to-evict".to_string(),
            "false".to_string(),
        );

        (labels, annotations)
    }

    /// Env shared by every generated container.
    fn shared_env(&self) -> Result<Vec<EnvVar>, BuildError> {
        let mut env = vec![
            env_var("BUILDKITE_BUILD_PATH", "/workspace/build"),
            env_var("BUILDKITE_BIN_PATH", "/workspace"),
            env_var("BUILDKITE_SOCKETS_PATH", "/workspace/sockets"),
            EnvVar {
                name: AGENT_TOKEN_KEY.to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: self.cfg.agent_token_secret.clone(),
                        key: AGENT_TOKEN_KEY.to_string(),
                        optional: None,
                    }),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            },
            env_var("BUILDKITE_AGENT_ACQUIRE_JOB", &self.job.uuid),
        ];

        if !self.other_plugins.is_empty() {
            let other = serde_json::to_string(&self.other_plugins)
                .map_err(|err| BuildError::Serialization(err.to_string()))?;
            env.push(env_var("BUILDKITE_PLUGINS", &other));
        }

        for (name, value) in &self.env {
            match name.as_str() {
                "BUILDKITE_COMMAND" | "BUILDKITE_ARTIFACT_PATHS" | "BUILDKITE_PLUGINS" => {}
                _ => env.push(env_var(name, value)),
            }
        }
        Ok(env)
    }

    /// The bootstrap-container env block layered on top of the shared env.
    fn container_env(&self, env: &[EnvVar]) -> Vec<EnvVar> {
        let mut redacted: Vec<String> = self.cfg.additional_redacted_vars.clone();
        redacted.extend(DEFAULT_REDACTED_VARS.iter().map(ToString::to_string));

        let mut container_env = env.to_vec();
        container_env.extend([
            env_var("BUILDKITE_AGENT_EXPERIMENT", "kubernetes-exec"),
            env_var("BUILDKITE_BOOTSTRAP_PHASES", "plugin,command"),
            env_var("BUILDKITE_AGENT_NAME", "buildkite"),
            env_var("BUILDKITE_PLUGINS_PATH", "/tmp"),
            env_var("BUILDKITE_REDACTED_VARS", &redacted.join(",")),
            env_var("BUILDKITE_SHELL", "/bin/sh -ec"),
            env_var(
                "BUILDKITE_ARTIFACT_PATHS",
                self.env
                    .get("BUILDKITE_ARTIFACT_PATHS")
                    .map_or("", String::as_str),
            ),
        ]);
        container_env
    }

    fn agent_container(
        &self,
        container_count: usize,
        env: &[EnvVar],
        volume_mounts: &[VolumeMount],
    ) -> Container {
        let mut tags = vec![AgentTag {
            name: "k8s:agent-stack-version".to_string(),
            value: env!("CARGO_PKG_VERSION").to_string(),
        }];
        match agent_tags::parse(&self.job.agent_query_rules) {
            Ok(job_tags) => tags.extend(job_tags),
            Err(err) => warn!(job = %self.job.uuid, error = %err, "error parsing job tags"),
        }

        let mut agent_env = vec![
            env_var("BUILDKITE_AGENT_EXPERIMENT", "kubernetes-exec"),
            env_var("BUILDKITE_CONTAINER_COUNT", &container_count.to_string()),
            env_var("BUILDKITE_AGENT_TAGS", &agent_tags::to_tag_string(&tags)),
            field_ref_env("BUILDKITE_K8S_NODE", "spec.nodeName"),
            field_ref_env("BUILDKITE_K8S_NAMESPACE", "metadata.namespace"),
            field_ref_env("BUILDKITE_K8S_SERVICE_ACCOUNT", "spec.serviceAccountName"),
        ];
        agent_env.extend(env.iter().cloned());

        Container {
            name: AGENT_CONTAINER_NAME.to_string(),
            args: Some(vec!["start".to_string()]),
            image: Some(self.cfg.image.clone()),
            working_dir: Some("/workspace".to_string()),
            volume_mounts: Some(volume_mounts.to_vec()),
            image_pull_policy: Some("Always".to_string()),
            env: Some(agent_env),
            ..Container::default()
        }
    }

    /// The checkout runs as the pod's user/group. When those are non-root the
    /// container must start as root, create a matching user, then drop to it.
    fn checkout_container(
        &self,
        pod_spec: &PodSpec,
        env: &[EnvVar],
        volume_mounts: &[VolumeMount],
    ) -> Container {
        let mut checkout_env = vec![
            env_var("BUILDKITE_AGENT_EXPERIMENT", "kubernetes-exec"),
            env_var("BUILDKITE_BOOTSTRAP_PHASES", "checkout"),
            env_var("BUILDKITE_AGENT_NAME", "buildkite"),
            env_var("BUILDKITE_CONTAINER_ID", "0"),
        ];
        checkout_env.extend(env.iter().cloned());

        let mut checkout = Container {
            name: "checkout".to_string(),
            image: Some(self.cfg.image.clone()),
            working_dir: Some("/workspace".to_string()),
            volume_mounts: Some(volume_mounts.to_vec()),
            image_pull_policy: Some("Always".to_string()),
            env: Some(checkout_env),
            env_from: non_empty(self.k8s_plugin.git_env_from.clone()),
            ..Container::default()
        };

        let (user, group) = pod_spec
            .security_context
            .as_ref()
            .map_or((0, 0), |sc| {
                (sc.run_as_user.unwrap_or(0), sc.run_as_group.unwrap_or(0))
            });

        match (user, group) {
            (user, group) if user > 0 && group > 0 => {
                checkout.security_context = Some(run_as_root());
                checkout.command = Some(vec!["ash".to_string(), "-c".to_string()]);
                checkout.args = Some(vec![format!(
                    "set -exufo pipefail\n\
                     addgroup -g {group} buildkite-agent\n\
                     adduser -D -u {user} -G buildkite-agent -h /workspace buildkite-agent\n\
                     su buildkite-agent -c \"buildkite-agent-entrypoint bootstrap\""
                )]);
            }
            (user, _) if user > 0 => {
                checkout.security_context = Some(run_as_root());
                checkout.command = Some(vec!["ash".to_string(), "-c".to_string()]);
                checkout.args = Some(vec![format!(
                    "set -exufo pipefail\n\
                     adduser -D -u {user} -G root -h /workspace buildkite-agent\n\
                     su buildkite-agent -c \"buildkite-agent-entrypoint bootstrap\""
                )]);
            }
            // A root user with a non-root group needs no user juggling.
            _ => {
                checkout.command = Some(vec!["buildkite-agent-entrypoint".to_string()]);
                checkout.args = Some(vec!["bootstrap".to_string()]);
            }
        }
        checkout
    }

    /// Init container that seeds the shared work volume with the agent
    /// binary so every container can exec it.
    fn copy_agent_container(&self) -> Container {
        Container {
            name: "copy-agent".to_string(),
            image: Some(self.cfg.image.clone()),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec!["cp".to_string()]),
            args: Some(vec![
                "/usr/local/bin/buildkite-agent".to_string(),
                "/workspace".to_string(),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: "workspace".to_string(),
                mount_path: "/workspace".to_string(),
                ..VolumeMount::default()
            }]),
            ..Container::default()
        }
    }
}

/// Rewrite a user container: capture its command into `BUILDKITE_COMMAND`
/// and run the agent bootstrap instead.
fn rewrite_container(
    container: &mut Container,
    index: usize,
    system_container_count: usize,
    job_command: &str,
    container_env: &[EnvVar],
    volume_mounts: &[VolumeMount],
    git_env_from: &[EnvFromSource],
) {
    let command = match &container.command {
        Some(command) if !command.is_empty() => {
            let mut parts = command.clone();
            parts.extend(container.args.iter().flatten().cloned());
            parts.join(" ")
        }
        _ => job_command.to_string(),
    };

    container.command = Some(vec!["/workspace/buildkite-agent".to_string()]);
    container.args = Some(vec!["bootstrap".to_string()]);
    container.image_pull_policy = Some("Always".to_string());
    if container.name.is_empty() {
        container.name = format!("container-{index}");
    }
    if container.working_dir.is_none() {
        container.working_dir = Some("/workspace".to_string());
    }

    let mut env = container.env.take().unwrap_or_default();
    env.extend(container_env.iter().cloned());
    env.push(env_var("BUILDKITE_COMMAND", &command));
    env.push(env_var(
        "BUILDKITE_CONTAINER_ID",
        &(index + system_container_count).to_string(),
    ));
    container.env = Some(env);

    append_mounts(container, volume_mounts);
    append_env_from(container, git_env_from);
}

fn append_mounts(container: &mut Container, volume_mounts: &[VolumeMount]) {
    let mut mounts = container.volume_mounts.take().unwrap_or_default();
    mounts.extend(volume_mounts.iter().cloned());
    container.volume_mounts = Some(mounts);
}

fn append_env_from(container: &mut Container, git_env_from: &[EnvFromSource]) {
    if git_env_from.is_empty() && container.env_from.is_none() {
        return;
    }
    let mut env_from = container.env_from.take().unwrap_or_default();
    env_from.extend(git_env_from.iter().cloned());
    container.env_from = Some(env_from);
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn run_as_root() -> SecurityContext {
    SecurityContext {
        run_as_user: Some(0),
        run_as_group: Some(0),
        run_as_non_root: Some(false),
        ..SecurityContext::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> Config {
        Config {
            org: "acme".to_string(),
            buildkite_token: "token".to_string(),
            agent_token_secret: "buildkite-agent-token".to_string(),
            image: "ghcr.io/buildkite/agent:3".to_string(),
            tags: vec!["queue=kubernetes".to_string()],
            ..Config::default()
        }
    }

    fn test_job(env: &[&str]) -> CommandJob {
        CommandJob {
            uuid: "0192aefe".to_string(),
            command: "echo hello".to_string(),
            agent_query_rules: vec!["queue=kubernetes".to_string()],
            env: env.iter().map(ToString::to_string).collect(),
        }
    }

    fn plugins_env(plugins: &Value) -> String {
        format!("BUILDKITE_PLUGINS={plugins}")
    }

    fn container_env(container: &Container, name: &str) -> Option<String> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .clone()
    }

    fn pod_of(job: &Job) -> &PodSpec {
        job.spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
    }

    #[test]
    fn name_round_trips() {
        assert_eq!(job_name("abc-123"), "ci-abc-123");
        assert_eq!(job_uuid_from_name("ci-abc-123"), Some("abc-123"));
        assert_eq!(job_uuid_from_name("other-abc"), None);
    }

    #[test]
    fn walking_skeleton() {
        let cfg = test_config();
        let job = test_job(&["BUILDKITE_BUILD_URL=https://buildkite.com/acme/p/builds/1"]);
        let kjob = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();

        assert_eq!(kjob.metadata.name.as_deref(), Some("ci-0192aefe"));
        let labels = kjob.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(JOB_UUID_LABEL), Some(&job.uuid));
        assert_eq!(labels.get("queue"), Some(&"kubernetes".to_string()));
        let annotations = kjob.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations.get(BUILD_URL_ANNOTATION).map(String::as_str),
            Some("https://buildkite.com/acme/p/builds/1")
        );
        assert_eq!(
            annotations.get(JOB_URL_ANNOTATION).map(String::as_str),
            Some("https://buildkite.com/acme/p/builds/1#0192aefe")
        );
        assert_eq!(
            annotations
                .get("cluster-autoscaler.kubernetes.io/safe-to-evict")
                .map(String::as_str),
            Some("false")
        );

        let spec = kjob.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(600));

        let pod = pod_of(&kjob);
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.termination_grace_period_seconds, Some(60));

        // user container, agent, checkout
        assert_eq!(pod.containers.len(), 3);
        let user = &pod.containers[0];
        assert_eq!(user.name, "container-0");
        assert_eq!(
            user.command,
            Some(vec!["/workspace/buildkite-agent".to_string()])
        );
        assert_eq!(user.args, Some(vec!["bootstrap".to_string()]));
        assert_eq!(
            container_env(user, "BUILDKITE_COMMAND").as_deref(),
            Some("echo hello")
        );
        assert_eq!(container_env(user, "BUILDKITE_CONTAINER_ID").as_deref(), Some("1"));

        let agent = &pod.containers[1];
        assert_eq!(agent.name, AGENT_CONTAINER_NAME);
        assert_eq!(agent.args, Some(vec!["start".to_string()]));
        assert_eq!(
            container_env(agent, "BUILDKITE_CONTAINER_COUNT").as_deref(),
            Some("2")
        );
        let tags = container_env(agent, "BUILDKITE_AGENT_TAGS").unwrap();
        assert!(tags.starts_with("k8s:agent-stack-version="));
        assert!(tags.ends_with(",queue=kubernetes"));

        let checkout = &pod.containers[2];
        assert_eq!(checkout.name, "checkout");
        assert_eq!(
            checkout.command,
            Some(vec!["buildkite-agent-entrypoint".to_string()])
        );
        assert_eq!(container_env(checkout, "BUILDKITE_CONTAINER_ID").as_deref(), Some("0"));
        assert_eq!(
            container_env(checkout, "BUILDKITE_BOOTSTRAP_PHASES").as_deref(),
            Some("checkout")
        );

        let init = pod.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, "copy-agent");
        assert_eq!(init[0].command, Some(vec!["cp".to_string()]));

        let volumes = pod.volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == "workspace" && v.empty_dir.is_some()));
    }

    #[test]
    fn skip_checkout_shifts_container_ids() {
        let cfg = test_config();
        let job = test_job(&[]);
        let kjob = JobBuilder::new(&job, &cfg).parse_plugins().build(true).unwrap();
        let pod = pod_of(&kjob);

        // no checkout container
        assert!(pod.containers.iter().all(|c| c.name != "checkout"));
        let user = &pod.containers[0];
        assert_eq!(container_env(user, "BUILDKITE_CONTAINER_ID").as_deref(), Some("0"));
        let agent = pod.containers.iter().find(|c| c.name == "agent").unwrap();
        assert_eq!(
            container_env(agent, "BUILDKITE_CONTAINER_COUNT").as_deref(),
            Some("1")
        );
    }

    #[test]
    fn plugin_pod_spec_containers_are_rewritten_and_numbered() {
        let cfg = test_config();
        let plugins = json!([{
            KUBERNETES_PLUGIN_KEY: {
                "podSpec": {
                    "containers": [
                        {"image": "node:18", "command": ["npm"], "args": ["test"]},
                        {"name": "lint", "image": "node:18", "command": ["npm", "run", "lint"]},
                    ],
                },
            },
        }]);
        let job = test_job(&[&plugins_env(&plugins)]);
        let kjob = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();
        let pod = pod_of(&kjob);

        assert_eq!(pod.containers.len(), 4);
        assert_eq!(pod.containers[0].name, "container-0");
        assert_eq!(
            container_env(&pod.containers[0], "BUILDKITE_COMMAND").as_deref(),
            Some("npm test")
        );
        assert_eq!(
            container_env(&pod.containers[0], "BUILDKITE_CONTAINER_ID").as_deref(),
            Some("1")
        );
        assert_eq!(pod.containers[1].name, "lint");
        assert_eq!(
            container_env(&pod.containers[1], "BUILDKITE_COMMAND").as_deref(),
            Some("npm run lint")
        );
        assert_eq!(
            container_env(&pod.containers[1], "BUILDKITE_CONTAINER_ID").as_deref(),
            Some("2")
        );
        let agent = pod.containers.iter().find(|c| c.name == "agent").unwrap();
        assert_eq!(
            container_env(agent, "BUILDKITE_CONTAINER_COUNT").as_deref(),
            Some("3")
        );
    }

    #[test]
    fn sidecars_do_not_consume_container_ids() {
        let cfg = test_config();
        let plugins = json!([{
            KUBERNETES_PLUGIN_KEY: {
                "sidecars": [
                    {"image": "nginx:latest"},
                    {"name": "redis", "image": "redis:7"},
                ],
            },
        }]);
        let job = test_job(&[&plugins_env(&plugins)]);
        let kjob = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();
        let pod = pod_of(&kjob);

        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["container-0", "sidecar-0", "redis", "agent", "checkout"]);
        // one user container plus checkout, sidecars not counted
        let agent = pod.containers.iter().find(|c| c.name == "agent").unwrap();
        assert_eq!(
            container_env(agent, "BUILDKITE_CONTAINER_COUNT").as_deref(),
            Some("2")
        );
        let sidecar = &pod.containers[1];
        assert!(container_env(sidecar, "BUILDKITE_CONTAINER_ID").is_none());
        assert!(sidecar
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.name == "workspace"));
    }

    #[test]
    fn residual_plugins_round_trip_in_order() {
        let cfg = test_config();
        let plugins = json!([
            {"docker#v5.8.0": {"image": "node:18", "zz-last": true, "aa-first": 1}},
            {KUBERNETES_PLUGIN_KEY: {"extraVolumeMounts": [{"name": "cache", "mountPath": "/cache"}]}},
            {"artifacts#v1.9.0": {"upload": "logs/**"}},
        ]);
        let job = test_job(&[&plugins_env(&plugins)]);
        let kjob = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();
        let pod = pod_of(&kjob);

        let user = &pod.containers[0];
        let residual = container_env(user, "BUILDKITE_PLUGINS").unwrap();
        assert_eq!(
            residual,
            r#"[{"docker#v5.8.0":{"image":"node:18","zz-last":true,"aa-first":1}},{"artifacts#v1.9.0":{"upload":"logs/**"}}]"#
        );
        // the extra mount from the kubernetes plugin still applies
        assert!(user
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.name == "cache" && m.mount_path == "/cache"));
    }

    #[test]
    fn pass_through_env_excludes_reserved_names() {
        let cfg = test_config();
        let job = test_job(&[
            "BUILDKITE_COMMAND=stale",
            "BUILDKITE_ARTIFACT_PATHS=logs/**",
            "MY_VAR=1",
        ]);
        let kjob = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();
        let user = &pod_of(&kjob).containers[0];

        assert_eq!(container_env(user, "MY_VAR").as_deref(), Some("1"));
        // the captured command wins over the stale pass-through value
        assert_eq!(container_env(user, "BUILDKITE_COMMAND").as_deref(), Some("echo hello"));
        assert_eq!(
            container_env(user, "BUILDKITE_ARTIFACT_PATHS").as_deref(),
            Some("logs/**")
        );
    }

    #[test]
    fn invalid_plugin_json_is_a_parse_error() {
        let cfg = test_config();
        let job = test_job(&["BUILDKITE_PLUGINS=not json"]);
        let err = JobBuilder::new(&job, &cfg)
            .parse_plugins()
            .build(false)
            .unwrap_err();
        assert!(matches!(err, BuildError::PluginParse(_)));
        assert!(err.to_string().starts_with("failed parsing plugins"));
    }

    #[test]
    fn plugin_with_two_keys_is_invalid() {
        let cfg = test_config();
        let plugins = json!([{"a": 1, "b": 2}]);
        let job = test_job(&[&plugins_env(&plugins)]);
        let err = JobBuilder::new(&job, &cfg)
            .parse_plugins()
            .build(false)
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidPlugin(_)));
    }

    #[test]
    fn non_string_env_value_in_plugin_pod_spec_fails_schema() {
        let cfg = test_config();
        let plugins = json!([{
            KUBERNETES_PLUGIN_KEY: {
                "podSpec": {
                    "containers": [{
                        "image": "alpine",
                        "command": ["true"],
                        "env": [{"name": "A", "value": 123}],
                    }],
                },
            },
        }]);
        let job = test_job(&[&plugins_env(&plugins)]);
        let err = JobBuilder::new(&job, &cfg)
            .parse_plugins()
            .build(false)
            .unwrap_err();
        assert!(matches!(err, BuildError::KubernetesPluginParse(_)));
        assert!(err.to_string().starts_with("failed parsing kubernetes plugin"));
    }

    #[test]
    fn prohibited_plugin_is_a_permanent_error() {
        let cfg = Config {
            prohibit_kubernetes_plugin: true,
            ..test_config()
        };
        let plugins = json!([{KUBERNETES_PLUGIN_KEY: {}}]);
        let job = test_job(&[&plugins_env(&plugins)]);
        let err = JobBuilder::new(&job, &cfg)
            .parse_plugins()
            .build(false)
            .unwrap_err();
        assert_eq!(err, BuildError::ProhibitedPlugin);
    }

    #[test]
    fn failure_job_echoes_the_error_and_skips_checkout() {
        let cfg = test_config();
        let job = test_job(&["BUILDKITE_PLUGINS=not json"]);
        let builder = JobBuilder::new(&job, &cfg).parse_plugins();
        let err = builder.build(false).unwrap_err();
        let failure = builder.build_failure_job(&err.to_string()).unwrap();

        let pod = pod_of(&failure);
        assert!(pod.containers.iter().all(|c| c.name != "checkout"));
        let user = &pod.containers[0];
        assert_eq!(user.image.as_deref(), Some(FAILURE_JOB_IMAGE));
        let command = container_env(user, "BUILDKITE_COMMAND").unwrap();
        assert!(command.starts_with("echo \"failed parsing plugins"));
        assert!(command.ends_with("&& exit 1"));
    }

    #[test]
    fn config_patch_applies_before_plugin_patch() {
        let cfg = Config {
            pod_spec_patch: Some(json!({"nodeSelector": {"pool": "operator"}})),
            ..test_config()
        };
        let plugins = json!([{
            KUBERNETES_PLUGIN_KEY: {
                "podSpecPatch": {"nodeSelector": {"pool": "pipeline"}},
            },
        }]);
        let job = test_job(&[&plugins_env(&plugins)]);
        let kjob = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();
        let pod = pod_of(&kjob);
        assert_eq!(
            pod.node_selector.as_ref().unwrap().get("pool").map(String::as_str),
            Some("pipeline")
        );
    }

    #[test]
    fn invalid_config_patch_is_a_builder_error() {
        let cfg = Config {
            pod_spec_patch: Some(json!({"containers": [{"name": "agent", "env": [{"name": "X", "value": 1}]}]})),
            ..test_config()
        };
        let job = test_job(&[]);
        let err = JobBuilder::new(&job, &cfg)
            .parse_plugins()
            .build(false)
            .unwrap_err();
        assert!(matches!(err, BuildError::ControllerPatch(_)));
    }

    #[test]
    fn checkout_creates_matching_user_for_non_root_pods() {
        let cfg = test_config();
        let plugins = json!([{
            KUBERNETES_PLUGIN_KEY: {
                "podSpec": {
                    "securityContext": {"runAsUser": 1000, "runAsGroup": 1000},
                    "containers": [{"image": "alpine", "command": ["true"]}],
                },
            },
        }]);
        let job = test_job(&[&plugins_env(&plugins)]);
        let kjob = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();
        let pod = pod_of(&kjob);
        let checkout = pod.containers.iter().find(|c| c.name == "checkout").unwrap();

        assert_eq!(checkout.command, Some(vec!["ash".to_string(), "-c".to_string()]));
        let script = &checkout.args.as_ref().unwrap()[0];
        assert!(script.contains("addgroup -g 1000"));
        assert!(script.contains("adduser -D -u 1000 -G buildkite-agent"));
        assert!(script.contains("su buildkite-agent"));
        let sc = checkout.security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_user, Some(0));
        assert_eq!(sc.run_as_non_root, Some(false));
    }

    #[test]
    fn checkout_with_root_group_uses_root_group_user() {
        let cfg = test_config();
        let plugins = json!([{
            KUBERNETES_PLUGIN_KEY: {
                "podSpec": {
                    "securityContext": {"runAsUser": 1000},
                    "containers": [{"image": "alpine", "command": ["true"]}],
                },
            },
        }]);
        let job = test_job(&[&plugins_env(&plugins)]);
        let kjob = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();
        let checkout = pod_of(&kjob)
            .containers
            .iter()
            .find(|c| c.name == "checkout")
            .unwrap();
        let script = &checkout.args.as_ref().unwrap()[0];
        assert!(script.contains("adduser -D -u 1000 -G root"));
        assert!(!script.contains("addgroup"));
    }

    #[test]
    fn builder_is_deterministic() {
        let cfg = test_config();
        let plugins = json!([
            {"docker#v5": {"image": "node"}},
            {KUBERNETES_PLUGIN_KEY: {"metadata": {"labels": {"team": "infra"}}}},
        ]);
        let job = test_job(&[
            &plugins_env(&plugins),
            "BUILDKITE_BUILD_URL=https://buildkite.com/acme/p/builds/2",
            "ZEBRA=z",
            "ALPHA=a",
        ]);
        let first = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();
        let second = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn missing_build_url_omits_job_url_annotation() {
        let cfg = test_config();
        let job = test_job(&[]);
        let kjob = JobBuilder::new(&job, &cfg).parse_plugins().build(false).unwrap();
        let annotations = kjob.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.get(BUILD_URL_ANNOTATION).map(String::as_str), Some(""));
        assert!(annotations.get(JOB_URL_ANNOTATION).is_none());
    }
}
