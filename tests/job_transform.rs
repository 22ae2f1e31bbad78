//! End-to-end job transform scenarios through the public API.
//!
//! These exercise the full descriptor-to-workload pipeline the way the
//! controller drives it: parse the job environment, build the workload,
//! and (for bad input) fall back to the failure workload.

use ci_stack_k8s::config::Config;
use ci_stack_k8s::scheduler::builder::{self, JobBuilder};
use ci_stack_k8s::CommandJob;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use serde_json::json;

fn config() -> Config {
    Config {
        org: "acme".to_string(),
        buildkite_token: "token".to_string(),
        agent_token_secret: "buildkite-agent-token".to_string(),
        namespace: "buildkite".to_string(),
        image: "ghcr.io/buildkite/agent:3".to_string(),
        tags: vec!["queue=kubernetes".to_string()],
        ..Config::default()
    }
}

fn pod_of(job: &Job) -> &PodSpec {
    job.spec
        .as_ref()
        .expect("job spec")
        .template
        .spec
        .as_ref()
        .expect("pod spec")
}

fn env_of<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)?
        .value
        .as_deref()
}

#[test]
fn hello_world_job_becomes_a_complete_workload() {
    let cfg = config();
    let job = CommandJob {
        uuid: "7b0a3f9c".to_string(),
        command: "echo hello".to_string(),
        agent_query_rules: vec!["queue=kubernetes".to_string()],
        env: vec![
            "BUILDKITE_BUILD_URL=https://buildkite.com/acme/demo/builds/42".to_string(),
        ],
    };

    let workload = JobBuilder::new(&job, &cfg)
        .parse_plugins()
        .build(false)
        .expect("build");

    assert_eq!(workload.metadata.name.as_deref(), Some("ci-7b0a3f9c"));
    assert_eq!(
        builder::job_uuid_from_name(workload.metadata.name.as_deref().unwrap()),
        Some(job.uuid.as_str())
    );

    let pod = pod_of(&workload);
    let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["container-0", "agent", "checkout"]);

    let user = &pod.containers[0];
    assert_eq!(
        user.command.as_deref(),
        Some(&["/workspace/buildkite-agent".to_string()][..])
    );
    assert_eq!(env_of(user, "BUILDKITE_COMMAND"), Some("echo hello"));
    assert_eq!(env_of(user, "BUILDKITE_AGENT_ACQUIRE_JOB"), Some("7b0a3f9c"));

    let agent = &pod.containers[1];
    assert_eq!(env_of(agent, "BUILDKITE_CONTAINER_COUNT"), Some("2"));

    // every container mounts the shared workspace seeded by the init container
    for container in &pod.containers {
        assert!(
            container
                .volume_mounts
                .as_ref()
                .expect("volume mounts")
                .iter()
                .any(|m| m.name == "workspace" && m.mount_path == "/workspace"),
            "container {} misses the workspace mount",
            container.name
        );
    }
    let init = pod.init_containers.as_ref().expect("init containers");
    assert_eq!(init[0].name, "copy-agent");
}

#[test]
fn invalid_plugin_payload_surfaces_in_the_failure_workload() {
    let cfg = config();
    let plugins = json!([{
        "github.com/buildkite-plugins/kubernetes-buildkite-plugin": {
            "podSpec": {
                "containers": [{
                    "image": "alpine",
                    "command": ["true"],
                    "env": [{"name": "BROKEN", "value": 123}],
                }],
            },
        },
    }]);
    let job = CommandJob {
        uuid: "9d41".to_string(),
        command: "true".to_string(),
        agent_query_rules: vec![],
        env: vec![format!("BUILDKITE_PLUGINS={plugins}")],
    };

    let builder = JobBuilder::new(&job, &cfg).parse_plugins();
    let err = builder.build(false).expect_err("schema error");
    let failure = builder
        .build_failure_job(&err.to_string())
        .expect("failure workload");

    let pod = pod_of(&failure);
    assert!(pod.containers.iter().all(|c| c.name != "checkout"));
    let user = &pod.containers[0];
    assert_eq!(user.image.as_deref(), Some(builder::FAILURE_JOB_IMAGE));
    let command = env_of(user, "BUILDKITE_COMMAND").expect("command env");
    assert!(command.starts_with("echo \"failed parsing kubernetes plugin"));
    assert!(command.ends_with("&& exit 1"));
}

#[test]
fn plugin_metadata_lands_on_workload_and_pod() {
    let cfg = config();
    let plugins = json!([{
        "github.com/buildkite-plugins/kubernetes-buildkite-plugin": {
            "metadata": {
                "labels": {"some-label": "wow"},
                "annotations": {"some-annotation": "cool"},
            },
        },
    }]);
    let job = CommandJob {
        uuid: "5efc".to_string(),
        command: "echo hi".to_string(),
        agent_query_rules: vec![],
        env: vec![format!("BUILDKITE_PLUGINS={plugins}")],
    };

    let workload = JobBuilder::new(&job, &cfg)
        .parse_plugins()
        .build(false)
        .expect("build");

    for metadata in [
        &workload.metadata,
        workload
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap(),
    ] {
        let labels = metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("some-label").map(String::as_str), Some("wow"));
        assert_eq!(
            labels.get(builder::JOB_UUID_LABEL).map(String::as_str),
            Some("5efc")
        );
        let annotations = metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations.get("some-annotation").map(String::as_str),
            Some("cool")
        );
    }
}
