//! GraphQL client for the Buildkite API.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default Buildkite GraphQL endpoint.
const GRAPHQL_ENDPOINT: &str = "https://graphql.buildkite.com/v1";

/// Page size for the scheduled-job query.
const JOBS_PAGE_SIZE: i64 = 100;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("the buildkite token was rejected")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("graphql errors: {0}")]
    Api(String),

    #[error("no data in graphql response")]
    MissingData,
}

/// A scheduled command job as returned by the queue query. Immutable once
/// observed; the build URL travels inside `env` as `BUILDKITE_BUILD_URL`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandJob {
    pub uuid: String,
    pub command: String,
    #[serde(default, deserialize_with = "null_to_default")]
    pub agent_query_rules: Vec<String>,
    #[serde(default, deserialize_with = "null_to_default")]
    pub env: Vec<String>,
}

/// Buildkite GraphQL client.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    token: String,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct GraphQlRequest<V: Serialize> {
    query: &'static str,
    variables: V,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

impl Client {
    pub fn new(token: &str, endpoint: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
            endpoint: endpoint.unwrap_or_else(|| GRAPHQL_ENDPOINT.to_string()),
        }
    }

    /// Execute a GraphQL query or mutation.
    async fn execute<V: Serialize, R: DeserializeOwned>(
        &self,
        query: &'static str,
        variables: V,
    ) -> Result<R, ClientError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&GraphQlRequest { query, variables })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ClientError::Unauthorized);
        }
        let response = response.error_for_status()?;

        let body: GraphQlResponse<R> = response.json().await?;
        if let Some(errors) = body.errors {
            let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
            return Err(ClientError::Api(messages.join(", ")));
        }
        body.data.ok_or(ClientError::MissingData)
    }

    /// Fetch every job currently in the `scheduled` state whose agent query
    /// rules match the configured tags. Idempotent; a job keeps showing up
    /// until something picks it up.
    pub async fn get_scheduled_jobs(
        &self,
        org: &str,
        cluster_uuid: Option<&str>,
        agent_tags: &[String],
    ) -> Result<Vec<CommandJob>, ClientError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            slug: &'a str,
            cluster: Option<&'a str>,
            agent_query_rules: &'a [String],
            first: i64,
            after: Option<String>,
        }

        #[derive(Deserialize)]
        struct Response {
            organization: Option<Organization>,
        }

        #[derive(Deserialize)]
        struct Organization {
            jobs: JobConnection,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct JobConnection {
            edges: Vec<Edge>,
            page_info: PageInfo,
        }

        #[derive(Deserialize)]
        struct Edge {
            node: CommandJob,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PageInfo {
            has_next_page: bool,
            end_cursor: Option<String>,
        }

        const QUERY: &str = r"
            query ScheduledJobs($slug: ID!, $cluster: ID, $agentQueryRules: [String!], $first: Int!, $after: String) {
                organization(slug: $slug) {
                    jobs(
                        state: [SCHEDULED]
                        type: [COMMAND]
                        cluster: $cluster
                        agentQueryRules: $agentQueryRules
                        first: $first
                        after: $after
                    ) {
                        edges {
                            node {
                                ... on JobTypeCommand {
                                    uuid
                                    command
                                    agentQueryRules
                                    env
                                }
                            }
                        }
                        pageInfo {
                            hasNextPage
                            endCursor
                        }
                    }
                }
            }
        ";

        let mut jobs = Vec::new();
        let mut after = None;
        loop {
            let response: Response = self
                .execute(
                    QUERY,
                    Variables {
                        slug: org,
                        cluster: cluster_uuid,
                        agent_query_rules: agent_tags,
                        first: JOBS_PAGE_SIZE,
                        after: after.take(),
                    },
                )
                .await?;

            let organization = response
                .organization
                .ok_or_else(|| ClientError::Api(format!("organization {org:?} not found")))?;

            jobs.extend(organization.jobs.edges.into_iter().map(|e| e.node));

            let page = organization.jobs.page_info;
            if !page.has_next_page {
                break;
            }
            after = page.end_cursor;
        }

        debug!(count = jobs.len(), "fetched scheduled jobs");
        Ok(jobs)
    }

    /// Move a job to the terminal failed state with an attached log message.
    pub async fn fail_job(&self, job_id: &str, message: &str) -> Result<(), ClientError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Variables<'a> {
            job_id: &'a str,
            messages: Vec<&'a str>,
        }

        const MUTATION: &str = r"
            mutation FailJob($jobId: ID!, $messages: [String!]) {
                failJob(jobId: $jobId, messages: $messages) {
                    clientMutationId
                }
            }
        ";

        let _: serde_json::Value = self
            .execute(
                MUTATION,
                Variables {
                    job_id,
                    messages: vec![message],
                },
            )
            .await?;
        Ok(())
    }

    /// Request cancellation of a job.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), ClientError> {
        #[derive(Serialize)]
        struct Variables<'a> {
            input: CancelInput<'a>,
        }

        #[derive(Serialize)]
        struct CancelInput<'a> {
            id: &'a str,
        }

        const MUTATION: &str = r"
            mutation CancelJob($input: JobTypeCommandCancelInput!) {
                cancelJob(input: $input) {
                    clientMutationId
                }
            }
        ";

        let _: serde_json::Value = self
            .execute(
                MUTATION,
                Variables {
                    input: CancelInput { id: job_id },
                },
            )
            .await?;
        Ok(())
    }
}

fn null_to_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
