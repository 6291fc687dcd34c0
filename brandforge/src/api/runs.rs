use crate::{
    api::{epoch_milli, validate, ApiState},
    http_error, storage,
};
use anyhow::{Context, Result};
use dropshot::{
    endpoint, HttpError, HttpResponseCreated, HttpResponseOk, Path, Query, RequestContext,
    TypedBody,
};
use http::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::Acquire;
use std::{collections::HashMap, str::FromStr, sync::Arc};
use strum::{Display, EnumString};
use tracing::debug;

/// Status of a cancelled run as recorded in its error message. Cancellation does not get its
/// own status; a cancelled run is a failed run with this message.
pub const CANCELLED_ERROR_MESSAGE: &str = "Pipeline cancelled by user";

/// Stand-in error message for failures reported without one.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Execution failed";

fn failure_message(message: Option<String>) -> String {
    message
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.into())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunPathArgs {
    /// The unique identifier for the target run.
    pub run_id: u64,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[schemars(rename = "run_status")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    /// Waiting for a worker to claim it.
    #[default]
    Pending,

    /// Claimed by a worker and currently executing.
    Running,

    /// Finished and produced its outputs.
    Completed,

    /// Finished without producing its outputs. Cancelled runs land here too.
    Failed,
}

impl Status {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

#[derive(
    Debug, Clone, Copy, Display, PartialEq, EnumString, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[schemars(rename = "run_step")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Step {
    Clone,
    Build,
    Brand,
    Push,
    Test,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[schemars(rename = "output_type")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum OutputType {
    /// A zip archive of the branded source tree.
    #[default]
    Zip,

    /// A container image pushed to a registry.
    DockerImage,
}

/// A run is one execution of the branding pipeline against a repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Run {
    /// The unique identifier for the run. Assigned by the service on creation.
    pub run_id: u64,

    /// The repository the run clones and rebrands.
    pub repository_id: String,

    /// The registry the run pushes to. Only set for docker image runs.
    pub registry_id: Option<String>,

    /// The branding template applied during the brand step.
    pub template_id: Option<String>,

    /// The branch checked out by the clone step.
    pub branch: String,

    /// A specific commit to check out. Empty means the branch head.
    pub commit_hash: String,

    /// What kind of artifact the run produces.
    pub output_type: OutputType,

    /// The tag pushed images carry.
    pub image_tag: String,

    /// The pipeline steps this run executes, in order.
    pub steps: Vec<Step>,

    /// Build arguments handed to the build step.
    pub build_arguments: HashMap<String, String>,

    /// Environment variables injected into every step.
    pub environment_variables: HashMap<String, String>,

    /// Free-form values attached to the run. Retried runs record their retry_count here.
    pub metadata: HashMap<String, serde_json::Value>,

    /// Where the run currently is in its lifecycle.
    pub status: Status,

    /// Human readable name of the step currently executing.
    pub current_step: String,

    /// Worker-reported progress, 0 through 100.
    pub progress_percentage: u8,

    /// The worker that claimed the run. Empty until the run starts.
    pub worker_id: String,

    /// Why the run failed, if it failed.
    pub error_message: String,

    /// Timestamped log lines appended by the worker as it reports progress.
    pub logs: Vec<String>,

    /// Time of run creation in epoch milliseconds.
    pub created: u64,

    /// Time the run was claimed by a worker in epoch milliseconds. 0 until started.
    pub started: u64,

    /// Time the run reached a terminal status in epoch milliseconds. 0 until then.
    pub ended: u64,
}

impl TryFrom<storage::runs::Run> for Run {
    type Error = anyhow::Error;

    fn try_from(value: storage::runs::Run) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let started = value.started.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'started' from storage value '{}'",
                value.started
            )
        })?;

        let ended = value.ended.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'ended' from storage value '{}'",
                value.ended
            )
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let output_type = OutputType::from_str(&value.output_type).with_context(|| {
            format!(
                "Could not parse field 'output_type' from storage value '{}'",
                value.output_type
            )
        })?;

        let steps = serde_json::from_str(&value.steps).with_context(|| {
            format!(
                "Could not parse field 'steps' from storage value; '{:#?}'",
                value.steps
            )
        })?;

        let build_arguments = serde_json::from_str(&value.build_arguments).with_context(|| {
            format!(
                "Could not parse field 'build_arguments' from storage value; '{:#?}'",
                value.build_arguments
            )
        })?;

        let environment_variables = serde_json::from_str(&value.environment_variables)
            .with_context(|| {
                format!(
                    "Could not parse field 'environment_variables' from storage value; '{:#?}'",
                    value.environment_variables
                )
            })?;

        let metadata = serde_json::from_str(&value.metadata).with_context(|| {
            format!(
                "Could not parse field 'metadata' from storage value; '{:#?}'",
                value.metadata
            )
        })?;

        let logs = serde_json::from_str(&value.logs).with_context(|| {
            format!(
                "Could not parse field 'logs' from storage value; '{:#?}'",
                value.logs
            )
        })?;

        Ok(Run {
            run_id: value.run_id.try_into()?,
            repository_id: value.repository_id,
            registry_id: value.registry_id,
            template_id: value.template_id,
            branch: value.branch,
            commit_hash: value.commit_hash,
            output_type,
            image_tag: value.image_tag,
            steps,
            build_arguments,
            environment_variables,
            metadata,
            status,
            current_step: value.current_step,
            progress_percentage: value.progress_percentage.try_into()?,
            worker_id: value.worker_id,
            error_message: value.error_message,
            logs,
            created,
            started,
            ended,
        })
    }
}

impl TryFrom<Run> for storage::runs::Run {
    type Error = anyhow::Error;

    fn try_from(value: Run) -> Result<Self> {
        let steps = serde_json::to_string(&value.steps).with_context(|| {
            format!(
                "Could not parse field 'steps' to storage value; '{:#?}'",
                value.steps
            )
        })?;

        let build_arguments = serde_json::to_string(&value.build_arguments).with_context(|| {
            format!(
                "Could not parse field 'build_arguments' to storage value; '{:#?}'",
                value.build_arguments
            )
        })?;

        let environment_variables = serde_json::to_string(&value.environment_variables)
            .with_context(|| {
                format!(
                    "Could not parse field 'environment_variables' to storage value; '{:#?}'",
                    value.environment_variables
                )
            })?;

        let metadata = serde_json::to_string(&value.metadata).with_context(|| {
            format!(
                "Could not parse field 'metadata' to storage value; '{:#?}'",
                value.metadata
            )
        })?;

        let logs = serde_json::to_string(&value.logs).with_context(|| {
            format!(
                "Could not parse field 'logs' to storage value; '{:#?}'",
                value.logs
            )
        })?;

        Ok(Self {
            run_id: value.run_id.try_into()?,
            repository_id: value.repository_id,
            registry_id: value.registry_id,
            template_id: value.template_id,
            branch: value.branch,
            commit_hash: value.commit_hash,
            output_type: value.output_type.to_string(),
            image_tag: value.image_tag,
            steps,
            build_arguments,
            environment_variables,
            metadata,
            status: value.status.to_string(),
            current_step: value.current_step,
            progress_percentage: value.progress_percentage.into(),
            worker_id: value.worker_id,
            error_message: value.error_message,
            logs,
            created: value.created.to_string(),
            started: value.started.to_string(),
            ended: value.ended.to_string(),
        })
    }
}

/// Rejects step lists that name the same step twice. Order is otherwise up to the caller.
pub fn validate_steps(steps: &[Step]) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();

    for step in steps {
        if !seen.insert(step) {
            return Err(format!("step '{step}' listed more than once"));
        }
    }

    Ok(())
}

/// Image tag carried by a retried run. The suffix is only added once so chains of retries
/// don't accumulate it.
pub fn retry_image_tag(image_tag: &str) -> String {
    if image_tag.ends_with("-retry") {
        image_tag.to_string()
    } else {
        format!("{image_tag}-retry")
    }
}

/// How many times this configuration has been retried, read from run metadata.
pub fn retry_count(metadata: &HashMap<String, serde_json::Value>) -> u64 {
    metadata
        .get("retry_count")
        .and_then(|value| value.as_u64())
        .unwrap_or_default()
}

/// Builds the fresh pending run a retry creates. Configuration is copied from the failed
/// source run; lifecycle fields start over.
pub fn build_retry_run(source: &Run) -> Run {
    let mut metadata = source.metadata.clone();
    metadata.insert(
        "retry_count".to_string(),
        serde_json::Value::from(retry_count(&source.metadata) + 1),
    );
    metadata.insert(
        "retried_from".to_string(),
        serde_json::Value::from(source.run_id),
    );

    Run {
        run_id: 0,
        repository_id: source.repository_id.clone(),
        registry_id: source.registry_id.clone(),
        template_id: source.template_id.clone(),
        branch: source.branch.clone(),
        commit_hash: source.commit_hash.clone(),
        output_type: source.output_type.clone(),
        image_tag: retry_image_tag(&source.image_tag),
        steps: source.steps.clone(),
        build_arguments: source.build_arguments.clone(),
        environment_variables: source.environment_variables.clone(),
        metadata,
        status: Status::Pending,
        current_step: String::new(),
        progress_percentage: 0,
        worker_id: String::new(),
        error_message: String::new(),
        logs: vec![],
        created: epoch_milli(),
        started: 0,
        ended: 0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListRunsResponse {
    /// A list of runs, newest first.
    pub runs: Vec<Run>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListRunsQueryArgs {
    /// Only return runs with this status.
    pub status: Option<Status>,

    /// Only return runs targeting this repository.
    pub repository_id: Option<String>,

    /// Only return runs pushing to this registry.
    pub registry_id: Option<String>,

    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// List all runs.
///
/// Returns runs newest first, optionally narrowed by status, repository, or registry.
#[endpoint(
    method = GET,
    path = "/api/runs",
    tags = ["Runs"],
)]
pub async fn list_runs(
    rqctx: RequestContext<Arc<ApiState>>,
    query_params: Query<ListRunsQueryArgs>,
) -> Result<HttpResponseOk<ListRunsResponse>, HttpError> {
    let api_state = rqctx.context();
    let query = query_params.into_inner();

    let mut conn = match api_state.storage.read_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let filters = storage::runs::Filters {
        status: query.status.map(|status| status.to_string()),
        repository_id: query.repository_id,
        registry_id: query.registry_id,
    };

    let storage_runs = match storage::runs::list(
        &mut conn,
        &filters,
        query.offset.unwrap_or_default() as i64,
        query.limit.unwrap_or(50) as i64,
    )
    .await
    {
        Ok(runs) => runs,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            ));
        }
    };

    let mut runs: Vec<Run> = vec![];

    for storage_run in storage_runs {
        let run = Run::try_from(storage_run).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            )
        })?;

        runs.push(run);
    }

    let resp = ListRunsResponse { runs };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateRunRequest {
    /// The repository the run clones and rebrands.
    pub repository_id: String,

    /// The registry the run pushes to. Required for docker image runs.
    pub registry_id: Option<String>,

    /// The branding template applied during the brand step.
    pub template_id: Option<String>,

    /// The branch checked out by the clone step. Defaults to the repository's default
    /// branch.
    pub branch: Option<String>,

    /// A specific commit to check out. Omit for the branch head.
    pub commit_hash: Option<String>,

    /// What kind of artifact the run produces.
    pub output_type: OutputType,

    /// The tag pushed images carry. Defaults to 'latest'.
    pub image_tag: Option<String>,

    /// The pipeline steps this run executes, in order. Defaults to clone, build, brand,
    /// and additionally push for docker image runs.
    pub steps: Option<Vec<Step>>,

    /// Build arguments handed to the build step.
    pub build_arguments: Option<HashMap<String, String>>,

    /// Environment variables injected into every step.
    pub environment_variables: Option<HashMap<String, String>>,

    /// Free-form values attached to the run.
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateRunResponse {
    /// The run that was created.
    pub run: Run,
}

/// Create a new run.
///
/// The run is created pending; a worker claims it through the start endpoint.
#[endpoint(
    method = POST,
    path = "/api/runs",
    tags = ["Runs"],
)]
pub async fn create_run(
    rqctx: RequestContext<Arc<ApiState>>,
    body: TypedBody<CreateRunRequest>,
) -> Result<HttpResponseCreated<CreateRunResponse>, HttpError> {
    let api_state = rqctx.context();
    let body = body.into_inner();

    if let Some(branch) = &body.branch {
        validate::arg(
            "branch",
            branch.clone(),
            vec![validate::is_valid_branch_name],
        )?;
    }

    if let Some(steps) = &body.steps {
        validate_steps(steps).map_err(|e| HttpError::for_bad_request(None, e))?;
    }

    let mut conn = match api_state.storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let storage_repository =
        match storage::repositories::get(&mut conn, &body.repository_id).await {
            Ok(repository) => repository,
            Err(e) => match e {
                storage::StorageError::NotFound => {
                    return Err(HttpError::for_bad_request(
                        None,
                        format!("repository_id '{}' does not exist", body.repository_id),
                    ));
                }
                _ => {
                    return Err(http_error!(
                        "Could not get object from database",
                        StatusCode::INTERNAL_SERVER_ERROR,
                        rqctx.request_id.clone(),
                        Some(e.into())
                    ));
                }
            },
        };

    if !storage_repository.is_active {
        return Err(HttpError::for_bad_request(
            None,
            format!("repository '{}' is inactive", body.repository_id),
        ));
    }

    // Pushes need somewhere to land; zip runs may omit the registry entirely.
    if body.output_type == OutputType::DockerImage && body.registry_id.is_none() {
        return Err(HttpError::for_bad_request(
            None,
            "registry_id is required for docker image runs".into(),
        ));
    }

    if let Some(registry_id) = &body.registry_id {
        let storage_registry = match storage::registries::get(&mut conn, registry_id).await {
            Ok(registry) => registry,
            Err(e) => match e {
                storage::StorageError::NotFound => {
                    return Err(HttpError::for_bad_request(
                        None,
                        format!("registry_id '{registry_id}' does not exist"),
                    ));
                }
                _ => {
                    return Err(http_error!(
                        "Could not get object from database",
                        StatusCode::INTERNAL_SERVER_ERROR,
                        rqctx.request_id.clone(),
                        Some(e.into())
                    ));
                }
            },
        };

        if !storage_registry.is_active {
            return Err(HttpError::for_bad_request(
                None,
                format!("registry '{registry_id}' is inactive"),
            ));
        }
    }

    if let Some(template_id) = &body.template_id {
        if let Err(e) = storage::templates::get(&mut conn, template_id).await {
            match e {
                storage::StorageError::NotFound => {
                    return Err(HttpError::for_bad_request(
                        None,
                        format!("template_id '{template_id}' does not exist"),
                    ));
                }
                _ => {
                    return Err(http_error!(
                        "Could not get object from database",
                        StatusCode::INTERNAL_SERVER_ERROR,
                        rqctx.request_id.clone(),
                        Some(e.into())
                    ));
                }
            }
        }
    }

    let steps = body.steps.unwrap_or_else(|| {
        let mut steps = vec![Step::Clone, Step::Build, Step::Brand];
        if body.output_type == OutputType::DockerImage {
            steps.push(Step::Push);
        }
        steps
    });

    let mut run = Run {
        run_id: 0,
        repository_id: body.repository_id,
        registry_id: body.registry_id,
        template_id: body.template_id,
        branch: body
            .branch
            .unwrap_or(storage_repository.default_branch),
        commit_hash: body.commit_hash.unwrap_or_default(),
        output_type: body.output_type,
        image_tag: body.image_tag.unwrap_or_else(|| "latest".into()),
        steps,
        build_arguments: body.build_arguments.unwrap_or_default(),
        environment_variables: body.environment_variables.unwrap_or_default(),
        metadata: body.metadata.unwrap_or_default(),
        status: Status::Pending,
        current_step: String::new(),
        progress_percentage: 0,
        worker_id: String::new(),
        error_message: String::new(),
        logs: vec![],
        created: epoch_milli(),
        started: 0,
        ended: 0,
    };

    let storage_run = storage::runs::Run::try_from(run.clone()).map_err(|e| {
        http_error!(
            "Could not parse object into database value",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e)
        )
    })?;

    let run_id = match storage::runs::insert(&mut conn, &storage_run).await {
        Ok(run_id) => run_id,
        Err(e) => {
            return Err(http_error!(
                "Could not insert object into database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            ));
        }
    };

    run.run_id = run_id.try_into().map_err(|e: std::num::TryFromIntError| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        )
    })?;

    debug!(run_id = run.run_id, repository_id = %run.repository_id, "Created new run");

    let resp = CreateRunResponse { run };
    Ok(HttpResponseCreated(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetRunResponse {
    /// The run requested.
    pub run: Run,
}

/// Get run by id.
#[endpoint(
    method = GET,
    path = "/api/runs/{run_id}",
    tags = ["Runs"],
)]
pub async fn get_run(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RunPathArgs>,
) -> Result<HttpResponseOk<GetRunResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let run_id = path.run_id.try_into().map_err(|err| {
        HttpError::for_bad_request(
            None,
            format!("Could not successfully parse 'run_id'. Must be a positive integer; {err}"),
        )
    })?;

    let mut conn = match api_state.storage.read_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let storage_run = match storage::runs::get(&mut conn, run_id).await {
        Ok(run) => run,
        Err(e) => match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(None, String::new()));
            }
            _ => {
                return Err(http_error!(
                    "Could not get object from database",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    rqctx.request_id.clone(),
                    Some(e.into())
                ));
            }
        },
    };

    let run = Run::try_from(storage_run).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        )
    })?;

    let resp = GetRunResponse { run };
    Ok(HttpResponseOk(resp))
}

/// Reads a run inside an open transaction, mapping missing rows to 404.
async fn get_run_for_update(
    conn: &mut sqlx::SqliteConnection,
    request_id: &str,
    run_id: i64,
) -> Result<Run, HttpError> {
    let storage_run = match storage::runs::get(conn, run_id).await {
        Ok(run) => run,
        Err(e) => match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(None, String::new()));
            }
            _ => {
                return Err(http_error!(
                    "Could not get object from database",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    request_id.to_string(),
                    Some(e.into())
                ));
            }
        },
    };

    Run::try_from(storage_run).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            request_id.to_string(),
            Some(e.into())
        )
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StartRunRequest {
    /// Identifier of the worker claiming the run. One is generated when omitted.
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StartRunResponse {
    /// The run, now running.
    pub run: Run,
}

/// Claim a pending run for execution.
///
/// Only pending runs can be started; anything else answers with a conflict.
#[endpoint(
    method = POST,
    path = "/api/runs/{run_id}/start",
    tags = ["Runs"],
)]
pub async fn start_run(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RunPathArgs>,
    body: TypedBody<StartRunRequest>,
) -> Result<HttpResponseOk<StartRunResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
    let body = body.into_inner();

    let run_id: i64 = path.run_id.try_into().map_err(|err| {
        HttpError::for_bad_request(
            None,
            format!("Could not successfully parse 'run_id'. Must be a positive integer; {err}"),
        )
    })?;

    let mut conn = match api_state.storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    // The status check and the claim must be one atomic step or two workers can claim the
    // same run.
    let mut tx = match conn.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            return Err(http_error!(
                "Could not open transaction to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let mut run = get_run_for_update(&mut tx, &rqctx.request_id, run_id).await?;

    if run.status != Status::Pending {
        return Err(HttpError::for_client_error(
            None,
            StatusCode::CONFLICT,
            format!("run is '{}'; only pending runs can be started", run.status),
        ));
    }

    run.status = Status::Running;
    run.worker_id = body
        .worker_id
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
    run.started = epoch_milli();

    let updatable_fields = storage::runs::UpdatableFields {
        status: Some(run.status.to_string()),
        worker_id: Some(run.worker_id.clone()),
        started: Some(run.started.to_string()),
        ..Default::default()
    };

    if let Err(e) = storage::runs::update(&mut tx, run_id, updatable_fields).await {
        return Err(http_error!(
            "Could not update object in database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    if let Err(e) = tx.commit().await {
        return Err(http_error!(
            "Could not commit transaction to database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    debug!(run_id = run.run_id, worker_id = %run.worker_id, "Run claimed by worker");

    let resp = StartRunResponse { run };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdateRunProgressRequest {
    /// Progress percentage. Values over 100 are clamped.
    pub percentage: u8,

    /// Human readable name of the step currently executing.
    pub current_step: Option<String>,

    /// A log line to append to the run's logs.
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdateRunProgressResponse {
    /// The run with its progress fields refreshed.
    pub run: Run,
}

/// Report progress on a running run.
///
/// Only running runs accept progress updates; anything else answers with a conflict.
#[endpoint(
    method = POST,
    path = "/api/runs/{run_id}/progress",
    tags = ["Runs"],
)]
pub async fn update_run_progress(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RunPathArgs>,
    body: TypedBody<UpdateRunProgressRequest>,
) -> Result<HttpResponseOk<UpdateRunProgressResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
    let body = body.into_inner();

    let run_id: i64 = path.run_id.try_into().map_err(|err| {
        HttpError::for_bad_request(
            None,
            format!("Could not successfully parse 'run_id'. Must be a positive integer; {err}"),
        )
    })?;

    let mut conn = match api_state.storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let mut tx = match conn.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            return Err(http_error!(
                "Could not open transaction to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let mut run = get_run_for_update(&mut tx, &rqctx.request_id, run_id).await?;

    if run.status != Status::Running {
        return Err(HttpError::for_client_error(
            None,
            StatusCode::CONFLICT,
            format!(
                "run is '{}'; only running runs accept progress updates",
                run.status
            ),
        ));
    }

    run.progress_percentage = body.percentage.min(100);

    if let Some(current_step) = body.current_step {
        run.current_step = current_step;
    }

    let logs = body.message.map(|message| {
        run.logs.push(format!("[{}] {}", epoch_milli(), message));
        serde_json::to_string(&run.logs).unwrap_or_default()
    });

    let updatable_fields = storage::runs::UpdatableFields {
        progress_percentage: Some(run.progress_percentage.into()),
        current_step: Some(run.current_step.clone()),
        logs,
        ..Default::default()
    };

    if let Err(e) = storage::runs::update(&mut tx, run_id, updatable_fields).await {
        return Err(http_error!(
            "Could not update object in database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    if let Err(e) = tx.commit().await {
        return Err(http_error!(
            "Could not commit transaction to database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    let resp = UpdateRunProgressResponse { run };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CompleteRunRequest {
    /// Whether the run produced its outputs.
    pub success: bool,

    /// Why the run failed. Ignored for successful runs.
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CompleteRunResponse {
    /// The run in its terminal status.
    pub run: Run,
}

/// Mark a running run finished.
///
/// Only running runs can be completed; anything else answers with a conflict.
#[endpoint(
    method = POST,
    path = "/api/runs/{run_id}/complete",
    tags = ["Runs"],
)]
pub async fn complete_run(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RunPathArgs>,
    body: TypedBody<CompleteRunRequest>,
) -> Result<HttpResponseOk<CompleteRunResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
    let body = body.into_inner();

    let run_id: i64 = path.run_id.try_into().map_err(|err| {
        HttpError::for_bad_request(
            None,
            format!("Could not successfully parse 'run_id'. Must be a positive integer; {err}"),
        )
    })?;

    let mut conn = match api_state.storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let mut tx = match conn.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            return Err(http_error!(
                "Could not open transaction to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let mut run = get_run_for_update(&mut tx, &rqctx.request_id, run_id).await?;

    if run.status != Status::Running {
        return Err(HttpError::for_client_error(
            None,
            StatusCode::CONFLICT,
            format!("run is '{}'; only running runs can be completed", run.status),
        ));
    }

    run.ended = epoch_milli();

    if body.success {
        run.status = Status::Completed;
        run.progress_percentage = 100;
    } else {
        run.status = Status::Failed;
        run.error_message = failure_message(body.error_message);
    }

    let updatable_fields = storage::runs::UpdatableFields {
        status: Some(run.status.to_string()),
        progress_percentage: Some(run.progress_percentage.into()),
        error_message: Some(run.error_message.clone()),
        ended: Some(run.ended.to_string()),
        ..Default::default()
    };

    if let Err(e) = storage::runs::update(&mut tx, run_id, updatable_fields).await {
        return Err(http_error!(
            "Could not update object in database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    if let Err(e) = tx.commit().await {
        return Err(http_error!(
            "Could not commit transaction to database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    debug!(run_id = run.run_id, status = %run.status, "Run finished");

    let resp = CompleteRunResponse { run };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CancelRunResponse {
    /// The run, now failed with a cancellation message.
    pub run: Run,
}

/// Cancel a pending or running run.
///
/// Cancellation only marks the run failed; a worker mid-build is not interrupted and
/// discovers the cancellation the next time it reports in. Runs already in a terminal
/// status answer with a conflict.
#[endpoint(
    method = POST,
    path = "/api/runs/{run_id}/cancel",
    tags = ["Runs"],
)]
pub async fn cancel_run(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RunPathArgs>,
) -> Result<HttpResponseOk<CancelRunResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let run_id: i64 = path.run_id.try_into().map_err(|err| {
        HttpError::for_bad_request(
            None,
            format!("Could not successfully parse 'run_id'. Must be a positive integer; {err}"),
        )
    })?;

    let mut conn = match api_state.storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let mut tx = match conn.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            return Err(http_error!(
                "Could not open transaction to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let mut run = get_run_for_update(&mut tx, &rqctx.request_id, run_id).await?;

    if run.status.is_terminal() {
        return Err(HttpError::for_client_error(
            None,
            StatusCode::CONFLICT,
            format!("run is already '{}'; cannot cancel", run.status),
        ));
    }

    run.status = Status::Failed;
    run.error_message = CANCELLED_ERROR_MESSAGE.into();
    run.ended = epoch_milli();

    let updatable_fields = storage::runs::UpdatableFields {
        status: Some(run.status.to_string()),
        error_message: Some(run.error_message.clone()),
        ended: Some(run.ended.to_string()),
        ..Default::default()
    };

    if let Err(e) = storage::runs::update(&mut tx, run_id, updatable_fields).await {
        return Err(http_error!(
            "Could not update object in database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    if let Err(e) = tx.commit().await {
        return Err(http_error!(
            "Could not commit transaction to database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    debug!(run_id = run.run_id, "Run cancelled");

    let resp = CancelRunResponse { run };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RetryRunResponse {
    /// The fresh pending run the retry created.
    pub run: Run,
}

/// Retry a failed run.
///
/// Creates a brand new pending run with the same configuration rather than reviving the
/// failed one. The copy bumps retry_count in its metadata and carries a '-retry' image
/// tag suffix. Only failed runs can be retried.
#[endpoint(
    method = POST,
    path = "/api/runs/{run_id}/retry",
    tags = ["Runs"],
)]
pub async fn retry_run(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RunPathArgs>,
) -> Result<HttpResponseCreated<RetryRunResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let run_id: i64 = path.run_id.try_into().map_err(|err| {
        HttpError::for_bad_request(
            None,
            format!("Could not successfully parse 'run_id'. Must be a positive integer; {err}"),
        )
    })?;

    let mut conn = match api_state.storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let mut tx = match conn.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            return Err(http_error!(
                "Could not open transaction to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let source = get_run_for_update(&mut tx, &rqctx.request_id, run_id).await?;

    if source.status != Status::Failed {
        return Err(HttpError::for_client_error(
            None,
            StatusCode::CONFLICT,
            format!("run is '{}'; only failed runs can be retried", source.status),
        ));
    }

    let mut run = build_retry_run(&source);

    let storage_run = storage::runs::Run::try_from(run.clone()).map_err(|e| {
        http_error!(
            "Could not parse object into database value",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e)
        )
    })?;

    let new_run_id = match storage::runs::insert(&mut tx, &storage_run).await {
        Ok(new_run_id) => new_run_id,
        Err(e) => {
            return Err(http_error!(
                "Could not insert object into database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            ));
        }
    };

    if let Err(e) = tx.commit().await {
        return Err(http_error!(
            "Could not commit transaction to database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    run.run_id = new_run_id
        .try_into()
        .map_err(|e: std::num::TryFromIntError| {
            http_error!(
                "Could not parse object from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            )
        })?;

    debug!(
        run_id = run.run_id,
        retried_from = source.run_id,
        "Created retry run"
    );

    let resp = RetryRunResponse { run };
    Ok(HttpResponseCreated(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetRunLogsResponse {
    /// The run's log lines, oldest first.
    pub logs: Vec<String>,
}

/// Get a run's log lines.
#[endpoint(
    method = GET,
    path = "/api/runs/{run_id}/logs",
    tags = ["Runs"],
)]
pub async fn get_run_logs(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RunPathArgs>,
) -> Result<HttpResponseOk<GetRunLogsResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let run_id: i64 = path.run_id.try_into().map_err(|err| {
        HttpError::for_bad_request(
            None,
            format!("Could not successfully parse 'run_id'. Must be a positive integer; {err}"),
        )
    })?;

    let mut conn = match api_state.storage.read_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let storage_run = match storage::runs::get(&mut conn, run_id).await {
        Ok(run) => run,
        Err(e) => match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(None, String::new()));
            }
            _ => {
                return Err(http_error!(
                    "Could not get object from database",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    rqctx.request_id.clone(),
                    Some(e.into())
                ));
            }
        },
    };

    let run = Run::try_from(storage_run).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        )
    })?;

    let resp = GetRunLogsResponse { logs: run.logs };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetRunsSummaryResponse {
    /// How many runs are waiting for a worker.
    pub pending: u64,

    /// How many runs are currently executing.
    pub running: u64,

    /// How many runs finished and produced their outputs.
    pub completed: u64,

    /// How many runs finished without producing their outputs.
    pub failed: u64,

    /// Total number of runs.
    pub total: u64,
}

/// Summarize run counts by status.
///
/// Lives outside /api/runs because run ids occupy the segment after it.
#[endpoint(
    method = GET,
    path = "/api/run-summary",
    tags = ["Runs"],
)]
pub async fn get_runs_summary(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<GetRunsSummaryResponse>, HttpError> {
    let api_state = rqctx.context();

    let mut conn = match api_state.storage.read_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let counts = match storage::runs::count_by_status(&mut conn).await {
        Ok(counts) => counts,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            ));
        }
    };

    let mut resp = GetRunsSummaryResponse {
        pending: 0,
        running: 0,
        completed: 0,
        failed: 0,
        total: 0,
    };

    for (status, count) in counts {
        let count = count.try_into().unwrap_or_default();

        match Status::from_str(&status) {
            Ok(Status::Pending) => resp.pending = count,
            Ok(Status::Running) => resp.running = count,
            Ok(Status::Completed) => resp.completed = count,
            Ok(Status::Failed) => resp.failed = count,
            Err(e) => {
                return Err(http_error!(
                    "Could not parse object from database",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    rqctx.request_id.clone(),
                    Some(e.into())
                ));
            }
        }

        resp.total += count;
    }

    Ok(HttpResponseOk(resp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn failed_run() -> Run {
        Run {
            run_id: 7,
            repository_id: "openwebui_fork".into(),
            registry_id: Some("dockerhub_main".into()),
            template_id: Some("acme_dark".into()),
            branch: "main".into(),
            commit_hash: "abc123".into(),
            output_type: OutputType::DockerImage,
            image_tag: "v1.0".into(),
            steps: vec![Step::Clone, Step::Build, Step::Brand, Step::Push],
            build_arguments: HashMap::from([("USE_CUDA".to_string(), "false".to_string())]),
            environment_variables: HashMap::new(),
            metadata: HashMap::new(),
            status: Status::Failed,
            current_step: "push".into(),
            progress_percentage: 80,
            worker_id: "worker_1".into(),
            error_message: "push denied".into(),
            logs: vec!["[100] cloning".into()],
            created: 100,
            started: 200,
            ended: 300,
        }
    }

    #[test]
    fn test_validate_steps_rejects_duplicates() {
        assert!(validate_steps(&[Step::Clone, Step::Build, Step::Brand]).is_ok());
        assert!(validate_steps(&[]).is_ok());
        assert!(validate_steps(&[Step::Clone, Step::Clone]).is_err());
    }

    #[test]
    fn test_retry_image_tag_suffix_applied_once() {
        assert_eq!(retry_image_tag("v1.0"), "v1.0-retry");
        assert_eq!(retry_image_tag("v1.0-retry"), "v1.0-retry");
    }

    #[test]
    fn test_build_retry_run_copies_config_and_resets_lifecycle() {
        let source = failed_run();
        let retry = build_retry_run(&source);

        assert_eq!(retry.repository_id, source.repository_id);
        assert_eq!(retry.registry_id, source.registry_id);
        assert_eq!(retry.template_id, source.template_id);
        assert_eq!(retry.branch, source.branch);
        assert_eq!(retry.commit_hash, source.commit_hash);
        assert_eq!(retry.steps, source.steps);
        assert_eq!(retry.build_arguments, source.build_arguments);
        assert_eq!(retry.image_tag, "v1.0-retry");

        assert_eq!(retry.status, Status::Pending);
        assert_eq!(retry.progress_percentage, 0);
        assert!(retry.worker_id.is_empty());
        assert!(retry.error_message.is_empty());
        assert!(retry.logs.is_empty());
        assert_eq!(retry.started, 0);
        assert_eq!(retry.ended, 0);
    }

    #[test]
    fn test_build_retry_run_increments_retry_count() {
        let source = failed_run();

        let first_retry = build_retry_run(&source);
        assert_eq!(retry_count(&first_retry.metadata), 1);
        assert_eq!(
            first_retry.metadata.get("retried_from"),
            Some(&serde_json::Value::from(7))
        );

        let mut second_source = failed_run();
        second_source.metadata = first_retry.metadata;

        let second_retry = build_retry_run(&second_source);
        assert_eq!(retry_count(&second_retry.metadata), 2);
    }

    #[test]
    fn test_failure_message_defaults() {
        assert_eq!(
            failure_message(Some("registry push rejected".into())),
            "registry push rejected"
        );
        assert_eq!(failure_message(Some("".into())), DEFAULT_FAILURE_MESSAGE);
        assert_eq!(failure_message(None), DEFAULT_FAILURE_MESSAGE);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Completed.is_terminal());
        assert!(Status::Failed.is_terminal());
    }

    #[test]
    fn test_run_round_trips_through_storage() {
        let run = failed_run();

        let stored = storage::runs::Run::try_from(run.clone()).unwrap();
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.output_type, "docker_image");

        let recovered = Run::try_from(stored).unwrap();
        assert_eq!(recovered, run);
    }
}
