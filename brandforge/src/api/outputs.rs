use crate::{
    api::{epoch_milli, runs::OutputType, ApiState},
    http_error, storage,
};
use anyhow::{Context, Result};
use dropshot::{
    endpoint, HttpError, HttpResponseCreated, HttpResponseOk, HttpResponseUpdatedNoContent, Path,
    RequestContext, TypedBody,
};
use http::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use strum::{Display, EnumString};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputPathArgsRoot {
    /// The unique identifier for the run that owns the outputs.
    pub run_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputPathArgs {
    /// The unique identifier for the run that owns the output.
    pub run_id: u64,

    /// The unique identifier for the target output.
    pub output_id: u64,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[schemars(rename = "output_status")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum OutputStatus {
    /// The worker has announced the output but not finished writing it.
    #[default]
    Pending,

    /// The output can be downloaded.
    Available,

    /// The output passed its expiry time or was expired by hand.
    Expired,

    /// The underlying artifact was removed out of band.
    Deleted,
}

/// An output is an artifact a run produced: a zip of the branded tree or a pushed image.
///
/// Expiry is advisory. Nothing in this service deletes expired artifacts; the flag only
/// tells callers the file may no longer be fetchable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Output {
    /// The unique identifier for the output. Assigned by the service on creation.
    pub output_id: u64,

    /// The run that produced this output.
    pub run_id: u64,

    /// What kind of artifact this is. A run holds at most one output per kind.
    pub output_type: OutputType,

    /// Where the output is in its lifecycle.
    pub status: OutputStatus,

    /// Filesystem path of the artifact on the worker that built it.
    pub file_path: String,

    /// Externally reachable url for the artifact, when one exists.
    pub file_url: String,

    /// Fully qualified image reference, for docker image outputs.
    pub image_url: String,

    /// Size of the artifact in bytes, when known.
    pub file_size_bytes: Option<u64>,

    /// Sha256 digest of the artifact.
    pub checksum: String,

    /// How many times download info for this output has been handed out.
    pub download_count: u64,

    /// Time the artifact expires in epoch milliseconds. 0 means it never expires.
    pub expires: u64,

    /// Whether the expiry time has passed. Derived; never stored.
    pub is_expired: bool,

    /// Where to fetch the artifact from. The file url when one exists, otherwise the
    /// service's own download route. Derived; never stored.
    pub download_url: String,

    /// Free-form values the worker attached to the build.
    pub build_metadata: HashMap<String, serde_json::Value>,

    /// Time of output creation in epoch milliseconds.
    pub created: u64,

    /// Time of last output modification in epoch milliseconds.
    pub modified: u64,
}

/// The service's own download route for an output.
pub fn synthesized_download_url(run_id: u64, output_id: u64) -> String {
    format!("/api/runs/{run_id}/outputs/{output_id}/download")
}

/// An output is expired once its expiry time passes or it was expired by hand.
pub fn output_is_expired(status: &OutputStatus, expires: u64, now: u64) -> bool {
    if *status == OutputStatus::Expired {
        return true;
    }

    expires != 0 && expires <= now
}

impl TryFrom<storage::outputs::Output> for Output {
    type Error = anyhow::Error;

    fn try_from(value: storage::outputs::Output) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let modified = value.modified.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'modified' from storage value '{}'",
                value.modified
            )
        })?;

        let expires = value.expires.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'expires' from storage value '{}'",
                value.expires
            )
        })?;

        let output_type = OutputType::from_str(&value.output_type).with_context(|| {
            format!(
                "Could not parse field 'output_type' from storage value '{}'",
                value.output_type
            )
        })?;

        let status = OutputStatus::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let build_metadata = serde_json::from_str(&value.build_metadata).with_context(|| {
            format!(
                "Could not parse field 'build_metadata' from storage value; '{:#?}'",
                value.build_metadata
            )
        })?;

        let output_id: u64 = value.output_id.try_into()?;
        let run_id: u64 = value.run_id.try_into()?;

        let is_expired = output_is_expired(&status, expires, epoch_milli());
        let download_url = if value.file_url.is_empty() {
            synthesized_download_url(run_id, output_id)
        } else {
            value.file_url.clone()
        };

        Ok(Output {
            output_id,
            run_id,
            output_type,
            status,
            file_path: value.file_path,
            file_url: value.file_url,
            image_url: value.image_url,
            file_size_bytes: value.file_size_bytes.map(|size| size.try_into()).transpose()?,
            checksum: value.checksum,
            download_count: value.download_count.try_into()?,
            expires,
            is_expired,
            download_url,
            build_metadata,
            created,
            modified,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListOutputsResponse {
    /// All outputs the run produced.
    pub outputs: Vec<Output>,
}

/// List a run's outputs.
#[endpoint(
    method = GET,
    path = "/api/runs/{run_id}/outputs",
    tags = ["Outputs"],
)]
pub async fn list_outputs(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<OutputPathArgsRoot>,
) -> Result<HttpResponseOk<ListOutputsResponse>, HttpError> {
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

    if let Err(e) = storage::runs::get(&mut conn, run_id).await {
        match e {
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
        }
    }

    let storage_outputs = match storage::outputs::list_for_run(&mut conn, run_id).await {
        Ok(outputs) => outputs,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            ));
        }
    };

    let mut outputs: Vec<Output> = vec![];

    for storage_output in storage_outputs {
        let output = Output::try_from(storage_output).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            )
        })?;

        outputs.push(output);
    }

    let resp = ListOutputsResponse { outputs };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RecordOutputRequest {
    /// What kind of artifact this is. A run holds at most one output per kind.
    pub output_type: OutputType,

    /// Filesystem path of the artifact on the worker that built it.
    pub file_path: Option<String>,

    /// Externally reachable url for the artifact, when one exists.
    pub file_url: Option<String>,

    /// Fully qualified image reference, for docker image outputs.
    pub image_url: Option<String>,

    /// Size of the artifact in bytes, when known.
    pub file_size_bytes: Option<u64>,

    /// Sha256 digest of the artifact.
    pub checksum: Option<String>,

    /// Time the artifact expires in epoch milliseconds. Defaults to the configured
    /// output expiry window from now.
    pub expires: Option<u64>,

    /// Free-form values the worker attached to the build.
    pub build_metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RecordOutputResponse {
    /// The output that was recorded.
    pub output: Output,
}

/// Record an artifact a run produced.
///
/// Workers call this as steps finish. Each run holds at most one output per output type;
/// a second recording of the same type answers with a conflict.
#[endpoint(
    method = POST,
    path = "/api/runs/{run_id}/outputs",
    tags = ["Outputs"],
)]
pub async fn record_output(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<OutputPathArgsRoot>,
    body: TypedBody<RecordOutputRequest>,
) -> Result<HttpResponseCreated<RecordOutputResponse>, HttpError> {
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

    if let Err(e) = storage::runs::get(&mut conn, run_id).await {
        match e {
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
        }
    }

    // A configured expiry of zero means outputs never expire.
    let expires = body.expires.unwrap_or_else(|| {
        let ttl = api_state.config.build.default_output_expiry;
        if ttl == 0 {
            0
        } else {
            epoch_milli() + ttl * 1000
        }
    });

    let build_metadata = body.build_metadata.unwrap_or_default();

    let build_metadata_json = serde_json::to_string(&build_metadata).map_err(|e| {
        http_error!(
            "Could not parse object into database value",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        )
    })?;

    let created = epoch_milli();

    // Outputs announced before their artifact has a location stay pending.
    let has_location = body.file_path.as_deref().is_some_and(|v| !v.is_empty())
        || body.file_url.as_deref().is_some_and(|v| !v.is_empty())
        || body.image_url.as_deref().is_some_and(|v| !v.is_empty());

    let status = if has_location {
        OutputStatus::Available
    } else {
        OutputStatus::Pending
    };

    let storage_output = storage::outputs::Output {
        output_id: 0,
        run_id,
        output_type: body.output_type.to_string(),
        status: status.to_string(),
        file_path: body.file_path.unwrap_or_default(),
        file_url: body.file_url.unwrap_or_default(),
        image_url: body.image_url.unwrap_or_default(),
        file_size_bytes: body
            .file_size_bytes
            .map(|size| size.try_into())
            .transpose()
            .map_err(|e: std::num::TryFromIntError| {
                HttpError::for_bad_request(None, format!("file_size_bytes too large; {err}", err = e))
            })?,
        checksum: body.checksum.unwrap_or_default(),
        download_count: 0,
        expires: expires.to_string(),
        build_metadata: build_metadata_json,
        created: created.to_string(),
        modified: "0".to_string(),
    };

    let output_id = match storage::outputs::insert(&mut conn, &storage_output).await {
        Ok(output_id) => output_id,
        Err(e) => match e {
            storage::StorageError::Exists => {
                return Err(HttpError::for_client_error(
                    None,
                    StatusCode::CONFLICT,
                    format!(
                        "run already has a '{}' output recorded",
                        body.output_type
                    ),
                ));
            }
            _ => {
                return Err(http_error!(
                    "Could not insert object into database",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    rqctx.request_id.clone(),
                    Some(e.into())
                ));
            }
        },
    };

    let output = Output::try_from(storage::outputs::Output {
        output_id,
        ..storage_output
    })
    .map_err(|e| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        )
    })?;

    let resp = RecordOutputResponse { output };
    Ok(HttpResponseCreated(resp))
}

/// Reads an output and checks it belongs to the run named in the path.
async fn get_output_checked(
    conn: &mut sqlx::SqliteConnection,
    request_id: &str,
    run_id: u64,
    output_id: i64,
) -> Result<Output, HttpError> {
    let storage_output = match storage::outputs::get(conn, output_id).await {
        Ok(output) => output,
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

    let output = Output::try_from(storage_output).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            request_id.to_string(),
            Some(e.into())
        )
    })?;

    if output.run_id != run_id {
        return Err(HttpError::for_not_found(None, String::new()));
    }

    Ok(output)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetOutputResponse {
    /// The output requested.
    pub output: Output,
}

/// Get output by id.
#[endpoint(
    method = GET,
    path = "/api/runs/{run_id}/outputs/{output_id}",
    tags = ["Outputs"],
)]
pub async fn get_output(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<OutputPathArgs>,
) -> Result<HttpResponseOk<GetOutputResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let output_id: i64 = path.output_id.try_into().map_err(|err| {
        HttpError::for_bad_request(
            None,
            format!("Could not successfully parse 'output_id'. Must be a positive integer; {err}"),
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

    let output = get_output_checked(&mut conn, &rqctx.request_id, path.run_id, output_id).await?;

    let resp = GetOutputResponse { output };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DownloadOutputResponse {
    /// Where to fetch the artifact from.
    pub download_url: String,

    /// Sha256 digest callers can verify the artifact against.
    pub checksum: String,

    /// Size of the artifact in bytes, when known.
    pub file_size_bytes: Option<u64>,

    /// How many times download info for this output has been handed out, including this
    /// request.
    pub download_count: u64,
}

/// Get download info for an output.
///
/// Each successful call counts as a download. Expired outputs answer with a conflict.
#[endpoint(
    method = POST,
    path = "/api/runs/{run_id}/outputs/{output_id}/download",
    tags = ["Outputs"],
)]
pub async fn download_output(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<OutputPathArgs>,
) -> Result<HttpResponseOk<DownloadOutputResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let output_id: i64 = path.output_id.try_into().map_err(|err| {
        HttpError::for_bad_request(
            None,
            format!("Could not successfully parse 'output_id'. Must be a positive integer; {err}"),
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

    let output = get_output_checked(&mut conn, &rqctx.request_id, path.run_id, output_id).await?;

    // An output with no artifact attached yet has nothing to download.
    if output.file_url.is_empty() && output.file_path.is_empty() && output.image_url.is_empty() {
        return Err(HttpError::for_not_found(None, String::new()));
    }

    if output.is_expired {
        return Err(HttpError::for_client_error(
            None,
            StatusCode::CONFLICT,
            "output is expired".into(),
        ));
    }

    let download_count = output.download_count + 1;

    let updatable_fields = storage::outputs::UpdatableFields {
        download_count: Some(download_count as i64),
        modified: Some(epoch_milli().to_string()),
        ..Default::default()
    };

    if let Err(e) = storage::outputs::update(&mut conn, output_id, updatable_fields).await {
        return Err(http_error!(
            "Could not update object in database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    let resp = DownloadOutputResponse {
        download_url: output.download_url,
        checksum: output.checksum,
        file_size_bytes: output.file_size_bytes,
        download_count,
    };
    Ok(HttpResponseOk(resp))
}

/// Mark an output expired by hand.
///
/// The artifact itself is untouched; only the bookkeeping changes.
#[endpoint(
    method = POST,
    path = "/api/runs/{run_id}/outputs/{output_id}/expire",
    tags = ["Outputs"],
)]
pub async fn expire_output(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<OutputPathArgs>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let output_id: i64 = path.output_id.try_into().map_err(|err| {
        HttpError::for_bad_request(
            None,
            format!("Could not successfully parse 'output_id'. Must be a positive integer; {err}"),
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

    // Confirms existence and run ownership before the blind update below.
    get_output_checked(&mut conn, &rqctx.request_id, path.run_id, output_id).await?;

    let updatable_fields = storage::outputs::UpdatableFields {
        status: Some(OutputStatus::Expired.to_string()),
        modified: Some(epoch_milli().to_string()),
        ..Default::default()
    };

    if let Err(e) = storage::outputs::update(&mut conn, output_id, updatable_fields).await {
        return Err(http_error!(
            "Could not update object in database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    Ok(HttpResponseUpdatedNoContent())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_output_is_expired() {
        let now = 1_000_000;

        assert!(!output_is_expired(&OutputStatus::Available, 0, now));
        assert!(!output_is_expired(&OutputStatus::Available, now + 1, now));
        assert!(output_is_expired(&OutputStatus::Available, now, now));
        assert!(output_is_expired(&OutputStatus::Available, now - 1, now));

        // A hand-expired output stays expired no matter the timestamp.
        assert!(output_is_expired(&OutputStatus::Expired, 0, now));
    }

    #[test]
    fn test_download_url_prefers_file_url() {
        let storage_output = storage::outputs::Output {
            output_id: 3,
            run_id: 7,
            output_type: "zip".into(),
            status: "available".into(),
            file_path: "/var/lib/brandforge/outputs/7.zip".into(),
            file_url: "https://cdn.example.com/7.zip".into(),
            image_url: "".into(),
            file_size_bytes: Some(1024),
            checksum: "sha256:deadbeef".into(),
            download_count: 0,
            expires: "0".into(),
            build_metadata: "{}".into(),
            created: "100".into(),
            modified: "0".into(),
        };

        let output = Output::try_from(storage_output.clone()).unwrap();
        assert_eq!(output.download_url, "https://cdn.example.com/7.zip");

        let output = Output::try_from(storage::outputs::Output {
            file_url: "".into(),
            ..storage_output
        })
        .unwrap();
        assert_eq!(output.download_url, "/api/runs/7/outputs/3/download");
    }

    #[test]
    fn test_synthesized_download_url() {
        assert_eq!(
            synthesized_download_url(12, 4),
            "/api/runs/12/outputs/4/download"
        );
    }
}
