use crate::{
    api::{
        epoch_milli,
        repositories::VerificationStatus,
        validate, ApiState,
    },
    http_error, storage,
};
use anyhow::{Context, Result};
use dropshot::{
    endpoint, HttpError, HttpResponseCreated, HttpResponseDeleted, HttpResponseOk,
    HttpResponseUpdatedNoContent, Path, RequestContext, TypedBody,
};
use http::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use strum::{Display, EnumString};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RegistryPathArgs {
    /// The unique identifier for the target registry.
    pub registry_id: String,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[schemars(rename = "registry_type")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum RegistryType {
    #[default]
    Generic,
    DockerHub,
    AwsEcr,
    QuayIo,
    GithubRegistry,
    GitlabRegistry,
    AzureRegistry,
    GoogleRegistry,
}

/// A registry is a push target for branded container images.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Registry {
    /// The unique identifier for the registry.
    pub registry_id: String,

    /// A short description of what the registry is used for.
    pub description: String,

    /// Which registry provider this is.
    pub registry_type: RegistryType,

    /// The base url of the registry api.
    pub registry_url: String,

    /// The image repository pushed images land in.
    pub repository_name: String,

    /// The upstream image builds start from.
    pub base_image: String,

    /// The fully qualified name pushed images are tagged with.
    pub target_image: String,

    /// The credential used to authenticate pushes, if the registry is private.
    pub credential_id: Option<String>,

    /// Whether new runs may push to this registry.
    pub is_active: bool,

    /// Result of the last reachability check.
    pub verification_status: VerificationStatus,

    /// Human readable detail accompanying the verification status.
    pub verification_message: String,

    /// Free-form key/value labels attached by the user.
    pub metadata: HashMap<String, String>,

    /// Time of registry creation in epoch milliseconds.
    pub created: u64,

    /// Time of last registry modification in epoch milliseconds.
    pub modified: u64,
}

impl TryFrom<storage::registries::Registry> for Registry {
    type Error = anyhow::Error;

    fn try_from(value: storage::registries::Registry) -> Result<Self> {
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

        let registry_type = RegistryType::from_str(&value.registry_type).with_context(|| {
            format!(
                "Could not parse field 'registry_type' from storage value '{}'",
                value.registry_type
            )
        })?;

        let verification_status = VerificationStatus::from_str(&value.verification_status)
            .with_context(|| {
                format!(
                    "Could not parse field 'verification_status' from storage value '{}'",
                    value.verification_status
                )
            })?;

        let metadata = serde_json::from_str(&value.metadata).with_context(|| {
            format!(
                "Could not parse field 'metadata' from storage value; '{:#?}'",
                value.metadata
            )
        })?;

        Ok(Registry {
            registry_id: value.registry_id,
            description: value.description,
            registry_type,
            registry_url: value.registry_url,
            repository_name: value.repository_name,
            base_image: value.base_image,
            target_image: value.target_image,
            credential_id: value.credential_id,
            is_active: value.is_active,
            verification_status,
            verification_message: value.verification_message,
            metadata,
            created,
            modified,
        })
    }
}

impl TryFrom<Registry> for storage::registries::Registry {
    type Error = anyhow::Error;

    fn try_from(value: Registry) -> Result<Self> {
        let metadata = serde_json::to_string(&value.metadata).with_context(|| {
            format!(
                "Could not parse field 'metadata' to storage value; '{:#?}'",
                value.metadata
            )
        })?;

        Ok(Self {
            registry_id: value.registry_id,
            description: value.description,
            registry_type: value.registry_type.to_string(),
            registry_url: value.registry_url,
            repository_name: value.repository_name,
            base_image: value.base_image,
            target_image: value.target_image,
            credential_id: value.credential_id,
            is_active: value.is_active,
            verification_status: value.verification_status.to_string(),
            verification_message: value.verification_message,
            metadata,
            created: value.created.to_string(),
            modified: value.modified.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListRegistriesResponse {
    /// A list of all registries.
    pub registries: Vec<Registry>,
}

/// List all registries.
#[endpoint(
    method = GET,
    path = "/api/registries",
    tags = ["Registries"],
)]
pub async fn list_registries(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<ListRegistriesResponse>, HttpError> {
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

    let storage_registries = match storage::registries::list(&mut conn).await {
        Ok(registries) => registries,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            ));
        }
    };

    let mut registries: Vec<Registry> = vec![];

    for storage_registry in storage_registries {
        let registry = Registry::try_from(storage_registry).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            )
        })?;

        registries.push(registry);
    }

    let resp = ListRegistriesResponse { registries };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateRegistryRequest {
    /// The unique identifier for the registry. Must be between 3 and 32 characters and
    /// only alphanumeric or underscores.
    pub registry_id: String,

    /// A short description of what the registry is used for.
    pub description: String,

    /// Which registry provider this is.
    pub registry_type: RegistryType,

    /// The base url of the registry api. Hosted providers with a fixed public endpoint
    /// may omit it; everything else must name one.
    pub registry_url: Option<String>,

    /// The image repository pushed images land in.
    pub repository_name: String,

    /// The upstream image builds start from.
    pub base_image: String,

    /// The fully qualified name pushed images are tagged with.
    pub target_image: String,

    /// The credential used to authenticate pushes, if the registry is private.
    pub credential_id: Option<String>,

    /// Free-form key/value labels attached by the user.
    pub metadata: Option<HashMap<String, String>>,
}

/// The well-known api base for hosted registry providers. Providers whose endpoint
/// depends on the account (ecr, acr, gcr) have no fixed default, and neither do generic
/// registries.
pub fn default_registry_url(registry_type: &RegistryType) -> Option<String> {
    match registry_type {
        RegistryType::DockerHub => Some("https://registry-1.docker.io".into()),
        RegistryType::QuayIo => Some("https://quay.io".into()),
        RegistryType::GithubRegistry => Some("https://ghcr.io".into()),
        RegistryType::GitlabRegistry => Some("https://registry.gitlab.com".into()),
        RegistryType::Generic
        | RegistryType::AwsEcr
        | RegistryType::AzureRegistry
        | RegistryType::GoogleRegistry => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateRegistryResponse {
    /// The registry that was created.
    pub registry: Registry,
}

/// Create a new registry.
#[endpoint(
    method = POST,
    path = "/api/registries",
    tags = ["Registries"],
)]
pub async fn create_registry(
    rqctx: RequestContext<Arc<ApiState>>,
    body: TypedBody<CreateRegistryRequest>,
) -> Result<HttpResponseCreated<CreateRegistryResponse>, HttpError> {
    let api_state = rqctx.context();
    let body = body.into_inner();

    validate::arg(
        "registry_id",
        body.registry_id.clone(),
        vec![validate::is_valid_identifier],
    )?;
    validate::arg(
        "repository_name",
        body.repository_name.clone(),
        vec![validate::not_empty_str],
    )?;

    let registry_url = match body.registry_url.filter(|url| !url.is_empty()) {
        Some(url) => url,
        None => default_registry_url(&body.registry_type).ok_or_else(|| {
            HttpError::for_bad_request(
                None,
                format!(
                    "registry_url is required for '{}' registries",
                    body.registry_type
                ),
            )
        })?,
    };

    let registry = Registry {
        registry_id: body.registry_id,
        description: body.description,
        registry_type: body.registry_type,
        registry_url,
        repository_name: body.repository_name,
        base_image: body.base_image,
        target_image: body.target_image,
        credential_id: body.credential_id,
        is_active: true,
        verification_status: VerificationStatus::Pending,
        verification_message: String::new(),
        metadata: body.metadata.unwrap_or_default(),
        created: epoch_milli(),
        modified: 0,
    };

    let storage_registry =
        storage::registries::Registry::try_from(registry.clone()).map_err(|e| {
            http_error!(
                "Could not parse object into database value",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e)
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

    if let Err(e) = storage::registries::insert(&mut conn, &storage_registry).await {
        match e {
            storage::StorageError::Exists => {
                return Err(HttpError::for_client_error(
                    None,
                    StatusCode::CONFLICT,
                    "registry entry already exists".into(),
                ));
            }
            storage::StorageError::ForeignKeyViolation => {
                return Err(HttpError::for_bad_request(
                    None,
                    "credential_id given does not exist".into(),
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
        }
    };

    let resp = CreateRegistryResponse { registry };
    Ok(HttpResponseCreated(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetRegistryResponse {
    /// The registry requested.
    pub registry: Registry,
}

/// Get registry by id.
#[endpoint(
    method = GET,
    path = "/api/registries/{registry_id}",
    tags = ["Registries"],
)]
pub async fn get_registry(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RegistryPathArgs>,
) -> Result<HttpResponseOk<GetRegistryResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

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

    let storage_registry = match storage::registries::get(&mut conn, &path.registry_id).await {
        Ok(registry) => registry,
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

    let registry = Registry::try_from(storage_registry).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        )
    })?;

    let resp = GetRegistryResponse { registry };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdateRegistryRequest {
    /// A short description of what the registry is used for.
    pub description: Option<String>,

    /// The base url of the registry api. Changing it resets verification back to pending.
    pub registry_url: Option<String>,

    /// The image repository pushed images land in.
    pub repository_name: Option<String>,

    /// The upstream image builds start from.
    pub base_image: Option<String>,

    /// The fully qualified name pushed images are tagged with.
    pub target_image: Option<String>,

    /// The credential used to authenticate pushes. An explicit null detaches the current
    /// credential.
    pub credential_id: Option<Option<String>>,

    /// Whether new runs may push to this registry.
    pub is_active: Option<bool>,

    /// Free-form key/value labels attached by the user.
    pub metadata: Option<HashMap<String, String>>,
}

/// Update a registry's details.
#[endpoint(
    method = PATCH,
    path = "/api/registries/{registry_id}",
    tags = ["Registries"],
)]
pub async fn update_registry(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RegistryPathArgs>,
    body: TypedBody<UpdateRegistryRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
    let body = body.into_inner();

    let metadata = body
        .metadata
        .map(|metadata| serde_json::to_string(&metadata))
        .transpose()
        .map_err(|e| {
            http_error!(
                "Could not parse object into database value",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            )
        })?;

    let verification_status = body
        .registry_url
        .is_some()
        .then(|| VerificationStatus::Pending.to_string());

    let updatable_fields = storage::registries::UpdatableFields {
        description: body.description,
        registry_url: body.registry_url,
        repository_name: body.repository_name,
        base_image: body.base_image,
        target_image: body.target_image,
        credential_id: body.credential_id,
        is_active: body.is_active,
        verification_status,
        verification_message: None,
        metadata,
        modified: Some(epoch_milli().to_string()),
    };

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

    if let Err(e) = storage::registries::update(&mut conn, &path.registry_id, updatable_fields).await
    {
        match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(None, String::new()));
            }
            storage::StorageError::ForeignKeyViolation => {
                return Err(HttpError::for_bad_request(
                    None,
                    "credential_id given does not exist".into(),
                ));
            }
            _ => {
                return Err(http_error!(
                    "Could not update object in database",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    rqctx.request_id.clone(),
                    Some(e.into())
                ));
            }
        }
    }

    Ok(HttpResponseUpdatedNoContent())
}

/// Delete registry by id.
#[endpoint(
    method = DELETE,
    path = "/api/registries/{registry_id}",
    tags = ["Registries"],
)]
pub async fn delete_registry(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RegistryPathArgs>,
) -> Result<HttpResponseDeleted, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

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

    if let Err(e) = storage::registries::delete(&mut conn, &path.registry_id).await {
        match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(None, String::new()));
            }
            _ => {
                return Err(http_error!(
                    "Could not delete object from database",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    rqctx.request_id.clone(),
                    Some(e.into())
                ));
            }
        }
    }

    Ok(HttpResponseDeleted())
}

/// Checks whether a registry answers the v2 distribution api root.
async fn probe_registry(client: &reqwest::Client, registry_url: &str) -> Result<()> {
    let probe_url = format!("{}/v2/", registry_url.trim_end_matches('/'));

    let response = client
        .get(&probe_url)
        .send()
        .await
        .with_context(|| format!("Could not reach registry '{probe_url}'"))?;

    // A 401 from /v2/ is the standard unauthenticated answer from a healthy registry.
    if response.status().is_success() || response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Ok(());
    }

    anyhow::bail!(
        "registry '{probe_url}' answered with status {}",
        response.status()
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TestRegistryConnectionResponse {
    /// The registry with its verification fields refreshed.
    pub registry: Registry,
}

/// Check that the registry is reachable.
#[endpoint(
    method = POST,
    path = "/api/registries/{registry_id}/test-connection",
    tags = ["Registries"],
)]
pub async fn test_registry_connection(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<RegistryPathArgs>,
) -> Result<HttpResponseOk<TestRegistryConnectionResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

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

    let storage_registry = match storage::registries::get(&mut conn, &path.registry_id).await {
        Ok(registry) => registry,
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

    let mut registry = Registry::try_from(storage_registry).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        )
    })?;

    let (verification_status, verification_message) =
        match probe_registry(&api_state.client, &registry.registry_url).await {
            Ok(()) => (VerificationStatus::Verified, "registry reachable".into()),
            Err(e) => {
                debug!(registry_id = %registry.registry_id, error = %e, "Registry probe failed");
                (VerificationStatus::Failed, format!("{e:#}"))
            }
        };

    registry.verification_status = verification_status.clone();
    registry.verification_message = verification_message.clone();
    registry.modified = epoch_milli();

    let updatable_fields = storage::registries::UpdatableFields {
        verification_status: Some(verification_status.to_string()),
        verification_message: Some(verification_message),
        modified: Some(registry.modified.to_string()),
        ..Default::default()
    };

    if let Err(e) =
        storage::registries::update(&mut conn, &path.registry_id, updatable_fields).await
    {
        return Err(http_error!(
            "Could not update object in database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    let resp = TestRegistryConnectionResponse { registry };
    Ok(HttpResponseOk(resp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_registry_url() {
        assert_eq!(
            default_registry_url(&RegistryType::DockerHub).as_deref(),
            Some("https://registry-1.docker.io")
        );
        assert_eq!(
            default_registry_url(&RegistryType::GithubRegistry).as_deref(),
            Some("https://ghcr.io")
        );

        // Account-scoped providers and generic registries need an explicit url.
        assert_eq!(default_registry_url(&RegistryType::Generic), None);
        assert_eq!(default_registry_url(&RegistryType::AwsEcr), None);
    }
}
