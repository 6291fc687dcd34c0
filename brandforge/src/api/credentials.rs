use crate::{
    api::{epoch_milli, validate, ApiState},
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
use sha2::{Digest, Sha256};
use std::{str::FromStr, sync::Arc};
use strum::{Display, EnumString};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CredentialPathArgs {
    /// The unique identifier for the target credential.
    pub credential_id: String,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[schemars(rename = "credential_type")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum CredentialType {
    #[default]
    Custom,

    /// Private key used to clone over ssh.
    GitSshKey,

    /// Personal access token used to clone over https.
    GitHttpsToken,

    GitUsernamePassword,
    DockerHub,
    AwsEcr,
    QuayIo,
    GenericRegistry,
    ApiKey,
    OauthToken,
}

/// A credential is a named secret that repositories and registries reference for
/// authentication. The secret itself is write-only; reads expose a fingerprint instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Credential {
    /// The unique identifier for the credential.
    pub credential_id: String,

    /// A short description of what the credential is used for.
    pub description: String,

    /// What kind of secret this is.
    pub credential_type: CredentialType,

    /// Sha256 hex digest of the secret. Allows callers to tell whether the stored secret
    /// changed without ever reading it back.
    pub fingerprint: String,

    /// Whether the credential can be attached to new objects.
    pub is_active: bool,

    /// Time the credential expires in epoch milliseconds. 0 means it never expires.
    pub expires: u64,

    /// Time of credential creation in epoch milliseconds.
    pub created: u64,

    /// Time of last credential modification in epoch milliseconds.
    pub modified: u64,
}

pub fn fingerprint_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl Credential {
    pub fn new(
        credential_id: &str,
        description: &str,
        credential_type: CredentialType,
        secret: &str,
        expires: u64,
    ) -> Self {
        Credential {
            credential_id: credential_id.into(),
            description: description.into(),
            credential_type,
            fingerprint: fingerprint_secret(secret),
            is_active: true,
            expires,
            created: epoch_milli(),
            modified: 0,
        }
    }
}

impl TryFrom<storage::credentials::Credential> for Credential {
    type Error = anyhow::Error;

    fn try_from(value: storage::credentials::Credential) -> Result<Self> {
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

        let credential_type =
            CredentialType::from_str(&value.credential_type).with_context(|| {
                format!(
                    "Could not parse field 'credential_type' from storage value '{}'",
                    value.credential_type
                )
            })?;

        Ok(Credential {
            credential_id: value.credential_id,
            description: value.description,
            credential_type,
            fingerprint: value.fingerprint,
            is_active: value.is_active,
            expires,
            created,
            modified,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListCredentialsResponse {
    /// A list of all credentials.
    pub credentials: Vec<Credential>,
}

/// List all credentials.
///
/// The secret values themselves are never returned.
#[endpoint(
    method = GET,
    path = "/api/credentials",
    tags = ["Credentials"],
)]
pub async fn list_credentials(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<ListCredentialsResponse>, HttpError> {
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

    let storage_credentials = match storage::credentials::list(&mut conn).await {
        Ok(credentials) => credentials,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            ));
        }
    };

    let mut credentials: Vec<Credential> = vec![];

    for storage_credential in storage_credentials {
        let credential = Credential::try_from(storage_credential).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            )
        })?;

        credentials.push(credential);
    }

    let resp = ListCredentialsResponse { credentials };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateCredentialRequest {
    /// The unique identifier for the credential. Must be between 3 and 32 characters and
    /// only alphanumeric or underscores.
    pub credential_id: String,

    /// A short description of what the credential is used for.
    pub description: String,

    /// What kind of secret this is.
    pub credential_type: CredentialType,

    /// The secret value. Stored but never returned by any endpoint.
    pub secret: String,

    /// Time the credential expires in epoch milliseconds. Omit for a credential that
    /// never expires.
    pub expires: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateCredentialResponse {
    /// The credential that was created.
    pub credential: Credential,
}

/// Create a new credential.
#[endpoint(
    method = POST,
    path = "/api/credentials",
    tags = ["Credentials"],
)]
pub async fn create_credential(
    rqctx: RequestContext<Arc<ApiState>>,
    body: TypedBody<CreateCredentialRequest>,
) -> Result<HttpResponseCreated<CreateCredentialResponse>, HttpError> {
    let api_state = rqctx.context();
    let body = body.into_inner();

    validate::arg(
        "credential_id",
        body.credential_id.clone(),
        vec![validate::is_valid_identifier],
    )?;
    validate::arg("secret", body.secret.clone(), vec![validate::not_empty_str])?;

    let credential = Credential::new(
        &body.credential_id,
        &body.description,
        body.credential_type,
        &body.secret,
        body.expires.unwrap_or_default(),
    );

    let storage_credential = storage::credentials::Credential {
        credential_id: credential.credential_id.clone(),
        description: credential.description.clone(),
        credential_type: credential.credential_type.to_string(),
        secret: body.secret,
        fingerprint: credential.fingerprint.clone(),
        is_active: credential.is_active,
        expires: credential.expires.to_string(),
        created: credential.created.to_string(),
        modified: credential.modified.to_string(),
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

    if let Err(e) = storage::credentials::insert(&mut conn, &storage_credential).await {
        match e {
            storage::StorageError::Exists => {
                return Err(HttpError::for_client_error(
                    None,
                    StatusCode::CONFLICT,
                    "credential entry already exists".into(),
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

    let resp = CreateCredentialResponse { credential };
    Ok(HttpResponseCreated(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetCredentialResponse {
    /// The credential requested.
    pub credential: Credential,
}

/// Get credential by id.
#[endpoint(
    method = GET,
    path = "/api/credentials/{credential_id}",
    tags = ["Credentials"],
)]
pub async fn get_credential(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<CredentialPathArgs>,
) -> Result<HttpResponseOk<GetCredentialResponse>, HttpError> {
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

    let storage_credential = match storage::credentials::get(&mut conn, &path.credential_id).await {
        Ok(credential) => credential,
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

    let credential = Credential::try_from(storage_credential).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        )
    })?;

    let resp = GetCredentialResponse { credential };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdateCredentialRequest {
    /// A short description of what the credential is used for.
    pub description: Option<String>,

    /// Replaces the stored secret value.
    pub secret: Option<String>,

    /// Whether the credential can be attached to new objects.
    pub is_active: Option<bool>,

    /// Time the credential expires in epoch milliseconds.
    pub expires: Option<u64>,
}

/// Update a credential's details.
#[endpoint(
    method = PATCH,
    path = "/api/credentials/{credential_id}",
    tags = ["Credentials"],
)]
pub async fn update_credential(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<CredentialPathArgs>,
    body: TypedBody<UpdateCredentialRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
    let body = body.into_inner();

    if let Some(secret) = &body.secret {
        validate::arg("secret", secret.clone(), vec![validate::not_empty_str])?;
    }

    let fingerprint = body.secret.as_deref().map(fingerprint_secret);

    let updatable_fields = storage::credentials::UpdatableFields {
        description: body.description,
        secret: body.secret,
        fingerprint,
        is_active: body.is_active,
        expires: body.expires.map(|expires| expires.to_string()),
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

    if let Err(e) = storage::credentials::update(&mut conn, &path.credential_id, updatable_fields)
        .await
    {
        match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(None, String::new()));
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

/// Delete credential by id.
///
/// Fails with a conflict if any repository or registry still references the credential.
#[endpoint(
    method = DELETE,
    path = "/api/credentials/{credential_id}",
    tags = ["Credentials"],
)]
pub async fn delete_credential(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<CredentialPathArgs>,
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

    if let Err(e) = storage::credentials::delete(&mut conn, &path.credential_id).await {
        match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(None, String::new()));
            }
            storage::StorageError::ForeignKeyViolation => {
                return Err(HttpError::for_client_error(
                    None,
                    StatusCode::CONFLICT,
                    "credential is still referenced by a repository or registry".into(),
                ));
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fingerprint_is_stable_and_secret_free() {
        let fingerprint = fingerprint_secret("super_secret_value");

        assert_eq!(fingerprint, fingerprint_secret("super_secret_value"));
        assert_ne!(fingerprint, fingerprint_secret("other_value"));
        assert!(!fingerprint.contains("super_secret_value"));
        assert_eq!(fingerprint.len(), 64);
    }

    #[test]
    fn test_credential_type_round_trips_through_storage_strings() {
        let credential_type = CredentialType::GitHttpsToken;
        let stored = credential_type.to_string();

        assert_eq!(stored, "git_https_token");
        assert_eq!(
            CredentialType::from_str(&stored).unwrap(),
            CredentialType::GitHttpsToken
        );
    }

    #[test]
    fn test_credential_model_never_carries_secret() {
        let credential = Credential::new(
            "github_token",
            "token for private forks",
            CredentialType::GitHttpsToken,
            "super_secret_value",
            0,
        );

        let serialized = serde_json::to_string(&credential).unwrap();
        assert!(!serialized.contains("super_secret_value"));
    }
}
