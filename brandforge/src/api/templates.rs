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
use sqlx::Acquire;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TemplatePathArgs {
    /// The unique identifier for the target template.
    pub template_id: String,
}

/// A branding template bundles everything needed to restyle the upstream frontend: plain
/// string replacements, css variable overrides, and free-form css appended at the end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Template {
    /// The unique identifier for the template.
    pub template_id: String,

    /// A short description of what the template styles.
    pub description: String,

    /// The product name substituted into the frontend.
    pub brand_name: String,

    /// Literal string replacements applied to the source tree, keyed by the text to find.
    pub replacement_rules: HashMap<String, String>,

    /// Css custom property overrides, keyed by variable name.
    pub css_variables: HashMap<String, String>,

    /// Raw css appended after the variable overrides.
    pub custom_css: String,

    /// Whether runs fall back to this template when none is named. At most one template
    /// holds this marker.
    pub is_default: bool,

    /// Whether new runs may use this template.
    pub is_active: bool,

    /// Free-form key/value labels attached by the user.
    pub metadata: HashMap<String, String>,

    /// Time of template creation in epoch milliseconds.
    pub created: u64,

    /// Time of last template modification in epoch milliseconds.
    pub modified: u64,
}

impl TryFrom<storage::templates::Template> for Template {
    type Error = anyhow::Error;

    fn try_from(value: storage::templates::Template) -> Result<Self> {
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

        let replacement_rules =
            serde_json::from_str(&value.replacement_rules).with_context(|| {
                format!(
                    "Could not parse field 'replacement_rules' from storage value; '{:#?}'",
                    value.replacement_rules
                )
            })?;

        let css_variables = serde_json::from_str(&value.css_variables).with_context(|| {
            format!(
                "Could not parse field 'css_variables' from storage value; '{:#?}'",
                value.css_variables
            )
        })?;

        let metadata = serde_json::from_str(&value.metadata).with_context(|| {
            format!(
                "Could not parse field 'metadata' from storage value; '{:#?}'",
                value.metadata
            )
        })?;

        Ok(Template {
            template_id: value.template_id,
            description: value.description,
            brand_name: value.brand_name,
            replacement_rules,
            css_variables,
            custom_css: value.custom_css,
            is_default: value.is_default,
            is_active: value.is_active,
            metadata,
            created,
            modified,
        })
    }
}

impl TryFrom<Template> for storage::templates::Template {
    type Error = anyhow::Error;

    fn try_from(value: Template) -> Result<Self> {
        let replacement_rules =
            serde_json::to_string(&value.replacement_rules).with_context(|| {
                format!(
                    "Could not parse field 'replacement_rules' to storage value; '{:#?}'",
                    value.replacement_rules
                )
            })?;

        let css_variables = serde_json::to_string(&value.css_variables).with_context(|| {
            format!(
                "Could not parse field 'css_variables' to storage value; '{:#?}'",
                value.css_variables
            )
        })?;

        let metadata = serde_json::to_string(&value.metadata).with_context(|| {
            format!(
                "Could not parse field 'metadata' to storage value; '{:#?}'",
                value.metadata
            )
        })?;

        Ok(Self {
            template_id: value.template_id,
            description: value.description,
            brand_name: value.brand_name,
            replacement_rules,
            css_variables,
            custom_css: value.custom_css,
            is_default: value.is_default,
            is_active: value.is_active,
            metadata,
            created: value.created.to_string(),
            modified: value.modified.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListTemplatesResponse {
    /// A list of all templates.
    pub templates: Vec<Template>,
}

/// List all templates.
#[endpoint(
    method = GET,
    path = "/api/templates",
    tags = ["Templates"],
)]
pub async fn list_templates(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<ListTemplatesResponse>, HttpError> {
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

    let storage_templates = match storage::templates::list(&mut conn).await {
        Ok(templates) => templates,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            ));
        }
    };

    let mut templates: Vec<Template> = vec![];

    for storage_template in storage_templates {
        let template = Template::try_from(storage_template).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            )
        })?;

        templates.push(template);
    }

    let resp = ListTemplatesResponse { templates };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateTemplateRequest {
    /// The unique identifier for the template. Must be between 3 and 32 characters and
    /// only alphanumeric or underscores.
    pub template_id: String,

    /// A short description of what the template styles.
    pub description: String,

    /// The product name substituted into the frontend.
    pub brand_name: String,

    /// Literal string replacements applied to the source tree, keyed by the text to find.
    pub replacement_rules: Option<HashMap<String, String>>,

    /// Css custom property overrides, keyed by variable name.
    pub css_variables: Option<HashMap<String, String>>,

    /// Raw css appended after the variable overrides.
    pub custom_css: Option<String>,

    /// Make this the fallback template for runs that don't name one. Clears the marker
    /// from whichever template previously held it.
    pub is_default: Option<bool>,

    /// Free-form key/value labels attached by the user.
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateTemplateResponse {
    /// The template that was created.
    pub template: Template,
}

/// Create a new template.
#[endpoint(
    method = POST,
    path = "/api/templates",
    tags = ["Templates"],
)]
pub async fn create_template(
    rqctx: RequestContext<Arc<ApiState>>,
    body: TypedBody<CreateTemplateRequest>,
) -> Result<HttpResponseCreated<CreateTemplateResponse>, HttpError> {
    let api_state = rqctx.context();
    let body = body.into_inner();

    validate::arg(
        "template_id",
        body.template_id.clone(),
        vec![validate::is_valid_identifier],
    )?;
    validate::arg(
        "brand_name",
        body.brand_name.clone(),
        vec![validate::not_empty_str],
    )?;

    let template = Template {
        template_id: body.template_id,
        description: body.description,
        brand_name: body.brand_name,
        replacement_rules: body.replacement_rules.unwrap_or_default(),
        css_variables: body.css_variables.unwrap_or_default(),
        custom_css: body.custom_css.unwrap_or_default(),
        is_default: body.is_default.unwrap_or_default(),
        is_active: true,
        metadata: body.metadata.unwrap_or_default(),
        created: epoch_milli(),
        modified: 0,
    };

    let storage_template =
        storage::templates::Template::try_from(template.clone()).map_err(|e| {
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

    // Demoting the old default and inserting the new template must land together.
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

    if template.is_default {
        if let Err(e) = storage::templates::clear_default(&mut tx).await {
            return Err(http_error!(
                "Could not update objects in database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            ));
        }
    }

    if let Err(e) = storage::templates::insert(&mut tx, &storage_template).await {
        match e {
            storage::StorageError::Exists => {
                return Err(HttpError::for_client_error(
                    None,
                    StatusCode::CONFLICT,
                    "template entry already exists".into(),
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

    if let Err(e) = tx.commit().await {
        return Err(http_error!(
            "Could not commit transaction to database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        ));
    }

    let resp = CreateTemplateResponse { template };
    Ok(HttpResponseCreated(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetTemplateResponse {
    /// The template requested.
    pub template: Template,
}

/// Get template by id.
#[endpoint(
    method = GET,
    path = "/api/templates/{template_id}",
    tags = ["Templates"],
)]
pub async fn get_template(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<TemplatePathArgs>,
) -> Result<HttpResponseOk<GetTemplateResponse>, HttpError> {
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

    let storage_template = match storage::templates::get(&mut conn, &path.template_id).await {
        Ok(template) => template,
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

    let template = Template::try_from(storage_template).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        )
    })?;

    let resp = GetTemplateResponse { template };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdateTemplateRequest {
    /// A short description of what the template styles.
    pub description: Option<String>,

    /// The product name substituted into the frontend.
    pub brand_name: Option<String>,

    /// Literal string replacements applied to the source tree, keyed by the text to find.
    pub replacement_rules: Option<HashMap<String, String>>,

    /// Css custom property overrides, keyed by variable name.
    pub css_variables: Option<HashMap<String, String>>,

    /// Raw css appended after the variable overrides.
    pub custom_css: Option<String>,

    /// Make this the fallback template for runs that don't name one. Clears the marker
    /// from whichever template previously held it.
    pub is_default: Option<bool>,

    /// Whether new runs may use this template.
    pub is_active: Option<bool>,

    /// Free-form key/value labels attached by the user.
    pub metadata: Option<HashMap<String, String>>,
}

/// Update a template's details.
#[endpoint(
    method = PATCH,
    path = "/api/templates/{template_id}",
    tags = ["Templates"],
)]
pub async fn update_template(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<TemplatePathArgs>,
    body: TypedBody<UpdateTemplateRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
    let body = body.into_inner();

    let replacement_rules = body
        .replacement_rules
        .map(|rules| serde_json::to_string(&rules))
        .transpose()
        .map_err(|e| {
            http_error!(
                "Could not parse object into database value",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            )
        })?;

    let css_variables = body
        .css_variables
        .map(|variables| serde_json::to_string(&variables))
        .transpose()
        .map_err(|e| {
            http_error!(
                "Could not parse object into database value",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            )
        })?;

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

    let updatable_fields = storage::templates::UpdatableFields {
        description: body.description,
        brand_name: body.brand_name,
        replacement_rules,
        css_variables,
        custom_css: body.custom_css,
        is_default: body.is_default,
        is_active: body.is_active,
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

    // Make sure the template exists before touching the default marker.
    if let Err(e) = storage::templates::get(&mut tx, &path.template_id).await {
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

    if body.is_default == Some(true) {
        if let Err(e) = storage::templates::clear_default(&mut tx).await {
            return Err(http_error!(
                "Could not update objects in database",
                StatusCode::INTERNAL_SERVER_ERROR,
                rqctx.request_id.clone(),
                Some(e.into())
            ));
        }
    }

    if let Err(e) = storage::templates::update(&mut tx, &path.template_id, updatable_fields).await {
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

    Ok(HttpResponseUpdatedNoContent())
}

/// Delete template by id.
#[endpoint(
    method = DELETE,
    path = "/api/templates/{template_id}",
    tags = ["Templates"],
)]
pub async fn delete_template(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<TemplatePathArgs>,
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

    if let Err(e) = storage::templates::delete(&mut conn, &path.template_id).await {
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DuplicateTemplateRequest {
    /// The identifier the copy will be created under. Must be between 3 and 32 characters
    /// and only alphanumeric or underscores.
    pub new_template_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DuplicateTemplateResponse {
    /// The copy that was created.
    pub template: Template,
}

/// Copy an existing template under a new id.
///
/// The copy carries all styling values but never the default marker.
#[endpoint(
    method = POST,
    path = "/api/templates/{template_id}/duplicate",
    tags = ["Templates"],
)]
pub async fn duplicate_template(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<TemplatePathArgs>,
    body: TypedBody<DuplicateTemplateRequest>,
) -> Result<HttpResponseCreated<DuplicateTemplateResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
    let body = body.into_inner();

    validate::arg(
        "new_template_id",
        body.new_template_id.clone(),
        vec![validate::is_valid_identifier],
    )?;

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

    let storage_template = match storage::templates::get(&mut conn, &path.template_id).await {
        Ok(template) => template,
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

    let source = Template::try_from(storage_template).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e.into())
        )
    })?;

    let copy = Template {
        template_id: body.new_template_id,
        is_default: false,
        created: epoch_milli(),
        modified: 0,
        ..source
    };

    let storage_copy = storage::templates::Template::try_from(copy.clone()).map_err(|e| {
        http_error!(
            "Could not parse object into database value",
            StatusCode::INTERNAL_SERVER_ERROR,
            rqctx.request_id.clone(),
            Some(e)
        )
    })?;

    if let Err(e) = storage::templates::insert(&mut conn, &storage_copy).await {
        match e {
            storage::StorageError::Exists => {
                return Err(HttpError::for_client_error(
                    None,
                    StatusCode::CONFLICT,
                    "template entry already exists".into(),
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

    let resp = DuplicateTemplateResponse { template: copy };
    Ok(HttpResponseCreated(resp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_template() -> Template {
        Template {
            template_id: "acme_dark".into(),
            description: "dark theme for acme".into(),
            brand_name: "Acme Chat".into(),
            replacement_rules: HashMap::from([("Open WebUI".to_string(), "Acme Chat".to_string())]),
            css_variables: HashMap::from([("--primary".to_string(), "#222222".to_string())]),
            custom_css: "body { font-family: Inter; }".into(),
            is_default: true,
            is_active: true,
            metadata: HashMap::new(),
            created: 1000,
            modified: 0,
        }
    }

    #[test]
    fn test_template_round_trips_through_storage() {
        let template = test_template();

        let stored = storage::templates::Template::try_from(template.clone()).unwrap();
        assert_eq!(stored.replacement_rules, r#"{"Open WebUI":"Acme Chat"}"#);

        let recovered = Template::try_from(stored).unwrap();
        assert_eq!(recovered, template);
    }

    #[test]
    fn test_duplicate_copies_values_but_not_default_marker() {
        let source = test_template();

        let copy = Template {
            template_id: "acme_dark_copy".into(),
            is_default: false,
            created: 2000,
            modified: 0,
            ..source.clone()
        };

        assert_eq!(copy.brand_name, source.brand_name);
        assert_eq!(copy.replacement_rules, source.replacement_rules);
        assert_eq!(copy.css_variables, source.css_variables);
        assert_eq!(copy.custom_css, source.custom_css);
        assert!(!copy.is_default);
    }
}
