use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Template {
    pub template_id: String,
    pub description: String,
    pub brand_name: String,
    pub replacement_rules: String,
    pub css_variables: String,
    pub custom_css: String,
    pub is_default: bool,
    pub is_active: bool,
    pub metadata: String,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub description: Option<String>,
    pub brand_name: Option<String>,
    pub replacement_rules: Option<String>,
    pub css_variables: Option<String>,
    pub custom_css: Option<String>,
    pub is_default: Option<bool>,
    pub is_active: Option<bool>,
    pub metadata: Option<String>,
    pub modified: Option<String>,
}

pub async fn insert(conn: &mut SqliteConnection, template: &Template) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO templates (template_id, description, brand_name, replacement_rules, \
        css_variables, custom_css, is_default, is_active, metadata, created, modified) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&template.template_id)
    .bind(&template.description)
    .bind(&template.brand_name)
    .bind(&template.replacement_rules)
    .bind(&template.css_variables)
    .bind(&template.custom_css)
    .bind(template.is_default)
    .bind(template.is_active)
    .bind(&template.metadata)
    .bind(&template.created)
    .bind(&template.modified);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Template>, StorageError> {
    let query = sqlx::query_as::<_, Template>(
        "SELECT template_id, description, brand_name, replacement_rules, css_variables, \
        custom_css, is_default, is_active, metadata, created, modified FROM templates \
        ORDER BY template_id;",
    );

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, template_id: &str) -> Result<Template, StorageError> {
    let query = sqlx::query_as::<_, Template>(
        "SELECT template_id, description, brand_name, replacement_rules, css_variables, \
        custom_css, is_default, is_active, metadata, created, modified FROM templates \
        WHERE template_id = ?;",
    )
    .bind(template_id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Clears the default marker on every template. Run inside the same transaction as the update
/// that promotes a new default so only one template ever holds it.
pub async fn clear_default(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    let query = sqlx::query("UPDATE templates SET is_default = 0 WHERE is_default = 1;");

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    template_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE templates SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.description {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("description = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.brand_name {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("brand_name = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.replacement_rules {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("replacement_rules = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.css_variables {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("css_variables = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.custom_css {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("custom_css = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.is_default {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("is_default = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.is_active {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("is_active = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.metadata {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("metadata = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.modified {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("modified = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    // If no fields were updated, return an error
    if updated_fields_total == 0 {
        return Err(StorageError::NoFieldsUpdated);
    }

    update_query.push(" WHERE template_id = ");
    update_query.push_bind(template_id);
    update_query.push(";");

    let update_query = update_query.build();

    let sql = update_query.sql();

    let rows_updated = update_query
        .execute(conn)
        .await
        .map_err(|e| map_sqlx_error(e, sql))?
        .rows_affected();

    if rows_updated == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

pub async fn delete(conn: &mut SqliteConnection, template_id: &str) -> Result<(), StorageError> {
    let query = sqlx::query("DELETE FROM templates WHERE template_id = ?;").bind(template_id);

    let sql = query.sql();

    let rows_deleted = query
        .execute(conn)
        .map_ok(|result| result.rows_affected())
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    if rows_deleted == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;
    use sqlx::{pool::PoolConnection, Sqlite};

    async fn setup() -> Result<(TestHarness, PoolConnection<Sqlite>), Box<dyn std::error::Error>> {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        let template = Template {
            template_id: "acme_dark".into(),
            description: "dark theme for acme".into(),
            brand_name: "Acme Chat".into(),
            replacement_rules: r#"{"Open WebUI":"Acme Chat"}"#.into(),
            css_variables: r##"{"--primary":"#222222"}"##.into(),
            custom_css: "".into(),
            is_default: true,
            is_active: true,
            metadata: "{}".into(),
            created: "0".into(),
            modified: "0".into(),
        };

        insert(&mut conn, &template).await?;

        Ok((harness, conn))
    }

    #[tokio::test]
    async fn test_get_template() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let template = get(&mut conn, "acme_dark")
            .await
            .expect("Failed to get template");

        assert_eq!(template.brand_name, "Acme Chat");
        assert!(template.is_default);
    }

    #[tokio::test]
    async fn test_clear_default() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        clear_default(&mut conn)
            .await
            .expect("Failed to clear default marker");

        let template = get(&mut conn, "acme_dark")
            .await
            .expect("Failed to get template");

        assert!(!template.is_default);
    }

    #[tokio::test]
    async fn test_update_template() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            brand_name: Some("Acme Chat Pro".into()),
            custom_css: Some("body { color: red; }".into()),
            modified: Some("100".into()),
            ..Default::default()
        };

        update(&mut conn, "acme_dark", fields_to_update)
            .await
            .expect("Failed to update template");

        let updated = get(&mut conn, "acme_dark")
            .await
            .expect("Failed to retrieve updated template");

        assert_eq!(updated.brand_name, "Acme Chat Pro");
        assert_eq!(updated.custom_css, "body { color: red; }");
    }

    #[tokio::test]
    async fn test_delete_template() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        delete(&mut conn, "acme_dark")
            .await
            .expect("Failed to delete template");

        assert!(
            get(&mut conn, "acme_dark").await.is_err(),
            "Template was not deleted"
        );
    }
}
