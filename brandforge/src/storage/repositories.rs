use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Repository {
    pub repository_id: String,
    pub description: String,
    pub repository_url: String,
    pub repository_type: String,
    pub default_branch: String,
    pub credential_id: Option<String>,
    pub is_active: bool,
    pub verification_status: String,
    pub verification_message: String,
    pub metadata: String,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub description: Option<String>,
    pub repository_url: Option<String>,
    pub default_branch: Option<String>,
    pub credential_id: Option<Option<String>>,
    pub is_active: Option<bool>,
    pub verification_status: Option<String>,
    pub verification_message: Option<String>,
    pub metadata: Option<String>,
    pub modified: Option<String>,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    repository: &Repository,
) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO repositories (repository_id, description, repository_url, repository_type, \
        default_branch, credential_id, is_active, verification_status, verification_message, \
        metadata, created, modified) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&repository.repository_id)
    .bind(&repository.description)
    .bind(&repository.repository_url)
    .bind(&repository.repository_type)
    .bind(&repository.default_branch)
    .bind(&repository.credential_id)
    .bind(repository.is_active)
    .bind(&repository.verification_status)
    .bind(&repository.verification_message)
    .bind(&repository.metadata)
    .bind(&repository.created)
    .bind(&repository.modified);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Repository>, StorageError> {
    let query = sqlx::query_as::<_, Repository>(
        "SELECT repository_id, description, repository_url, repository_type, default_branch, \
        credential_id, is_active, verification_status, verification_message, metadata, created, \
        modified FROM repositories ORDER BY repository_id;",
    );

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    repository_id: &str,
) -> Result<Repository, StorageError> {
    let query = sqlx::query_as::<_, Repository>(
        "SELECT repository_id, description, repository_url, repository_type, default_branch, \
        credential_id, is_active, verification_status, verification_message, metadata, created, \
        modified FROM repositories WHERE repository_id = ?;",
    )
    .bind(repository_id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    repository_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE repositories SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.description {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("description = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.repository_url {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("repository_url = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.default_branch {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("default_branch = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.credential_id {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("credential_id = ");
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

    if let Some(value) = &fields.verification_status {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("verification_status = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.verification_message {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("verification_message = ");
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

    update_query.push(" WHERE repository_id = ");
    update_query.push_bind(repository_id);
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

pub async fn delete(conn: &mut SqliteConnection, repository_id: &str) -> Result<(), StorageError> {
    let query =
        sqlx::query("DELETE FROM repositories WHERE repository_id = ?;").bind(repository_id);

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

        let credential = crate::storage::credentials::Credential {
            credential_id: "github_token".into(),
            credential_type: "git_https_token".into(),
            is_active: true,
            expires: "0".into(),
            created: "0".into(),
            modified: "0".into(),
            ..Default::default()
        };

        crate::storage::credentials::insert(&mut conn, &credential).await?;

        let repository = Repository {
            repository_id: "openwebui_fork".into(),
            description: "main fork we rebrand".into(),
            repository_url: "https://github.com/example/open-webui.git".into(),
            repository_type: "git".into(),
            default_branch: "main".into(),
            credential_id: Some("github_token".into()),
            is_active: true,
            verification_status: "pending".into(),
            verification_message: "".into(),
            metadata: "{}".into(),
            created: "0".into(),
            modified: "0".into(),
        };

        insert(&mut conn, &repository).await?;

        Ok((harness, conn))
    }

    #[tokio::test]
    async fn test_insert_repository_with_unknown_credential() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let repository = Repository {
            repository_id: "other_fork".into(),
            credential_id: Some("does_not_exist".into()),
            ..Default::default()
        };

        let result = insert(&mut conn, &repository).await;
        assert_eq!(result.unwrap_err(), StorageError::ForeignKeyViolation);
    }

    #[tokio::test]
    async fn test_get_repository() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let repository = get(&mut conn, "openwebui_fork")
            .await
            .expect("Failed to get repository");

        assert_eq!(repository.default_branch, "main");
        assert_eq!(repository.credential_id, Some("github_token".to_string()));
        assert_eq!(repository.verification_status, "pending");
    }

    #[tokio::test]
    async fn test_list_repositories() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let repositories = list(&mut conn).await.expect("Failed to list repositories");

        assert_eq!(repositories.len(), 1);
        assert_eq!(repositories[0].repository_id, "openwebui_fork");
    }

    #[tokio::test]
    async fn test_update_repository() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            default_branch: Some("develop".into()),
            verification_status: Some("verified".into()),
            verification_message: Some("repository reachable".into()),
            credential_id: Some(None),
            modified: Some("100".into()),
            ..Default::default()
        };

        update(&mut conn, "openwebui_fork", fields_to_update)
            .await
            .expect("Failed to update repository");

        let updated = get(&mut conn, "openwebui_fork")
            .await
            .expect("Failed to retrieve updated repository");

        assert_eq!(updated.default_branch, "develop");
        assert_eq!(updated.verification_status, "verified");
        assert_eq!(updated.credential_id, None);
    }

    #[tokio::test]
    async fn test_delete_referenced_credential_rejected() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let result = crate::storage::credentials::delete(&mut conn, "github_token").await;
        assert_eq!(result.unwrap_err(), StorageError::ForeignKeyViolation);
    }

    #[tokio::test]
    async fn test_delete_repository() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        delete(&mut conn, "openwebui_fork")
            .await
            .expect("Failed to delete repository");

        assert!(
            get(&mut conn, "openwebui_fork").await.is_err(),
            "Repository was not deleted"
        );
    }
}
