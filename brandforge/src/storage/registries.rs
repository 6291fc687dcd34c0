use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Registry {
    pub registry_id: String,
    pub description: String,
    pub registry_type: String,
    pub registry_url: String,
    pub repository_name: String,
    pub base_image: String,
    pub target_image: String,
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
    pub registry_url: Option<String>,
    pub repository_name: Option<String>,
    pub base_image: Option<String>,
    pub target_image: Option<String>,
    pub credential_id: Option<Option<String>>,
    pub is_active: Option<bool>,
    pub verification_status: Option<String>,
    pub verification_message: Option<String>,
    pub metadata: Option<String>,
    pub modified: Option<String>,
}

pub async fn insert(conn: &mut SqliteConnection, registry: &Registry) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO registries (registry_id, description, registry_type, registry_url, \
        repository_name, base_image, target_image, credential_id, is_active, \
        verification_status, verification_message, metadata, created, modified) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&registry.registry_id)
    .bind(&registry.description)
    .bind(&registry.registry_type)
    .bind(&registry.registry_url)
    .bind(&registry.repository_name)
    .bind(&registry.base_image)
    .bind(&registry.target_image)
    .bind(&registry.credential_id)
    .bind(registry.is_active)
    .bind(&registry.verification_status)
    .bind(&registry.verification_message)
    .bind(&registry.metadata)
    .bind(&registry.created)
    .bind(&registry.modified);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Registry>, StorageError> {
    let query = sqlx::query_as::<_, Registry>(
        "SELECT registry_id, description, registry_type, registry_url, repository_name, \
        base_image, target_image, credential_id, is_active, verification_status, \
        verification_message, metadata, created, modified FROM registries ORDER BY registry_id;",
    );

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, registry_id: &str) -> Result<Registry, StorageError> {
    let query = sqlx::query_as::<_, Registry>(
        "SELECT registry_id, description, registry_type, registry_url, repository_name, \
        base_image, target_image, credential_id, is_active, verification_status, \
        verification_message, metadata, created, modified FROM registries WHERE registry_id = ?;",
    )
    .bind(registry_id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    registry_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE registries SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.description {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("description = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.registry_url {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("registry_url = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.repository_name {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("repository_name = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.base_image {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("base_image = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.target_image {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("target_image = ");
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

    update_query.push(" WHERE registry_id = ");
    update_query.push_bind(registry_id);
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

pub async fn delete(conn: &mut SqliteConnection, registry_id: &str) -> Result<(), StorageError> {
    let query = sqlx::query("DELETE FROM registries WHERE registry_id = ?;").bind(registry_id);

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

        let registry = Registry {
            registry_id: "dockerhub_main".into(),
            description: "primary push target".into(),
            registry_type: "dockerhub".into(),
            registry_url: "https://index.docker.io".into(),
            repository_name: "example/branded-webui".into(),
            base_image: "ghcr.io/open-webui/open-webui:main".into(),
            target_image: "example/branded-webui".into(),
            credential_id: None,
            is_active: true,
            verification_status: "unverified".into(),
            verification_message: "".into(),
            metadata: "{}".into(),
            created: "0".into(),
            modified: "0".into(),
        };

        insert(&mut conn, &registry).await?;

        Ok((harness, conn))
    }

    #[tokio::test]
    async fn test_insert_duplicate_registry() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let duplicate = Registry {
            registry_id: "dockerhub_main".into(),
            ..Default::default()
        };

        let result = insert(&mut conn, &duplicate).await;
        assert_eq!(result.unwrap_err(), StorageError::Exists);
    }

    #[tokio::test]
    async fn test_get_registry() {
        let (_harness, mut conn) = setup().await.expect("Failed to get registry");

        let registry = get(&mut conn, "dockerhub_main")
            .await
            .expect("Failed to get registry");

        assert_eq!(registry.registry_type, "dockerhub");
        assert_eq!(registry.repository_name, "example/branded-webui");
    }

    #[tokio::test]
    async fn test_list_registries() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let registries = list(&mut conn).await.expect("Failed to list registries");

        assert_eq!(registries.len(), 1);
        assert_eq!(registries[0].registry_id, "dockerhub_main");
    }

    #[tokio::test]
    async fn test_update_registry() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            is_active: Some(false),
            verification_status: Some("failed".into()),
            verification_message: Some("registry did not respond".into()),
            modified: Some("100".into()),
            ..Default::default()
        };

        update(&mut conn, "dockerhub_main", fields_to_update)
            .await
            .expect("Failed to update registry");

        let updated = get(&mut conn, "dockerhub_main")
            .await
            .expect("Failed to retrieve updated registry");

        assert!(!updated.is_active);
        assert_eq!(updated.verification_status, "failed");
    }

    #[tokio::test]
    async fn test_delete_registry() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        delete(&mut conn, "dockerhub_main")
            .await
            .expect("Failed to delete registry");

        assert!(
            get(&mut conn, "dockerhub_main").await.is_err(),
            "Registry was not deleted"
        );
    }
}
