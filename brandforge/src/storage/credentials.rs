use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Credential {
    pub credential_id: String,
    pub description: String,
    pub credential_type: String,
    pub secret: String,
    pub fingerprint: String,
    pub is_active: bool,
    pub expires: String,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub description: Option<String>,
    pub secret: Option<String>,
    pub fingerprint: Option<String>,
    pub is_active: Option<bool>,
    pub expires: Option<String>,
    pub modified: Option<String>,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    credential: &Credential,
) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO credentials (credential_id, description, credential_type, secret, \
        fingerprint, is_active, expires, created, modified) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&credential.credential_id)
    .bind(&credential.description)
    .bind(&credential.credential_type)
    .bind(&credential.secret)
    .bind(&credential.fingerprint)
    .bind(credential.is_active)
    .bind(&credential.expires)
    .bind(&credential.created)
    .bind(&credential.modified);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Credential>, StorageError> {
    let query = sqlx::query_as::<_, Credential>(
        "SELECT credential_id, description, credential_type, secret, fingerprint, is_active, \
        expires, created, modified FROM credentials ORDER BY credential_id;",
    );

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    credential_id: &str,
) -> Result<Credential, StorageError> {
    let query = sqlx::query_as::<_, Credential>(
        "SELECT credential_id, description, credential_type, secret, fingerprint, is_active, \
        expires, created, modified FROM credentials WHERE credential_id = ?;",
    )
    .bind(credential_id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    credential_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE credentials SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.description {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("description = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.secret {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("secret = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.fingerprint {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("fingerprint = ");
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

    if let Some(value) = &fields.expires {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("expires = ");
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

    update_query.push(" WHERE credential_id = ");
    update_query.push_bind(credential_id);
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

pub async fn delete(conn: &mut SqliteConnection, credential_id: &str) -> Result<(), StorageError> {
    let query = sqlx::query("DELETE FROM credentials WHERE credential_id = ?;").bind(credential_id);

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

        let credential = Credential {
            credential_id: "github_token".into(),
            description: "token for private forks".into(),
            credential_type: "git_https_token".into(),
            secret: "super_secret_value".into(),
            fingerprint: "abcd1234".into(),
            is_active: true,
            expires: "0".into(),
            created: "0".into(),
            modified: "0".into(),
        };

        insert(&mut conn, &credential).await?;

        Ok((harness, conn))
    }

    #[tokio::test]
    async fn test_insert_duplicate_credential() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let duplicate = Credential {
            credential_id: "github_token".into(),
            ..Default::default()
        };

        let result = insert(&mut conn, &duplicate).await;
        assert_eq!(result.unwrap_err(), StorageError::Exists);
    }

    #[tokio::test]
    async fn test_get_credential() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let credential = get(&mut conn, "github_token")
            .await
            .expect("Failed to get credential");

        assert_eq!(credential.credential_type, "git_https_token");
        assert_eq!(credential.secret, "super_secret_value");
        assert!(credential.is_active);
    }

    #[tokio::test]
    async fn test_list_credentials() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let credentials = list(&mut conn).await.expect("Failed to list credentials");

        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials[0].credential_id, "github_token");
    }

    #[tokio::test]
    async fn test_update_credential() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            description: Some("rotated token".into()),
            secret: Some("new_secret_value".into()),
            fingerprint: Some("ef567890".into()),
            modified: Some("100".into()),
            ..Default::default()
        };

        update(&mut conn, "github_token", fields_to_update)
            .await
            .expect("Failed to update credential");

        let updated = get(&mut conn, "github_token")
            .await
            .expect("Failed to retrieve updated credential");

        assert_eq!(updated.description, "rotated token");
        assert_eq!(updated.secret, "new_secret_value");
        assert_eq!(updated.fingerprint, "ef567890");
    }

    #[tokio::test]
    async fn test_delete_credential() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        delete(&mut conn, "github_token")
            .await
            .expect("Failed to delete credential");

        assert!(
            get(&mut conn, "github_token").await.is_err(),
            "Credential was not deleted"
        );
    }

    #[tokio::test]
    async fn test_update_missing_credential() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            description: Some("rotated token".into()),
            ..Default::default()
        };

        let result = update(&mut conn, "does_not_exist", fields_to_update).await;
        assert_eq!(result.unwrap_err(), StorageError::NotFound);
    }

    #[tokio::test]
    async fn test_delete_missing_credential() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let result = delete(&mut conn, "does_not_exist").await;
        assert_eq!(result.unwrap_err(), StorageError::NotFound);
    }
}
