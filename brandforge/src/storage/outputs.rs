use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Output {
    pub output_id: i64,
    pub run_id: i64,
    pub output_type: String,
    pub status: String,
    pub file_path: String,
    pub file_url: String,
    pub image_url: String,
    pub file_size_bytes: Option<i64>,
    pub checksum: String,
    pub download_count: i64,
    pub expires: String,
    pub build_metadata: String,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub status: Option<String>,
    pub file_path: Option<String>,
    pub file_url: Option<String>,
    pub image_url: Option<String>,
    pub file_size_bytes: Option<Option<i64>>,
    pub checksum: Option<String>,
    pub download_count: Option<i64>,
    pub expires: Option<String>,
    pub build_metadata: Option<String>,
    pub modified: Option<String>,
}

const OUTPUT_COLUMNS: &str = "output_id, run_id, output_type, status, file_path, file_url, \
    image_url, file_size_bytes, checksum, download_count, expires, build_metadata, created, \
    modified";

/// Inserts a new output and returns the id the database assigned to it.
pub async fn insert(conn: &mut SqliteConnection, output: &Output) -> Result<i64, StorageError> {
    let query = sqlx::query(
        "INSERT INTO outputs (run_id, output_type, status, file_path, file_url, image_url, \
        file_size_bytes, checksum, download_count, expires, build_metadata, created, modified) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(output.run_id)
    .bind(&output.output_type)
    .bind(&output.status)
    .bind(&output.file_path)
    .bind(&output.file_url)
    .bind(&output.image_url)
    .bind(output.file_size_bytes)
    .bind(&output.checksum)
    .bind(output.download_count)
    .bind(&output.expires)
    .bind(&output.build_metadata)
    .bind(&output.created)
    .bind(&output.modified);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|result| result.last_insert_rowid())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list_for_run(
    conn: &mut SqliteConnection,
    run_id: i64,
) -> Result<Vec<Output>, StorageError> {
    let sql_string =
        format!("SELECT {OUTPUT_COLUMNS} FROM outputs WHERE run_id = ? ORDER BY output_id;");
    let query = sqlx::query_as::<_, Output>(&sql_string).bind(run_id);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, output_id: i64) -> Result<Output, StorageError> {
    let sql_string = format!("SELECT {OUTPUT_COLUMNS} FROM outputs WHERE output_id = ?;");
    let query = sqlx::query_as::<_, Output>(&sql_string).bind(output_id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    output_id: i64,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE outputs SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.status {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("status = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.file_path {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("file_path = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.file_url {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("file_url = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.image_url {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("image_url = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.file_size_bytes {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("file_size_bytes = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.checksum {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("checksum = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.download_count {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("download_count = ");
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

    if let Some(value) = &fields.build_metadata {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("build_metadata = ");
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

    update_query.push(" WHERE output_id = ");
    update_query.push_bind(output_id);
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

pub async fn delete(conn: &mut SqliteConnection, output_id: i64) -> Result<(), StorageError> {
    let query = sqlx::query("DELETE FROM outputs WHERE output_id = ?;").bind(output_id);

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

        let run = crate::storage::runs::Run {
            repository_id: "openwebui_fork".into(),
            branch: "main".into(),
            output_type: "archive".into(),
            image_tag: "latest".into(),
            steps: r#"["clone","brand"]"#.into(),
            build_arguments: "{}".into(),
            environment_variables: "{}".into(),
            metadata: "{}".into(),
            status: "completed".into(),
            created: "0".into(),
            started: "0".into(),
            ended: "0".into(),
            ..Default::default()
        };

        let run_id = crate::storage::runs::insert(&mut conn, &run).await?;

        let output = Output {
            run_id,
            output_type: "archive".into(),
            status: "available".into(),
            file_path: "/var/lib/brandforge/outputs/1.tar.gz".into(),
            file_url: "".into(),
            image_url: "".into(),
            file_size_bytes: Some(1024),
            checksum: "sha256:deadbeef".into(),
            download_count: 0,
            expires: "9999999999999".into(),
            build_metadata: "{}".into(),
            created: "0".into(),
            modified: "0".into(),
            ..Default::default()
        };

        insert(&mut conn, &output).await?;

        Ok((harness, conn))
    }

    #[tokio::test]
    async fn test_insert_duplicate_output_type_for_run() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let duplicate = Output {
            run_id: 1,
            output_type: "archive".into(),
            ..Default::default()
        };

        let result = insert(&mut conn, &duplicate).await;
        assert_eq!(result.unwrap_err(), StorageError::Exists);
    }

    #[tokio::test]
    async fn test_get_output() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let output = get(&mut conn, 1).await.expect("Failed to get output");

        assert_eq!(output.run_id, 1);
        assert_eq!(output.file_size_bytes, Some(1024));
        assert_eq!(output.checksum, "sha256:deadbeef");
    }

    #[tokio::test]
    async fn test_list_outputs_for_run() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let outputs = list_for_run(&mut conn, 1)
            .await
            .expect("Failed to list outputs");

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].output_type, "archive");

        let outputs = list_for_run(&mut conn, 42)
            .await
            .expect("Failed to list outputs");

        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_update_output() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            download_count: Some(5),
            status: Some("expired".into()),
            modified: Some("100".into()),
            ..Default::default()
        };

        update(&mut conn, 1, fields_to_update)
            .await
            .expect("Failed to update output");

        let updated = get(&mut conn, 1).await.expect("Failed to get updated output");

        assert_eq!(updated.download_count, 5);
        assert_eq!(updated.status, "expired");
    }

    #[tokio::test]
    async fn test_outputs_removed_with_run() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        crate::storage::runs::delete(&mut conn, 1)
            .await
            .expect("Failed to delete run");

        assert!(get(&mut conn, 1).await.is_err(), "Output was not removed");
    }
}
