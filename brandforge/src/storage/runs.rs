use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Run {
    pub run_id: i64,
    pub repository_id: String,
    pub registry_id: Option<String>,
    pub template_id: Option<String>,
    pub branch: String,
    pub commit_hash: String,
    pub output_type: String,
    pub image_tag: String,
    pub steps: String,
    pub build_arguments: String,
    pub environment_variables: String,
    pub metadata: String,
    pub status: String,
    pub current_step: String,
    pub progress_percentage: i64,
    pub worker_id: String,
    pub error_message: String,
    pub logs: String,
    pub created: String,
    pub started: String,
    pub ended: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub status: Option<String>,
    pub current_step: Option<String>,
    pub progress_percentage: Option<i64>,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub logs: Option<String>,
    pub metadata: Option<String>,
    pub started: Option<String>,
    pub ended: Option<String>,
}

/// Optional narrowing criteria for [`list`]. Empty filters list every run.
#[derive(Clone, Debug, Default)]
pub struct Filters {
    pub status: Option<String>,
    pub repository_id: Option<String>,
    pub registry_id: Option<String>,
}

const RUN_COLUMNS: &str = "run_id, repository_id, registry_id, template_id, branch, commit_hash, \
    output_type, image_tag, steps, build_arguments, environment_variables, metadata, status, \
    current_step, progress_percentage, worker_id, error_message, logs, created, started, ended";

/// Inserts a new run and returns the id the database assigned to it.
pub async fn insert(conn: &mut SqliteConnection, run: &Run) -> Result<i64, StorageError> {
    let query = sqlx::query(
        "INSERT INTO runs (repository_id, registry_id, template_id, branch, commit_hash, \
        output_type, image_tag, steps, build_arguments, environment_variables, metadata, status, \
        current_step, progress_percentage, worker_id, error_message, logs, created, started, \
        ended) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&run.repository_id)
    .bind(&run.registry_id)
    .bind(&run.template_id)
    .bind(&run.branch)
    .bind(&run.commit_hash)
    .bind(&run.output_type)
    .bind(&run.image_tag)
    .bind(&run.steps)
    .bind(&run.build_arguments)
    .bind(&run.environment_variables)
    .bind(&run.metadata)
    .bind(&run.status)
    .bind(&run.current_step)
    .bind(run.progress_percentage)
    .bind(&run.worker_id)
    .bind(&run.error_message)
    .bind(&run.logs)
    .bind(&run.created)
    .bind(&run.started)
    .bind(&run.ended);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|result| result.last_insert_rowid())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Returns runs newest first. Filters narrow the result set; an offset/limit of 0 returns
/// everything.
pub async fn list(
    conn: &mut SqliteConnection,
    filters: &Filters,
    offset: i64,
    limit: i64,
) -> Result<Vec<Run>, StorageError> {
    let mut query: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM runs"));
    let mut filters_total = 0;

    if let Some(value) = &filters.status {
        query.push(" WHERE status = ");
        query.push_bind(value);
        filters_total += 1;
    }

    if let Some(value) = &filters.repository_id {
        query.push(if filters_total > 0 { " AND " } else { " WHERE " });
        query.push("repository_id = ");
        query.push_bind(value);
        filters_total += 1;
    }

    if let Some(value) = &filters.registry_id {
        query.push(if filters_total > 0 { " AND " } else { " WHERE " });
        query.push("registry_id = ");
        query.push_bind(value);
    }

    query.push(" ORDER BY run_id DESC");

    if limit > 0 {
        query.push(" LIMIT ");
        query.push_bind(limit);
    }

    if offset > 0 {
        query.push(" OFFSET ");
        query.push_bind(offset);
    }

    query.push(";");

    let query = query.build_query_as::<Run>();

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, run_id: i64) -> Result<Run, StorageError> {
    let sql_string = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?;");
    let query = sqlx::query_as::<_, Run>(&sql_string).bind(run_id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Returns the oldest run waiting for a worker, if any.
pub async fn get_oldest_pending(conn: &mut SqliteConnection) -> Result<Run, StorageError> {
    let sql_string =
        format!("SELECT {RUN_COLUMNS} FROM runs WHERE status = 'pending' ORDER BY run_id ASC LIMIT 1;");
    let query = sqlx::query_as::<_, Run>(&sql_string);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Counts runs grouped by status. Statuses with no runs are absent from the result.
pub async fn count_by_status(
    conn: &mut SqliteConnection,
) -> Result<Vec<(String, i64)>, StorageError> {
    let query = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM runs GROUP BY status;",
    );

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    run_id: i64,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE runs SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.status {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("status = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.current_step {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("current_step = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.progress_percentage {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("progress_percentage = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.worker_id {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("worker_id = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.error_message {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("error_message = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.logs {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("logs = ");
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

    if let Some(value) = &fields.started {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("started = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.ended {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("ended = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    // If no fields were updated, return an error
    if updated_fields_total == 0 {
        return Err(StorageError::NoFieldsUpdated);
    }

    update_query.push(" WHERE run_id = ");
    update_query.push_bind(run_id);
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

pub async fn delete(conn: &mut SqliteConnection, run_id: i64) -> Result<(), StorageError> {
    let query = sqlx::query("DELETE FROM runs WHERE run_id = ?;").bind(run_id);

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

    fn test_run(repository_id: &str, status: &str) -> Run {
        Run {
            repository_id: repository_id.into(),
            registry_id: Some("dockerhub_main".into()),
            template_id: Some("acme_dark".into()),
            branch: "main".into(),
            commit_hash: "".into(),
            output_type: "image".into(),
            image_tag: "latest".into(),
            steps: r#"["clone","build","brand","push"]"#.into(),
            build_arguments: "{}".into(),
            environment_variables: "{}".into(),
            metadata: "{}".into(),
            status: status.into(),
            current_step: "".into(),
            progress_percentage: 0,
            worker_id: "".into(),
            error_message: "".into(),
            logs: "".into(),
            created: "0".into(),
            started: "0".into(),
            ended: "0".into(),
            ..Default::default()
        }
    }

    async fn setup() -> Result<(TestHarness, PoolConnection<Sqlite>), Box<dyn std::error::Error>> {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        insert(&mut conn, &test_run("openwebui_fork", "pending")).await?;
        insert(&mut conn, &test_run("openwebui_fork", "running")).await?;
        insert(&mut conn, &test_run("other_fork", "failed")).await?;

        Ok((harness, conn))
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let id = insert(&mut conn, &test_run("openwebui_fork", "pending"))
            .await
            .expect("Failed to insert run");

        assert_eq!(id, 4);
    }

    #[tokio::test]
    async fn test_get_run() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let run = get(&mut conn, 2).await.expect("Failed to get run");

        assert_eq!(run.run_id, 2);
        assert_eq!(run.status, "running");
        assert_eq!(run.registry_id, Some("dockerhub_main".to_string()));
    }

    #[tokio::test]
    async fn test_list_runs_newest_first() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let runs = list(&mut conn, &Filters::default(), 0, 0)
            .await
            .expect("Failed to list runs");

        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].run_id, 3);
        assert_eq!(runs[2].run_id, 1);
    }

    #[tokio::test]
    async fn test_list_runs_filtered() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let filters = Filters {
            repository_id: Some("openwebui_fork".into()),
            ..Default::default()
        };

        let runs = list(&mut conn, &filters, 0, 0)
            .await
            .expect("Failed to list runs");

        assert_eq!(runs.len(), 2);

        let filters = Filters {
            status: Some("failed".into()),
            repository_id: Some("other_fork".into()),
            ..Default::default()
        };

        let runs = list(&mut conn, &filters, 0, 0)
            .await
            .expect("Failed to list runs");

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, 3);
    }

    #[tokio::test]
    async fn test_list_runs_limit() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let runs = list(&mut conn, &Filters::default(), 0, 2)
            .await
            .expect("Failed to list runs");

        assert_eq!(runs.len(), 2);

        let runs = list(&mut conn, &Filters::default(), 2, 2)
            .await
            .expect("Failed to list runs");

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, 1);
    }

    #[tokio::test]
    async fn test_get_oldest_pending() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let run = get_oldest_pending(&mut conn)
            .await
            .expect("Failed to get pending run");

        assert_eq!(run.run_id, 1);
    }

    #[tokio::test]
    async fn test_count_by_status() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let counts = count_by_status(&mut conn)
            .await
            .expect("Failed to count runs");

        let mut counts = counts.into_iter().collect::<std::collections::HashMap<_, _>>();
        assert_eq!(counts.remove("pending"), Some(1));
        assert_eq!(counts.remove("running"), Some(1));
        assert_eq!(counts.remove("failed"), Some(1));
        assert!(counts.is_empty());
    }

    #[tokio::test]
    async fn test_update_run() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            status: Some("completed".into()),
            progress_percentage: Some(100),
            ended: Some("500".into()),
            ..Default::default()
        };

        update(&mut conn, 2, fields_to_update)
            .await
            .expect("Failed to update run");

        let updated = get(&mut conn, 2).await.expect("Failed to get updated run");

        assert_eq!(updated.status, "completed");
        assert_eq!(updated.progress_percentage, 100);
        assert_eq!(updated.ended, "500");
    }

    #[tokio::test]
    async fn test_delete_run() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        delete(&mut conn, 1).await.expect("Failed to delete run");

        assert!(get(&mut conn, 1).await.is_err(), "Run was not deleted");
    }

    #[tokio::test]
    async fn test_update_missing_run() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            status: Some("completed".into()),
            ..Default::default()
        };

        let result = update(&mut conn, 9999, fields_to_update).await;
        assert_eq!(result.unwrap_err(), StorageError::NotFound);
    }
}
