pub mod credentials;
pub mod outputs;
pub mod registries;
pub mod repositories;
pub mod runs;
pub mod system;
pub mod templates;
mod validate;

use crate::{conf, storage};
use anyhow::{anyhow, Context, Result};
use dropshot::{
    ApiDescription, ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServer,
    HttpServerStarter,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::EnvFilter;

const BUILD_SEMVER: &str = env!("BUILD_SEMVER");
const BUILD_COMMIT: &str = env!("BUILD_COMMIT");

/// Current time as epoch milliseconds. All timestamps in the database use this format.
pub fn epoch_milli() -> u64 {
    let current_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis();

    u64::try_from(current_epoch).unwrap()
}

/// Macro to cut down on the boilerplate required to return a properly logged and formatted
/// http error from an endpoint handler.
#[macro_export]
macro_rules! http_error {
    ($message:expr, $status_code:expr, $request_id:expr, $err:expr) => {{
        let err: Option<anyhow::Error> = $err;
        tracing::error!(message = $message, request_id = %$request_id, error = ?err);

        dropshot::HttpError {
            status_code: $status_code,
            error_code: None,
            external_message: $message.into(),
            internal_message: format!(
                "{}; request_id: {}; error: {:?}",
                $message, $request_id, err
            ),
        }
    }};
}

/// Holds objects that need to exist for the entire duration of the service and are shared
/// between handlers.
pub struct ApiState {
    /// Various configurations needed by the api.
    pub config: conf::api::Config,

    /// The main backend storage implementation. Most of the service's state lives here.
    pub storage: storage::Db,

    /// Shared http client, used to probe git remotes and container registries.
    pub client: reqwest::Client,
}

impl ApiState {
    pub async fn new(config: conf::api::Config) -> Result<Self> {
        let storage = storage::Db::new(&config.server.storage_path)
            .await
            .context("Could not initialize storage")?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.build.probe_timeout))
            .build()
            .context("Could not initialize http client")?;

        Ok(ApiState {
            config,
            storage,
            client,
        })
    }
}

fn init_logging(config: &conf::api::Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.general.log_level)
        .with_context(|| format!("Could not parse log level '{}'", config.general.log_level))?;

    if config.general.dev_mode {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    }

    Ok(())
}

async fn wait_for_shutdown_signal(server: HttpServer<Arc<ApiState>>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }

    info!("Received shutdown signal; closing server");

    if let Err(e) = server.close().await {
        tracing::error!(error = %e, "Server did not shut down cleanly");
    }
}

/// Starts the main http service. This blocks until the server shuts down.
pub async fn start_web_services(config_path: Option<String>) -> Result<()> {
    let config = match conf::Kind::new_api_config()
        .parse(&config_path)
        .map_err(|e| anyhow!("Could not parse configuration; {:#?}", e))?
    {
        conf::Kind::Api(parsed_config) => parsed_config,
        _ => return Err(anyhow!("Incorrect configuration kind received; expected api")),
    };

    init_logging(&config)?;

    let bind_address =
        std::net::SocketAddr::from_str(&config.server.bind_address).with_context(|| {
            format!(
                "Could not parse address '{}' while trying to bind binary to port; \
                should be in format '<ip>:<port>'; Please be sure to use an ip instead of \
                something like 'localhost', when attempting to bind",
                &config.server.bind_address
            )
        })?;

    let dropshot_conf = ConfigDropshot {
        bind_address,
        ..Default::default()
    };

    let request_log = ConfigLogging::StderrTerminal {
        level: if config.general.dev_mode {
            ConfigLoggingLevel::Debug
        } else {
            ConfigLoggingLevel::Error
        },
    }
    .to_logger("brandforge")
    .context("Could not create request logger")?;

    let api_state = Arc::new(ApiState::new(config).await?);

    let mut api = ApiDescription::new();

    /* /api/system/metadata */
    api.register(system::get_system_metadata)
        .map_err(|e| anyhow!(e))?;

    /* /api/credentials */
    api.register(credentials::list_credentials)
        .map_err(|e| anyhow!(e))?;
    api.register(credentials::create_credential)
        .map_err(|e| anyhow!(e))?;

    /* /api/credentials/{credential_id} */
    api.register(credentials::get_credential)
        .map_err(|e| anyhow!(e))?;
    api.register(credentials::update_credential)
        .map_err(|e| anyhow!(e))?;
    api.register(credentials::delete_credential)
        .map_err(|e| anyhow!(e))?;

    /* /api/repositories */
    api.register(repositories::list_repositories)
        .map_err(|e| anyhow!(e))?;
    api.register(repositories::create_repository)
        .map_err(|e| anyhow!(e))?;

    /* /api/repositories/{repository_id} */
    api.register(repositories::get_repository)
        .map_err(|e| anyhow!(e))?;
    api.register(repositories::update_repository)
        .map_err(|e| anyhow!(e))?;
    api.register(repositories::delete_repository)
        .map_err(|e| anyhow!(e))?;

    /* /api/repositories/{repository_id}/verify */
    api.register(repositories::verify_repository)
        .map_err(|e| anyhow!(e))?;

    /* /api/registries */
    api.register(registries::list_registries)
        .map_err(|e| anyhow!(e))?;
    api.register(registries::create_registry)
        .map_err(|e| anyhow!(e))?;

    /* /api/registries/{registry_id} */
    api.register(registries::get_registry)
        .map_err(|e| anyhow!(e))?;
    api.register(registries::update_registry)
        .map_err(|e| anyhow!(e))?;
    api.register(registries::delete_registry)
        .map_err(|e| anyhow!(e))?;

    /* /api/registries/{registry_id}/test-connection */
    api.register(registries::test_registry_connection)
        .map_err(|e| anyhow!(e))?;

    /* /api/templates */
    api.register(templates::list_templates)
        .map_err(|e| anyhow!(e))?;
    api.register(templates::create_template)
        .map_err(|e| anyhow!(e))?;

    /* /api/templates/{template_id} */
    api.register(templates::get_template)
        .map_err(|e| anyhow!(e))?;
    api.register(templates::update_template)
        .map_err(|e| anyhow!(e))?;
    api.register(templates::delete_template)
        .map_err(|e| anyhow!(e))?;

    /* /api/templates/{template_id}/duplicate */
    api.register(templates::duplicate_template)
        .map_err(|e| anyhow!(e))?;

    /* /api/runs */
    api.register(runs::list_runs).map_err(|e| anyhow!(e))?;
    api.register(runs::create_run).map_err(|e| anyhow!(e))?;

    /* /api/run-summary */
    api.register(runs::get_runs_summary)
        .map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id} */
    api.register(runs::get_run).map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id}/start */
    api.register(runs::start_run).map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id}/progress */
    api.register(runs::update_run_progress)
        .map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id}/complete */
    api.register(runs::complete_run).map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id}/cancel */
    api.register(runs::cancel_run).map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id}/retry */
    api.register(runs::retry_run).map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id}/logs */
    api.register(runs::get_run_logs).map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id}/outputs */
    api.register(outputs::list_outputs).map_err(|e| anyhow!(e))?;
    api.register(outputs::record_output)
        .map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id}/outputs/{output_id} */
    api.register(outputs::get_output).map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id}/outputs/{output_id}/download */
    api.register(outputs::download_output)
        .map_err(|e| anyhow!(e))?;

    /* /api/runs/{run_id}/outputs/{output_id}/expire */
    api.register(outputs::expire_output)
        .map_err(|e| anyhow!(e))?;

    let server = HttpServerStarter::new(&dropshot_conf, api, api_state, &request_log)
        .map_err(|error| anyhow!("failed to create server: {}", error))?
        .start();

    let shutdown = server.wait_for_shutdown();

    tokio::spawn(wait_for_shutdown_signal(server));

    info!(
        message = "Started brandforge http service",
        host = %bind_address.ip(),
        port = %bind_address.port(),
    );

    shutdown
        .await
        .map_err(|error| anyhow!("Server encountered errors while running; {:#?}", error))
}
