mod run;
mod service;

use crate::api::epoch_milli;
use crate::conf::{self, cli::Config};
use anyhow::{anyhow, Result};
use chrono_humanize::{Accuracy, HumanTime, Tense};
use clap::{Parser, Subcommand};
use std::process;

#[derive(Debug, Parser)]
#[clap(name = "brandforge")]
#[clap(about = "Brandforge rebrands Open WebUI deployments.")]
#[clap(
    long_about = "Brandforge manages branding templates, source repositories, container registries, \
    and the pipeline runs that clone, rebrand, and package Open WebUI for you.\n\n\
    The 'service' subcommand runs the long-lived http api; everything else talks to it."
)]
#[clap(version)]
struct Cli {
    /// Set configuration path; if empty default paths are used
    #[clap(long, value_name = "PATH")]
    config_path: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manages service related commands pertaining to administration.
    Service(service::ServiceSubcommands),

    /// Manages pipeline run related commands.
    Run(run::RunSubcommands),
}

struct CliHarness {
    config: Config,
    client: reqwest::Client,
}

impl CliHarness {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.server.trim_end_matches('/'), path)
    }
}

/// Prints the failure and exits. Api errors carry their detail in the response body, so
/// we fish the message out of it when we can.
async fn printerr_and_finish(response: reqwest::Response) -> ! {
    let status = response.status();
    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| {
            body.get("message")
                .and_then(|message| message.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| status.to_string());

    eprintln!("Command failed; {}", message);
    process::exit(1);
}

/// Transforms the given time into a humanized duration string from the current time,
/// or if time is not valid returns None. (i.e. 'about an hour ago')
fn humanize_relative_duration(time: u64) -> Option<String> {
    if time == 0 {
        return None;
    }

    let time_diff = epoch_milli() - time;
    let time_diff_duration = chrono::Duration::milliseconds(-(time_diff as i64));
    Some(HumanTime::from(time_diff_duration).to_string())
}

/// Transforms the given two time intervals into a humanized duration string.
/// Subtracts time two(end time) from time one(start time).
fn humanize_absolute_duration(time_one: u64, time_two: u64) -> String {
    // If time_two is just zero the thing we're trying to calculate the duration of
    // probably isn't finished, so we sub in the current time.
    let time_two = if time_two == 0 { epoch_milli() } else { time_two };

    if time_two < time_one {
        return "0s".to_string();
    }

    let time_diff = time_two - time_one;
    let time_diff_duration = chrono::Duration::milliseconds(time_diff as i64);
    HumanTime::from(time_diff_duration).to_text_en(Accuracy::Precise, Tense::Present)
}

/// init the CLI and appropriately run the correct command.
pub async fn init() -> Result<()> {
    let args = Cli::parse();

    let config = match conf::Kind::new_cli_config()
        .parse(&args.config_path)
        .map_err(|e| anyhow!("Could not parse configuration; {:#?}", e))?
    {
        conf::Kind::Cli(parsed_config) => parsed_config,
        _ => return Err(anyhow!("Incorrect configuration kind received; expected cli")),
    };

    let client = reqwest::Client::new();
    let cli = CliHarness { config, client };

    match args.command {
        Commands::Service(service) => match service.command {
            service::ServiceCommands::Start => {
                crate::api::start_web_services(args.config_path).await?;
            }
            service::ServiceCommands::Info => {
                cli.service_info().await;
            }
        },
        Commands::Run(run) => match run.command {
            run::RunCommands::List {
                status,
                repository,
                limit,
            } => cli.run_list(status, repository, limit).await,
            run::RunCommands::Get { id } => cli.run_get(id).await,
            run::RunCommands::Logs { id } => cli.run_logs(id).await,
            run::RunCommands::Cancel { id } => cli.run_cancel(id).await,
            run::RunCommands::Retry { id } => cli.run_retry(id).await,
            run::RunCommands::Summary => cli.run_summary().await,
        },
    }

    Ok(())
}
