use super::{humanize_absolute_duration, humanize_relative_duration, printerr_and_finish, CliHarness};
use crate::api::runs::{
    CancelRunResponse, GetRunLogsResponse, GetRunResponse, GetRunsSummaryResponse,
    ListRunsResponse, RetryRunResponse, Run,
};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};
use std::process;

#[derive(Debug, Args)]
pub struct RunSubcommands {
    #[clap(subcommand)]
    pub command: RunCommands,
}

#[derive(Debug, Subcommand)]
pub enum RunCommands {
    /// List runs; defaults from newest run to oldest.
    List {
        /// Only show runs with this status.
        #[clap(short, long)]
        status: Option<String>,

        /// Only show runs targeting this repository.
        #[clap(short, long)]
        repository: Option<String>,

        /// Maximum number of runs to show.
        #[clap(short, long, default_value = "50")]
        limit: u64,
    },

    /// Detail run by id.
    Get {
        /// Run Identifier.
        id: u64,
    },

    /// Print a run's log lines.
    Logs {
        /// Run Identifier.
        id: u64,
    },

    /// Cancel a pending or running run.
    Cancel {
        /// Run Identifier.
        id: u64,
    },

    /// Retry a failed run as a fresh pending run.
    Retry {
        /// Run Identifier.
        id: u64,
    },

    /// Show run counts grouped by status.
    Summary,
}

impl CliHarness {
    async fn fetch_run(&self, id: u64) -> Run {
        let response = self
            .client
            .get(self.url(&format!("/api/runs/{}", id)))
            .send()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        if !response.status().is_success() {
            printerr_and_finish(response).await;
        }

        response
            .json::<GetRunResponse>()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            })
            .run
    }

    pub async fn run_list(&self, status: Option<String>, repository: Option<String>, limit: u64) {
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(status) = status {
            query.push(("status", status));
        }
        if let Some(repository) = repository {
            query.push(("repository_id", repository));
        }

        let response = self
            .client
            .get(self.url("/api/runs"))
            .query(&query)
            .send()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        if !response.status().is_success() {
            printerr_and_finish(response).await;
        }

        let response = response
            .json::<ListRunsResponse>()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        if response.runs.is_empty() {
            println!("No runs found.");
            return;
        }

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("id")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("repository")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("status")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("progress")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("started")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("duration")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for run in response.runs {
            table.add_row(vec![
                Cell::new(run.run_id).fg(Color::Green),
                Cell::new(run.repository_id),
                Cell::new(run.status.to_string()),
                Cell::new(format!("{}%", run.progress_percentage)),
                Cell::new(
                    humanize_relative_duration(run.started)
                        .unwrap_or_else(|| "Not yet".to_string()),
                ),
                Cell::new(humanize_absolute_duration(run.started, run.ended)),
            ]);
        }

        println!("{table}");
    }

    pub async fn run_get(&self, id: u64) {
        let run = self.fetch_run(id).await;

        println!(
            "Run #{} [{}] :: {}",
            run.run_id.to_string().green(),
            run.repository_id,
            run.status
        );
        println!(
            "\n  Created {} | Started {} | Ran for {}",
            humanize_relative_duration(run.created).unwrap_or_else(|| "Unknown".to_string()),
            humanize_relative_duration(run.started).unwrap_or_else(|| "Not yet".to_string()),
            humanize_absolute_duration(run.started, run.ended),
        );
        println!(
            "  Output: {} | Branch: {} | Tag: {}",
            run.output_type, run.branch, run.image_tag
        );

        if !run.current_step.is_empty() {
            println!(
                "  Step: {} ({}%)",
                run.current_step, run.progress_percentage
            );
        }

        if !run.error_message.is_empty() {
            println!("\n  {} {}", "x".red(), run.error_message);
        }
    }

    pub async fn run_logs(&self, id: u64) {
        let response = self
            .client
            .get(self.url(&format!("/api/runs/{}/logs", id)))
            .send()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        if !response.status().is_success() {
            printerr_and_finish(response).await;
        }

        let response = response
            .json::<GetRunLogsResponse>()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        for line in response.logs {
            println!("{}", line);
        }
    }

    pub async fn run_cancel(&self, id: u64) {
        let response = self
            .client
            .post(self.url(&format!("/api/runs/{}/cancel", id)))
            .send()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        if !response.status().is_success() {
            printerr_and_finish(response).await;
        }

        let response = response
            .json::<CancelRunResponse>()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        println!("Cancelled run '{}'", response.run.run_id);
    }

    pub async fn run_retry(&self, id: u64) {
        let response = self
            .client
            .post(self.url(&format!("/api/runs/{}/retry", id)))
            .send()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        if !response.status().is_success() {
            printerr_and_finish(response).await;
        }

        let response = response
            .json::<RetryRunResponse>()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        println!(
            "Created run '{}' retrying run '{}'",
            response.run.run_id, id
        );
    }

    pub async fn run_summary(&self) {
        let response = self
            .client
            .get(self.url("/api/run-summary"))
            .send()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        if !response.status().is_success() {
            printerr_and_finish(response).await;
        }

        let summary = response
            .json::<GetRunsSummaryResponse>()
            .await
            .unwrap_or_else(|e| {
                eprintln!("{} Command failed; {}", "x".red(), e);
                process::exit(1);
            });

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("status")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("count")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        table.add_row(vec![Cell::new("pending"), Cell::new(summary.pending)]);
        table.add_row(vec![Cell::new("running"), Cell::new(summary.running)]);
        table.add_row(vec![Cell::new("completed"), Cell::new(summary.completed)]);
        table.add_row(vec![Cell::new("failed"), Cell::new(summary.failed)]);
        table.add_row(vec![
            Cell::new("total").fg(Color::Green),
            Cell::new(summary.total),
        ]);

        println!("{table}");
    }
}
