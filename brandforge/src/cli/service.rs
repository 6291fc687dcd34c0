use super::{printerr_and_finish, CliHarness};
use crate::api::system::GetSystemMetadataResponse;
use clap::{Args, Subcommand};
use std::process;

#[derive(Debug, Args)]
pub struct ServiceSubcommands {
    #[clap(subcommand)]
    pub command: ServiceCommands,
}

#[derive(Debug, Subcommand)]
pub enum ServiceCommands {
    /// Start the brandforge http service.
    #[clap(
        long_about = "Running this command attempts to start the long running service. This command \
    will block and only gracefully stop on SIGINT or SIGTERM signals."
    )]
    Start,

    /// Retrieve general information about the running service.
    Info,
}

impl CliHarness {
    pub async fn service_info(&self) {
        let response = self
            .client
            .get(self.url("/api/system/metadata"))
            .send()
            .await
            .unwrap_or_else(|e| {
                eprintln!("Command failed; {}", e);
                process::exit(1);
            });

        if !response.status().is_success() {
            printerr_and_finish(response).await;
        }

        let metadata = response
            .json::<GetSystemMetadataResponse>()
            .await
            .unwrap_or_else(|e| {
                eprintln!("Command failed; {}", e);
                process::exit(1);
            });

        println!("brandforge {} [commit {}]", metadata.semver, metadata.commit);
    }
}
