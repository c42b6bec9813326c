// src/main.rs

//! mwaactl
//!
//! Entry point for the mwaactl CLI.
//!
//! Installs, builds, starts and stops an Amazon MWAA local runner
//! (Airflow + Postgres) on the local Docker engine.
//!
//! Responsibilities of this file:
//! - Load an optional `.env` into the process environment
//! - Parse CLI arguments and initialise logging
//! - Hand off to the command handlers and map failures to exit code 1

mod cli;
mod commands;
mod compose;
mod config;
mod credentials;
mod docker;
mod env;
mod installer;
mod logging;
mod readiness;
mod runner;
mod ui;
mod util;

use clap::Parser;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = cli::Cli::parse();
    logging::init(cli.verbose);

    let console = ui::Console::detect();

    if let Err(e) = commands::dispatch(cli, console).await {
        console.error(format!("{:#}", e));
        std::process::exit(1);
    }
}
