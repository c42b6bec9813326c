// src/commands.rs

//! `local *` command handlers.
//!
//! Each handler resolves settings, wires the collaborators and reports
//! progress on the console. The lifecycle itself lives in `runner`.

use anyhow::{bail, Context, Result};
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::{Cli, Command, CredsArgs, LocalCommand};
use crate::config::{FileConfig, Overrides, Settings, DEFAULT_CONFIG_FILE};
use crate::credentials::{CredentialResolver, DefaultCredentialResolver};
use crate::docker::{DockerEngine, Gateway, LogsEnd};
use crate::env::Envs;
use crate::installer::{ArchiveSource, Installer};
use crate::readiness::ReadinessPoller;
use crate::runner::{Runner, RunnerError, RunnerOptions, Session, StartOptions};
use crate::ui::Console;
use crate::util::open_browser;

pub async fn dispatch(cli: Cli, console: Console) -> Result<()> {
    let Command::Local(cmd) = &cli.command;

    let mut overrides = Overrides {
        profile: cli.profile.clone(),
        region: cli.region.clone(),
        ..Overrides::default()
    };
    match cmd {
        LocalCommand::Init { version, repo_url } => {
            overrides.version = version.clone();
            overrides.repo_url = repo_url.clone();
        }
        LocalCommand::Start { port, wait, .. } => {
            overrides.port = *port;
            overrides.wait = *wait;
        }
        _ => {}
    }

    let settings = load_settings(cli.config.as_ref(), overrides)?;

    match cmd {
        LocalCommand::Init { .. } => init(&settings, console).await,
        LocalCommand::BuildImage => build_image(&settings, console).await,
        LocalCommand::Start {
            reset_db,
            creds,
            no_browser,
            follow_logs,
            ..
        } => {
            let opts = StartOptions {
                port: settings.port,
                reset_db: *reset_db,
                follow_logs: *follow_logs,
                ..StartOptions::default()
            };
            start(&settings, creds, opts, *no_browser, console).await
        }
        LocalCommand::Stop => stop(&settings, console).await,
        LocalCommand::TestRequirements => {
            let runner = connect(&settings).await?;
            console.info("Testing requirements.txt");
            runner
                .test_requirements()
                .await
                .context("Requirements test failed")?;
            console.success("Requirements installed cleanly");
            Ok(())
        }
        LocalCommand::PackageRequirements => {
            let runner = connect(&settings).await?;
            console.info("Packaging requirements");
            runner
                .package_requirements()
                .await
                .context("Packaging requirements failed")?;
            console.success(format!(
                "Requirements packaged into {}",
                settings.clone_path.join("requirements").display()
            ));
            Ok(())
        }
        LocalCommand::TestStartupScript { creds } => {
            let envs = envs_for(&settings, creds).await?;
            let runner = connect(&settings).await?;
            console.info("Testing startup script");
            runner
                .test_startup_script(&envs)
                .await
                .context("Startup script test failed")?;
            console.success("Startup script completed");
            Ok(())
        }
    }
}

/* ---------------- settings & wiring ---------------- */

fn load_settings(config: Option<&PathBuf>, overrides: Overrides) -> Result<Settings> {
    let cwd = std::env::current_dir().context("Failed to determine working directory")?;

    let file = match config {
        Some(path) => FileConfig::load(&cwd.join(path), true)?,
        None => FileConfig::load(&cwd.join(DEFAULT_CONFIG_FILE), false)?,
    };

    Settings::resolve(file, overrides, &cwd)
}

async fn connect(settings: &Settings) -> Result<Runner> {
    let engine = DockerEngine::connect()
        .await
        .context("Failed to connect to the container engine")?;

    let options = RunnerOptions::new(
        &settings.version,
        settings.clone_path.clone(),
        settings.dags_path.clone(),
    );
    Ok(Runner::new(Gateway::new(Arc::new(engine)), options))
}

async fn envs_for(settings: &Settings, creds: &CredsArgs) -> Result<Envs> {
    if !creds.wanted() {
        return Ok(Envs::default());
    }

    let resolver = DefaultCredentialResolver::from_env(settings.profile.clone(), settings.region.clone());
    let credentials = resolver
        .resolve(creds.role_arn.as_deref())
        .await
        .context("Failed to resolve AWS credentials")?;

    Ok(Envs::with_credentials(credentials))
}

/* ---------------- handlers ---------------- */

async fn init(settings: &Settings, console: Console) -> Result<()> {
    console.info(format!(
        "Installing local runner {} into {}",
        settings.version,
        settings.clone_path.display()
    ));

    let installer = Installer {
        clone_path: settings.clone_path.clone(),
        dags_path: settings.dags_path.clone(),
        version: settings.version.clone(),
    };
    let report = installer
        .run(&ArchiveSource::new(&settings.repo_url))
        .await
        .context("Installation failed")?;

    console.success(format!(
        "Installed {} runner files and {} DAG files ({} skipped)",
        report.clone_files, report.dags_files, report.skipped
    ));
    Ok(())
}

async fn build_image(settings: &Settings, console: Console) -> Result<()> {
    let runner = connect(settings).await?;
    let tag = runner.options().image_tag();

    console.info(format!("Building image {tag}"));
    runner.build_image().await.context("Image build failed")?;
    console.success(format!("Image {tag} built"));
    Ok(())
}

async fn start(
    settings: &Settings,
    creds: &CredsArgs,
    mut opts: StartOptions,
    no_browser: bool,
    console: Console,
) -> Result<()> {
    opts.envs = envs_for(settings, creds).await?;
    let runner = connect(settings).await?;

    let shutdown = CancellationToken::new();
    let watcher = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
    };

    let result = run_session(&runner, settings, &opts, no_browser, &shutdown, console).await;
    watcher.abort();
    result
}

async fn run_session(
    runner: &Runner,
    settings: &Settings,
    opts: &StartOptions,
    no_browser: bool,
    shutdown: &CancellationToken,
    console: Console,
) -> Result<()> {
    if opts.reset_db {
        console.warn("Database will be reset");
    }
    console.info(format!("Starting local runner {}", settings.version));

    let session = tokio::select! {
        res = runner.start(opts) => res.context("Failed to start local runner")?,
        _ = shutdown.cancelled() => {
            console.info("Received shutdown signal, stopping local runner");
            runner.stop().await.context("Failed to stop local runner")?;
            bail!("Interrupted while starting the local runner");
        }
    };

    console.info(format!(
        "Waiting up to {} for the webserver",
        humantime::format_duration(settings.wait)
    ));
    match runner
        .wait_until_healthy(&session, &ReadinessPoller::with_timeout(settings.wait), shutdown)
        .await
    {
        Ok(()) => {}
        Err(RunnerError::Interrupted(_)) => {
            console.info("Received shutdown signal, local runner stopped");
            return Ok(());
        }
        Err(e) => return Err(e).context("Local runner did not become healthy"),
    }

    let url = session.url();
    console.success(format!("Airflow UI available at {url}"));

    if !no_browser {
        if let Err(e) = open_browser(&url) {
            console.warn(format!("Could not open a browser ({e}); visit {url}"));
        }
    }

    if opts.follow_logs {
        follow(runner, &session, shutdown, console).await?;
    }
    Ok(())
}

async fn follow(
    runner: &Runner,
    session: &Session,
    shutdown: &CancellationToken,
    console: Console,
) -> Result<()> {
    console.info("Following logs, press Ctrl+C to stop the environment");

    let follower = {
        let runner = runner.clone();
        let session = session.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut out = std::io::stdout();
            runner.follow_logs(&session, &mut out, &shutdown).await
        })
    };

    match follower
        .await
        .context("Log follower task failed")?
        .context("Log streaming failed")?
    {
        LogsEnd::Cancelled => {
            console.info("Received shutdown signal, stopping local runner");
            console.success("Local runner stopped");
        }
        LogsEnd::StreamEnded => console.warn("Log stream ended; the local runner may have exited"),
    }
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix. A handler that cannot be
/// installed never resolves.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => debug!("received Ctrl+C"),
        _ = terminate => debug!("received SIGTERM"),
    }
}

async fn stop(settings: &Settings, console: Console) -> Result<()> {
    let runner = connect(settings).await?;

    let stopped = runner.stop().await.context("Failed to stop local runner")?;
    if stopped == 0 {
        console.info("No running local runner containers");
    } else {
        console.success(format!("Stopped {stopped} container(s)"));
    }
    Ok(())
}
