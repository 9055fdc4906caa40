use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use habitat_operator::client::KubeClusterClient;
use habitat_operator::config::{Cli, OperatorSettings};
use habitat_operator::controllers::{ControllerContext, HabitatController};
use habitat_operator::health::{run_health_server, HealthState};
use habitat_operator::registration::ensure_crd;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "habitat-operator failed");
            ExitCode::FAILURE
        }
    }
}

/// JSON logs; `RUST_LOG` overrides the level chosen by `--verbose`
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "habitat-operator starting");

    let client = kube_client(&cli)
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let settings = OperatorSettings::from_env().context("Invalid operator settings")?;
    info!(
        custom_version = %settings.custom_version,
        peer_selection = ?settings.peer_selection,
        workload_cleanup = ?settings.workload_cleanup,
        registry_ownership = ?settings.registry_ownership,
        update_strategy = ?settings.update_strategy,
        "Loaded settings"
    );

    let namespace = cli.watch_namespace().map(str::to_string);
    match &namespace {
        Some(ns) => info!(namespace = %ns, "Watching a single namespace"),
        None => {
            check_cluster_scope(&client)
                .await
                .context("Cluster-wide operation requires permission to list namespaces")?;
            info!("Watching all namespaces");
        }
    }

    if cli.assume_crd_registered {
        info!("Assuming Habitat CRD is registered");
    } else {
        ensure_crd(client.clone())
            .await
            .context("Failed to register Habitat CRD")?;
    }

    let ctx = Arc::new(ControllerContext::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        settings,
    ));
    let controller = HabitatController::new(ctx.clone(), cli.worker_count());

    let health = Arc::new(HealthState::new(ctx.caches.clone()));
    let health_port = cli.health_port;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    info!(workers = cli.worker_count(), "Starting controller");
    let controller_task = tokio::spawn(controller.run(client, namespace, token));
    handle_controller_exit(controller_task.await)
}

async fn kube_client(cli: &Cli) -> Result<Client> {
    let Some(path) = &cli.kubeconfig else {
        return Ok(Client::try_default().await?);
    };
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("Invalid kubeconfig")?;
    Ok(Client::try_from(config)?)
}

async fn check_cluster_scope(client: &Client) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    namespaces.list(&ListParams::default().limit(1)).await?;
    Ok(())
}

/// First SIGTERM/SIGINT cancels `token`; a second one exits immediately
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
        }
        token.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        warn!("Received second signal, exiting immediately");
        std::process::exit(1);
    });
    Ok(())
}

fn handle_controller_exit(
    result: std::result::Result<
        std::result::Result<(), habitat_operator::controllers::ControllerError>,
        tokio::task::JoinError,
    >,
) -> Result<()> {
    match result {
        Ok(Ok(())) => {
            info!("Controller stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Controller stopped with errors");
            Err(e.into())
        }
        Err(e) if e.is_panic() => {
            error!("Controller panicked");
            anyhow::bail!("controller panicked: {:?}", e.into_panic())
        }
        Err(e) => {
            error!(error = ?e, "Controller task failed");
            anyhow::bail!("controller task failed: {}", e)
        }
    }
}
