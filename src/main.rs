use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use ked::config::{label_predicate, Cli, Command};
use ked::controller::{
    AppRef, Deployer, EventQueue, ManifestTemplate, Outcome, RolloutEvent, RolloutTracker,
    TrackerConfig,
};
use ked::gateway::{deployment_gvk, KubeGateway, ResourceGateway, WatchEvent};
use ked::shutdown::{shutdown_channel, wait_for_signal, ShutdownController};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Tally of terminal events seen while draining the queue
#[derive(Debug, Default, PartialEq)]
struct DrainSummary {
    completed: usize,
    unsuccessful: Vec<String>,
}

impl DrainSummary {
    fn record(&mut self, event: &RolloutEvent) {
        if !event.done {
            return;
        }
        match event.outcome {
            Some(Outcome::Completed) => self.completed += 1,
            outcome => self.unsuccessful.push(format!(
                "{}/{} ({:?})",
                event.namespace, event.name, outcome
            )),
        }
    }

    fn into_result(self) -> anyhow::Result<()> {
        if self.unsuccessful.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} rollout(s) did not complete: {}",
                self.unsuccessful.len(),
                self.unsuccessful.join(", ")
            ))
        }
    }
}

fn log_event(event: &RolloutEvent) {
    let snapshot = event.snapshot.as_ref();
    if event.done {
        info!(
            namespace = ?event.namespace,
            deployment = ?event.name,
            phase = %event.phase,
            outcome = ?event.outcome,
            error = ?event.error,
            "Rollout finished"
        );
    } else {
        info!(
            namespace = ?event.namespace,
            deployment = ?event.name,
            phase = %event.phase,
            updated = ?snapshot.map(|s| s.updated_replicas),
            ready = ?snapshot.map(|s| s.ready_replicas),
            desired = ?snapshot.map(|s| s.desired_replicas),
            "Rollout progressing"
        );
    }
}

/// Log events until every session is done
///
/// A SIGTERM/SIGINT fires the shutdown signal; sessions then report
/// `Cancelled` and the queue still drains to the end.
async fn drain_events(mut queue: EventQueue, shutdown: ShutdownController) -> DrainSummary {
    let mut summary = DrainSummary::default();
    let signal = wait_for_signal();
    tokio::pin!(signal);
    let mut signalled = false;

    loop {
        tokio::select! {
            event = queue.recv() => match event {
                Some(event) => {
                    log_event(&event);
                    summary.record(&event);
                }
                None => break,
            },
            name = &mut signal, if !signalled => {
                info!(signal = name, "Cancelling rollout tracking");
                signalled = true;
                shutdown.shutdown();
            }
        }
    }
    summary
}

async fn run_command(
    deployer: &Deployer,
    command: Command,
    tracker: Option<&RolloutTracker>,
) -> anyhow::Result<()> {
    match command {
        Command::Redeploy { name, namespace } => {
            deployer
                .redeploy_app(&AppRef::new(namespace, name), tracker)
                .await?;
        }
        Command::RedeployAll { namespace, labels } => {
            let count = deployer
                .redeploy_all(&namespace, label_predicate(labels), tracker)
                .await?;
            info!(namespace = ?namespace, count = count, "Redeploy triggered");
        }
        Command::Deploy {
            name,
            namespace,
            manifest,
            replace,
        } => {
            let app = ManifestTemplate::from_file(namespace, name, &manifest)?;
            deployer.deploy_app(&app, replace, tracker).await?;
        }
        Command::Watch { .. } => anyhow::bail!("watch does not start rollouts"),
    }
    Ok(())
}

async fn watch_deployments(
    gateway: Arc<dyn ResourceGateway>,
    namespace: &str,
) -> anyhow::Result<()> {
    let mut stream = gateway.watch(&deployment_gvk(), namespace).await?;
    info!(namespace = ?namespace, "Watching Deployments");
    let signal = wait_for_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(WatchEvent::Applied(object))) => info!(
                    namespace = ?object.metadata.namespace,
                    deployment = ?object.metadata.name,
                    generation = ?object.metadata.generation,
                    "Deployment applied"
                ),
                Some(Ok(WatchEvent::Deleted(object))) => info!(
                    namespace = ?object.metadata.namespace,
                    deployment = ?object.metadata.name,
                    "Deployment deleted"
                ),
                Some(Err(e)) => warn!(error = %e, "Watch error"),
                None => {
                    info!("Watch stream ended");
                    return Ok(());
                }
            },
            name = &mut signal => {
                info!(signal = name, "Stopping watch");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Idempotent; fails only if a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    let gateway: Arc<dyn ResourceGateway> = Arc::new(KubeGateway::new(client));

    if let Command::Watch { namespace } = &cli.command {
        return watch_deployments(gateway, namespace).await;
    }

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let (tracker, queue) = RolloutTracker::new(TrackerConfig::from(&cli));
    let tracker = tracker.with_shutdown(shutdown_signal);
    let deployer = Deployer::new(cli.prefix.clone(), gateway);

    let tracking = (!cli.no_track).then_some(&tracker);
    run_command(&deployer, cli.command.clone(), tracking)
        .await
        .context("command failed")?;

    // Sessions hold their own senders; the queue closes once they finish
    drop(tracker);
    if cli.no_track {
        return Ok(());
    }
    drain_events(queue, shutdown_controller).await.into_result()
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
