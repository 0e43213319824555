//! Command-line and environment configuration for the `ked` binary

use crate::controller::tracker::TrackerConfig;
use clap::{Parser, Subcommand};
use kube::core::DynamicObject;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "ked",
    about = "Deploy Kubernetes applications and track their rollouts",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Prefix for field managers and the redeploy annotation
    #[arg(long, env = "KED_PREFIX", default_value = "ked", global = true)]
    pub prefix: String,

    /// Give up tracking a rollout after this many seconds
    #[arg(
        long,
        env = "KED_ROLLOUT_TIMEOUT_SECS",
        default_value_t = 300,
        global = true
    )]
    pub rollout_timeout_secs: u64,

    /// Delay between two status polls, in milliseconds
    #[arg(
        long,
        env = "KED_CHECK_INTERVAL_MS",
        default_value_t = 2000,
        global = true
    )]
    pub check_interval_ms: u64,

    /// Wait for old pods to go away before reporting a rollout ready
    #[arg(long, env = "KED_STRICT", global = true)]
    pub strict: bool,

    /// 0: final result only, 1: also rollout start, 2: every phase
    #[arg(long, env = "KED_VERBOSITY", default_value_t = 1, global = true)]
    pub verbosity: u8,

    /// Return once the writes land, without tracking rollouts
    #[arg(long, global = true)]
    pub no_track: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Trigger a fresh rollout of one Deployment
    Redeploy {
        /// Deployment name
        name: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },
    /// Trigger a fresh rollout of every matching Deployment in a namespace
    RedeployAll {
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Only Deployments carrying this label (key=value); repeatable
        #[arg(short = 'l', long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Write the objects of a YAML manifest and track the app's Deployment
    Deploy {
        /// Name of the app's Deployment inside the manifest
        name: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        #[arg(short = 'f', long)]
        manifest: PathBuf,
        /// Replace objects that already exist instead of failing
        #[arg(long)]
        replace: bool,
    },
    /// Stream Deployment changes in a namespace
    Watch {
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

/// Accept objects that carry every one of `labels`
pub fn label_predicate(labels: Vec<(String, String)>) -> impl Fn(&DynamicObject) -> bool {
    move |object| {
        let actual = object.metadata.labels.as_ref();
        labels
            .iter()
            .all(|(key, value)| actual.and_then(|l| l.get(key)) == Some(value))
    }
}

impl From<&Cli> for TrackerConfig {
    fn from(cli: &Cli) -> Self {
        TrackerConfig {
            rollout_timeout: Duration::from_secs(cli.rollout_timeout_secs),
            check_interval: Duration::from_millis(cli.check_interval_ms),
            strict: cli.strict,
            verbosity: cli.verbosity,
            ..TrackerConfig::default()
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
