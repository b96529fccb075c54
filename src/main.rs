//! Task Grid load-balancing simulator
//!
//! Attaches simulated nodes with fixed per-task execution times to a
//! [`LoadBalancer`], runs dispatch rounds through it and prints the resulting
//! per-channel statistics as JSON. A job-expiration action bounds the run.
//! Simulated node `i` always reports the same uuid, so with a persistence
//! directory a later run resumes from the states learned by this one.

use clap::{Arg, ArgAction, Command};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use taskgrid::core::utils::current_time_millis;
use taskgrid::core::{config::parse_duration, ChannelId, Config, NodeInfo};
use taskgrid::system::{metrics, EventBus, GridEvent};
use taskgrid::{Error, JobSchedule, LoadBalancer, Result, ScheduleHandler};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// One simulated node
struct SimulatedNode {
    channel: ChannelId,
    uuid: uuid::Uuid,
    mean_task_nanos: f64,
    threads: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("taskgrid")
        .version(taskgrid::VERSION)
        .about("Simulate adaptive bundle sizing over a set of nodes.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
        )
        .arg(
            Arg::new("algorithm")
                .short('a')
                .long("algorithm")
                .value_name("NAME")
                .help("Bundling algorithm (manual, nodethreads, proportional, autotuned, rl)")
        )
        .arg(
            Arg::new("profile")
                .short('p')
                .long("profile")
                .value_name("NAME")
                .help("Profile to use from the configuration")
        )
        .arg(
            Arg::new("max-bundle-size")
                .long("max-bundle-size")
                .value_name("N")
                .help("System-wide bundle size ceiling")
        )
        .arg(
            Arg::new("means")
                .short('m')
                .long("means")
                .value_name("MS,MS,..")
                .default_value("1,2,4,8")
                .help("Mean task execution time of each node, in milliseconds")
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_name("N")
                .help("Processing threads reported by every node (default: local CPU count)")
        )
        .arg(
            Arg::new("rounds")
                .short('r')
                .long("rounds")
                .value_name("N")
                .default_value("100")
                .help("Number of dispatch rounds")
        )
        .arg(
            Arg::new("expiration")
                .long("expiration")
                .value_name("DURATION")
                .help("Stop the simulation after this long (e.g. 500ms, 10s)")
        )
        .arg(
            Arg::new("persistence-dir")
                .long("persistence-dir")
                .value_name("DIR")
                .help("Keep bundler states in this directory across runs")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print Prometheus metrics after the snapshot")
        )
        .get_matches();

    // Load configuration
    let mut config = if let Some(config_path) = matches.get_one::<String>("config") {
        Config::from_file(config_path)?
    } else {
        Config::load()?
    };

    // Apply CLI overrides
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    taskgrid::init(&config.logging)?;
    info!(
        "Starting {} v{} with algorithm '{}'",
        taskgrid::NAME,
        taskgrid::VERSION,
        config.balancing.algorithm
    );

    let nodes = build_nodes(&matches)?;
    let rounds = parse_arg::<usize>(&matches, "rounds")?;

    let events = EventBus::default();
    let balancer = LoadBalancer::new(&config.balancing, events.clone())?;
    let watcher = spawn_event_logger(&events);

    for node in &nodes {
        let info = NodeInfo {
            processing_threads: node.threads,
            uuid: Some(node.uuid),
        };
        let size = balancer.node_connected(node.channel, info)?;
        debug!("Node {} attached with initial bundle size {}", node.channel, size);
    }

    // Expiration bounds the run
    let expired = Arc::new(AtomicBool::new(false));
    let expiration = ScheduleHandler::new(config.schedule.executor_name.clone())?;
    let job_id = uuid::Uuid::new_v4();
    {
        let expired = expired.clone();
        expiration.schedule_action(
            job_id,
            &JobSchedule::after(config.schedule.default_expiration),
            move || {
                warn!("Simulation job {} expired", job_id);
                expired.store(true, Ordering::Release);
            },
            current_time_millis(),
        )?;
    }

    let mut rng = StdRng::from_os_rng();
    let mut completed = 0;
    for round in 0..rounds {
        if expired.load(Ordering::Acquire) {
            break;
        }
        for node in &nodes {
            let size = balancer.bundle_size(node.channel)?;
            // +-10% jitter around the node's mean
            let jitter: f64 = rng.random_range(0.9..1.1);
            let elapsed = (size as f64 * node.mean_task_nanos * jitter) as u64;
            balancer.feedback(node.channel, size, elapsed)?;
        }
        completed = round + 1;
        tokio::task::yield_now().await;
    }
    expiration.cancel_action(&job_id, false);
    expiration.clear(true);
    info!("Completed {} of {} rounds", completed, rounds);

    let snapshot = balancer.snapshot();
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| Error::Serialization(e.into()))?;
    println!("{}", json);

    if config.metrics.enable_prometheus && matches.get_flag("metrics") {
        println!("{}", metrics::collect_metrics());
    }

    for node in &nodes {
        balancer.node_disconnected(node.channel)?;
    }
    drop(balancer);
    watcher.abort();
    Ok(())
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &clap::ArgMatches) -> Result<()> {
    if let Some(algorithm) = matches.get_one::<String>("algorithm") {
        config.balancing.algorithm = algorithm.clone();
    }

    if let Some(profile) = matches.get_one::<String>("profile") {
        config.balancing.profile = profile.clone();
    }

    if matches.get_one::<String>("max-bundle-size").is_some() {
        config.balancing.max_bundle_size = parse_arg(matches, "max-bundle-size")?;
    }

    if let Some(expiration) = matches.get_one::<String>("expiration") {
        config.schedule.default_expiration = parse_duration(expiration)
            .map_err(|e| Error::config(format!("Invalid expiration: {}", e)))?;
    }

    if let Some(dir) = matches.get_one::<String>("persistence-dir") {
        config.balancing.persistence_dir = Some(dir.into());
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    Ok(())
}

fn parse_arg<T>(matches: &clap::ArgMatches, name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = matches
        .get_one::<String>(name)
        .ok_or_else(|| Error::config(format!("Missing value for --{}", name)))?;
    raw.parse()
        .map_err(|e| Error::config(format!("Invalid value for --{}: {}", name, e)))
}

fn build_nodes(matches: &clap::ArgMatches) -> Result<Vec<SimulatedNode>> {
    let threads = match matches.get_one::<String>("threads") {
        Some(_) => parse_arg::<usize>(matches, "threads")?,
        None => num_cpus::get().max(1),
    };
    let means = matches
        .get_one::<String>("means")
        .ok_or_else(|| Error::config("Missing value for --means"))?;

    let nodes = means
        .split(',')
        .enumerate()
        .map(|(index, raw)| {
            let millis: f64 = raw
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("Invalid mean '{}': {}", raw, e)))?;
            if millis <= 0.0 || !millis.is_finite() {
                return Err(Error::config(format!("Mean must be positive: {}", raw)));
            }
            Ok(SimulatedNode {
                channel: ChannelId::random(),
                uuid: uuid::Uuid::from_u128(index as u128 + 1),
                mean_task_nanos: millis * 1e6,
                threads,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if nodes.is_empty() {
        return Err(Error::config("At least one node is required"));
    }
    Ok(nodes)
}

/// Log grid events as they happen
fn spawn_event_logger(events: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(GridEvent::BundleSizeChanged { channel, previous, current }) => {
                    debug!("Bundle size of {} changed {} -> {}", channel, previous, current);
                }
                Ok(other) => info!("Grid event: {:?}", other),
                Err(RecvError::Lagged(skipped)) => warn!("Event logger skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
