// In-process radio simulation
//
// Spins up N complete nodes sharing one simulated air and one in-memory
// cloud, sends a message from the first node and reports what every node
// saw. `chain` links the nodes in a line so traffic must be relayed hop by
// hop to reach the far end.

use anyhow::{Context, Result};
use colored::*;
use futures::future::join_all;
use lifeline_core::delivery::DeliveryMetrics;
use lifeline_core::hybrid::{MemoryCloud, StaticReachability};
use lifeline_core::transport::{MeshStats, SimulatedAir};
use lifeline_core::{
    CoreConfig, GeoPoint, HybridMessage, KeyValueStore, LifelineNode, MemoryStore,
    NodeCapabilities, SendOptions, SledStore, StaticIdentity,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub nodes: usize,
    pub chain: bool,
    pub online: bool,
    pub name_prefix: String,
    pub message: String,
    /// Index of the addressed node; `None` broadcasts
    pub to: Option<usize>,
    pub sos: bool,
    pub location: Option<GeoPoint>,
    pub duration: Duration,
    /// Keep each node's state in a sled store under this directory
    pub persist_dir: Option<PathBuf>,
    /// Print inbound messages as they arrive
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub name: String,
    pub received: usize,
    pub peers: usize,
    pub pending: usize,
    pub failed: usize,
    pub mesh: MeshStats,
    pub delivery: DeliveryMetrics,
}

pub fn node_name(prefix: &str, index: usize) -> String {
    format!("{}-{}", prefix, index)
}

pub async fn run(core: &CoreConfig, options: &SimulationOptions) -> Result<Vec<NodeReport>> {
    if options.nodes < 2 {
        anyhow::bail!("A simulation needs at least 2 nodes");
    }
    if let Some(to) = options.to {
        if to == 0 || to >= options.nodes {
            anyhow::bail!("--to must name a node between 1 and {}", options.nodes - 1);
        }
    }

    let air = SimulatedAir::new();
    let cloud = MemoryCloud::new();
    let names: Vec<String> = (0..options.nodes)
        .map(|i| node_name(&options.name_prefix, i))
        .collect();
    if options.chain {
        for pair in names.windows(2) {
            air.link(&pair[0], &pair[1]);
        }
    }

    let mut nodes = Vec::with_capacity(names.len());
    let mut counters = Vec::with_capacity(names.len());
    let mut listeners = Vec::with_capacity(names.len());
    for name in &names {
        let store: Arc<dyn KeyValueStore> = match &options.persist_dir {
            Some(dir) => {
                let path = dir.join(name);
                debug!("Opening store for {} at {}", name, path.display());
                Arc::new(
                    SledStore::open(&path)
                        .with_context(|| format!("Failed to open store for {}", name))?,
                )
            }
            None => Arc::new(MemoryStore::new()),
        };
        let node = LifelineNode::new(
            core.clone(),
            NodeCapabilities {
                radio: Arc::new(air.radio(name)),
                cloud: Arc::new(cloud.clone()),
                reachability: Arc::new(StaticReachability::new(options.online)),
                store,
                identity: Arc::new(StaticIdentity::new(name.as_str(), name.as_str(), name.as_str())),
            },
        )
        .with_context(|| format!("Failed to assemble {}", name))?;

        let counter = Arc::new(AtomicUsize::new(0));
        listeners.push(spawn_listener(
            name.clone(),
            node.hybrid().subscribe_messages(),
            counter.clone(),
            options.verbose,
        ));
        counters.push(counter);
        nodes.push(node);
    }

    for result in join_all(nodes.iter().map(|node| node.start())).await {
        result.context("Failed to start node")?;
    }
    info!("Started {} simulated node(s)", nodes.len());

    let sender = &nodes[0];
    let result = if options.sos {
        sender.hybrid().send_sos(&options.message, options.location).await
    } else {
        let recipient = options.to.map(|i| names[i].clone());
        sender
            .hybrid()
            .send_message(
                &options.message,
                recipient.as_deref(),
                SendOptions {
                    location: options.location,
                    ..Default::default()
                },
            )
            .await
    };
    let sent = result.context("Send failed")?;

    if options.verbose {
        println!(
            "{} {} sent {} ({})",
            "→".bright_green(),
            names[0].bright_cyan(),
            sent.id.dimmed(),
            sent.status
        );
    }

    tokio::time::sleep(options.duration).await;

    let mut reports = Vec::with_capacity(nodes.len());
    for ((name, node), counter) in names.iter().zip(&nodes).zip(&counters) {
        reports.push(NodeReport {
            name: name.clone(),
            received: counter.load(Ordering::SeqCst),
            peers: node.mesh().peer_count(),
            pending: node.hybrid().pending_count().await,
            failed: node.hybrid().failed_count().await,
            mesh: node.mesh().stats(),
            delivery: node.delivery().metrics(),
        });
    }

    join_all(nodes.iter().map(|node| node.shutdown())).await;
    for listener in listeners {
        listener.abort();
    }
    Ok(reports)
}

fn spawn_listener(
    name: String,
    mut messages: broadcast::Receiver<HybridMessage>,
    counter: Arc<AtomicUsize>,
    verbose: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if verbose {
                        println!(
                            "[{}] {} {} {} ({:?}): {}",
                            chrono::Local::now().format("%H:%M:%S"),
                            name.bright_cyan(),
                            "←".bright_blue(),
                            message.sender_name,
                            message.source,
                            message.content
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CoreConfig {
        let mut config = CoreConfig::default();
        config.mesh.loop_interval_ms = 50;
        config.mesh.advertise_busy_ms = 10;
        config
    }

    fn options(nodes: usize) -> SimulationOptions {
        SimulationOptions {
            nodes,
            chain: true,
            online: false,
            name_prefix: "sim".into(),
            message: "water at the school".into(),
            to: None,
            sos: false,
            location: None,
            duration: Duration::from_secs(2),
            persist_dir: None,
            verbose: false,
        }
    }

    #[tokio::test]
    async fn test_chain_relays_to_far_end() {
        let reports = run(&fast_config(), &options(3)).await.unwrap();

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].received, 0);
        assert_eq!(reports[1].received, 1);
        assert_eq!(reports[2].received, 1);
        assert!(reports[1].mesh.packets_relayed >= 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_arguments() {
        assert!(run(&fast_config(), &options(1)).await.is_err());

        let mut opts = options(3);
        opts.to = Some(3);
        assert!(run(&fast_config(), &opts).await.is_err());
    }
}
