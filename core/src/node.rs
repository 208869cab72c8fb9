// Node assembly — one mesh transport, delivery manager and hybrid service
// per device, wired together from a config and the host's capabilities.

use crate::config::CoreConfig;
use crate::delivery::DeliveryManager;
use crate::hybrid::{CloudChannel, HybridMessageService, Reachability};
use crate::identity::IdentityProvider;
use crate::store::KeyValueStore;
use crate::transport::{MeshError, MeshTransport, RadioTransport};
use crate::{AppLifecycle, LifelineError};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything the core needs from the host platform.
#[derive(Clone)]
pub struct NodeCapabilities {
    pub radio: Arc<dyn RadioTransport>,
    pub cloud: Arc<dyn CloudChannel>,
    pub reachability: Arc<dyn Reachability>,
    pub store: Arc<dyn KeyValueStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

pub struct LifelineNode {
    config: CoreConfig,
    identity: Arc<dyn IdentityProvider>,
    mesh: MeshTransport,
    delivery: DeliveryManager,
    hybrid: HybridMessageService,
    running: RwLock<bool>,
}

impl LifelineNode {
    pub fn new(config: CoreConfig, capabilities: NodeCapabilities) -> Result<Self, LifelineError> {
        // Initialize tracing (idempotent; a host subscriber wins)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();

        config.validate()?;

        let NodeCapabilities {
            radio,
            cloud,
            reachability,
            store,
            identity,
        } = capabilities;

        let mesh = MeshTransport::new(
            config.mesh.clone(),
            radio,
            store.clone(),
            identity.clone(),
        );
        let delivery = DeliveryManager::new(config.delivery.clone(), store.clone());
        let hybrid = HybridMessageService::new(
            config.hybrid.clone(),
            identity.clone(),
            mesh.clone(),
            delivery.clone(),
            cloud,
            reachability,
            store,
        );

        Ok(Self {
            config,
            identity,
            mesh,
            delivery,
            hybrid,
            running: RwLock::new(false),
        })
    }

    /// Bring the radio up and start the messaging services.
    ///
    /// A radio that cannot start leaves the node running cloud-only; the
    /// error is logged, not returned.
    pub async fn start(&self) -> Result<(), LifelineError> {
        {
            let mut running = self.running.write();
            if *running {
                return Err(MeshError::AlreadyRunning.into());
            }
            *running = true;
        }

        let identity = self.identity.identity();
        info!("Lifeline node {} starting...", identity.id);

        match self.mesh.start().await {
            Ok(()) => {}
            Err(MeshError::AlreadyRunning) => {}
            Err(e) => warn!("Mesh unavailable, continuing cloud-only: {}", e),
        }
        self.hybrid.initialize().await;

        info!("Lifeline node {} started", identity.id);
        Ok(())
    }

    pub async fn shutdown(&self) {
        {
            let mut running = self.running.write();
            if !*running {
                return;
            }
            *running = false;
        }

        info!("Lifeline node stopping...");
        self.hybrid.shutdown().await;
        self.delivery.shutdown().await;
        self.mesh.stop().await;
        info!("Lifeline node stopped");
    }

    /// Forward a host foreground/background transition to every service.
    pub async fn set_lifecycle(&self, lifecycle: AppLifecycle) {
        self.mesh.set_lifecycle(lifecycle).await;
        self.hybrid.set_lifecycle(lifecycle).await;
        if lifecycle == AppLifecycle::Background {
            self.delivery.flush().await;
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn mesh(&self) -> &MeshTransport {
        &self.mesh
    }

    pub fn delivery(&self) -> &DeliveryManager {
        &self.delivery
    }

    pub fn hybrid(&self) -> &HybridMessageService {
        &self.hybrid
    }
}
