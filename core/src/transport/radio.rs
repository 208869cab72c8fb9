// Radio capability — the thin interface the mesh core needs from a radio driver

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Radio-level id of the advertiser
    pub id: String,
    /// Received signal strength in dBm
    pub rssi: i16,
    pub manufacturer_data: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio unavailable: {0}")]
    Unavailable(String),
    #[error("Scan failed: {0}")]
    Scan(String),
    #[error("Advertise failed: {0}")]
    Advertise(String),
}

/// Short-range radio with a single advertisement slot.
///
/// `start_advertising` replaces whatever is currently being advertised.
#[async_trait]
pub trait RadioTransport: Send + Sync {
    async fn start_scanning(&self) -> Result<(), RadioError>;
    /// Stop both scanning and advertising.
    async fn stop_dual_mode(&self) -> Result<(), RadioError>;
    async fn start_advertising(&self, data: Vec<u8>) -> Result<(), RadioError>;
    /// Register the sink that receives every advertisement heard while scanning.
    fn on_peer_found(&self, sink: mpsc::UnboundedSender<Advertisement>);
}
