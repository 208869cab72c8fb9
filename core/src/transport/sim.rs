//! In-memory radio medium for tests and the CLI simulator.
//!
//! Every [`SimRadio`] attached to the same [`SimulatedAir`] hears the
//! advertisements of radios it is linked to. The air starts fully connected;
//! calling [`SimulatedAir::link`] switches to an explicit topology so
//! multi-hop scenarios (A - B - C) can be built.

use super::radio::{Advertisement, RadioError, RadioTransport};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

const DEFAULT_RSSI: i16 = -60;

#[derive(Default)]
struct Station {
    scanning: bool,
    sink: Option<mpsc::UnboundedSender<Advertisement>>,
    advertising: Option<Vec<u8>>,
    history: Vec<Vec<u8>>,
    fail_next: u32,
}

#[derive(Default)]
struct AirState {
    stations: HashMap<String, Station>,
    /// `None` means every station hears every other station.
    links: Option<HashSet<(String, String)>>,
    rssi: HashMap<(String, String), i16>,
}

impl AirState {
    fn in_range(&self, a: &str, b: &str) -> bool {
        match &self.links {
            None => true,
            Some(links) => links.contains(&pair(a, b)),
        }
    }
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Clone, Default)]
pub struct SimulatedAir {
    state: Arc<RwLock<AirState>>,
}

impl SimulatedAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a radio with the given id.
    pub fn radio(&self, id: &str) -> SimRadio {
        self.state
            .write()
            .stations
            .entry(id.to_string())
            .or_default();
        SimRadio {
            id: id.to_string(),
            air: self.clone(),
        }
    }

    /// Put two radios in range of each other. The first call switches the air
    /// from fully connected to explicit links.
    pub fn link(&self, a: &str, b: &str) {
        self.state
            .write()
            .links
            .get_or_insert_with(HashSet::new)
            .insert(pair(a, b));
    }

    pub fn unlink(&self, a: &str, b: &str) {
        if let Some(links) = self.state.write().links.as_mut() {
            links.remove(&pair(a, b));
        }
    }

    pub fn set_rssi(&self, a: &str, b: &str, rssi: i16) {
        self.state.write().rssi.insert(pair(a, b), rssi);
    }

    /// Make the next `count` advertise calls from `id` fail.
    pub fn fail_next_advertises(&self, id: &str, count: u32) {
        if let Some(station) = self.state.write().stations.get_mut(id) {
            station.fail_next = count;
        }
    }

    /// Every payload `id` has successfully advertised, oldest first.
    pub fn advertised_by(&self, id: &str) -> Vec<Vec<u8>> {
        self.state
            .read()
            .stations
            .get(id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub fn current_advertisement(&self, id: &str) -> Option<Vec<u8>> {
        self.state
            .read()
            .stations
            .get(id)
            .and_then(|s| s.advertising.clone())
    }

    pub fn is_scanning(&self, id: &str) -> bool {
        self.state
            .read()
            .stations
            .get(id)
            .map(|s| s.scanning)
            .unwrap_or(false)
    }

    fn broadcast(&self, from: &str, data: Vec<u8>) -> Result<(), RadioError> {
        let mut state = self.state.write();
        let station = state
            .stations
            .get_mut(from)
            .ok_or_else(|| RadioError::Unavailable(format!("unknown radio {}", from)))?;
        if station.fail_next > 0 {
            station.fail_next -= 1;
            return Err(RadioError::Advertise("simulated radio fault".into()));
        }
        station.advertising = Some(data.clone());
        station.history.push(data.clone());

        for (id, listener) in state.stations.iter() {
            if id == from || !listener.scanning || !state.in_range(from, id) {
                continue;
            }
            if let Some(sink) = &listener.sink {
                let rssi = state
                    .rssi
                    .get(&pair(from, id))
                    .copied()
                    .unwrap_or(DEFAULT_RSSI);
                let _ = sink.send(Advertisement {
                    id: from.to_string(),
                    rssi,
                    manufacturer_data: data.clone(),
                });
            }
        }
        Ok(())
    }
}

pub struct SimRadio {
    id: String,
    air: SimulatedAir,
}

impl SimRadio {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl RadioTransport for SimRadio {
    async fn start_scanning(&self) -> Result<(), RadioError> {
        let mut state = self.air.state.write();
        let station = state.stations.entry(self.id.clone()).or_default();
        station.scanning = true;
        Ok(())
    }

    async fn stop_dual_mode(&self) -> Result<(), RadioError> {
        let mut state = self.air.state.write();
        if let Some(station) = state.stations.get_mut(&self.id) {
            station.scanning = false;
            station.advertising = None;
        }
        Ok(())
    }

    async fn start_advertising(&self, data: Vec<u8>) -> Result<(), RadioError> {
        self.air.broadcast(&self.id, data)
    }

    fn on_peer_found(&self, sink: mpsc::UnboundedSender<Advertisement>) {
        let mut state = self.air.state.write();
        state.stations.entry(self.id.clone()).or_default().sink = Some(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_linked_radios_hear_each_other() {
        let air = SimulatedAir::new();
        let a = air.radio("a");
        let b = air.radio("b");
        let c = air.radio("c");
        air.link("a", "b");
        air.link("b", "c");

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();
        b.on_peer_found(tx_b);
        c.on_peer_found(tx_c);
        b.start_scanning().await.unwrap();
        c.start_scanning().await.unwrap();

        a.start_advertising(vec![1, 2, 3]).await.unwrap();

        let heard = rx_b.try_recv().unwrap();
        assert_eq!(heard.id, "a");
        assert_eq!(heard.manufacturer_data, vec![1, 2, 3]);
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_injected_fault() {
        let air = SimulatedAir::new();
        let a = air.radio("a");
        air.fail_next_advertises("a", 1);

        assert!(a.start_advertising(vec![1]).await.is_err());
        assert!(a.start_advertising(vec![2]).await.is_ok());
        assert_eq!(air.advertised_by("a"), vec![vec![2]]);
    }

    #[tokio::test]
    async fn test_not_scanning_hears_nothing() {
        let air = SimulatedAir::new();
        let a = air.radio("a");
        let b = air.radio("b");
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.on_peer_found(tx);

        a.start_advertising(vec![9]).await.unwrap();
        assert!(rx.try_recv().is_err());

        b.start_scanning().await.unwrap();
        b.stop_dual_mode().await.unwrap();
        assert!(!air.is_scanning("b"));
    }
}
