//! Connection lifecycle of the base station.
//!
//! [`Fleet`] owns the swarm, the router and one inbound pump task. Radio
//! links and local process transports push their MACP frames into a single
//! queue; the pump hands them to the router in arrival order and keeps the
//! shared store's view of connected agents in sync with swarm membership.

use bytes::Bytes;
use macp_swarm::store::{CONNECTED_AGENTS, SELECTED_AGENTS};
use macp_swarm::{AgentFactory, SharedStore, Swarm, SwarmEvent};
use macp_types::address::LOCAL_PORT_MACP;
use macp_types::config::MacpConfig;
use macp_types::{AgentAddress, MacpError, MacpResult, RadioPacket};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::router::MacpRouter;

/// A frame waiting to be routed.
#[derive(Debug)]
enum Inbound {
    Radio {
        origin: AgentAddress,
        packet: RadioPacket,
    },
    Local {
        origin: AgentAddress,
        data: Bytes,
    },
}

pub struct Fleet {
    swarm: Arc<Swarm>,
    router: Arc<MacpRouter>,
    store: Arc<SharedStore>,
    config: MacpConfig,
    inbound: mpsc::UnboundedSender<Inbound>,
    shutdown_tx: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Fleet {
    /// Create an empty fleet and start its inbound pump.
    pub fn new(config: MacpConfig, store: Arc<SharedStore>) -> Arc<Self> {
        let swarm = Swarm::new();
        let router = Arc::new(MacpRouter::new(Arc::clone(&swarm), config.radio.clone()));
        let (inbound, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        sync_connected(&swarm, &store);
        let pump = tokio::spawn(pump_loop(
            rx,
            swarm.subscribe(),
            shutdown_rx,
            Arc::clone(&router),
            Arc::clone(&swarm),
            Arc::clone(&store),
        ));

        Arc::new(Self {
            swarm,
            router,
            store,
            config,
            inbound,
            shutdown_tx,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn swarm(&self) -> &Arc<Swarm> {
        &self.swarm
    }

    pub fn router(&self) -> &Arc<MacpRouter> {
        &self.router
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn config(&self) -> &MacpConfig {
        &self.config
    }

    /// Add the agent at `address`, hook its inbound traffic into the router
    /// and open its link.
    ///
    /// If the link does not open the agent is removed again.
    pub async fn connect(&self, address: AgentAddress, factory: &dyn AgentFactory) -> MacpResult<()> {
        if self.swarm.contains(address) {
            return Err(MacpError::AgentAlreadyExists(address));
        }
        if !self.swarm.add_agent(address, factory) {
            return Err(MacpError::ConnectionFailed {
                address,
                reason: "agent could not be constructed".to_string(),
            });
        }

        let port = self.config.radio.macp_port;
        let radio_feed = self.inbound.clone();
        self.swarm.single(address, |agent| {
            agent.link().add_port_callback(
                port,
                Arc::new(move |packet: RadioPacket| {
                    let _ = radio_feed.send(Inbound::Radio {
                        origin: address,
                        packet,
                    });
                }),
            )
        });

        let local_feed = self.inbound.clone();
        self.swarm.single_local(address, |agent| {
            agent.transport().add_port_callback(
                LOCAL_PORT_MACP,
                Arc::new(move |data: Bytes| {
                    let _ = local_feed.send(Inbound::Local {
                        origin: address,
                        data,
                    });
                }),
            )
        });

        if !self.swarm.open_link(address).await {
            self.swarm.remove_agent(address).await;
            return Err(MacpError::ConnectionFailed {
                address,
                reason: "link did not open".to_string(),
            });
        }
        info!(address = %address, "Agent connected");
        Ok(())
    }

    /// Close the agent's link and remove it.
    pub async fn disconnect(&self, address: AgentAddress) {
        self.swarm.remove_agent(address).await;
    }

    pub async fn disconnect_all(&self) {
        self.swarm.shutdown().await;
    }

    /// Agents whose link is open, as last published to the store.
    pub fn connected_agents(&self) -> Vec<AgentAddress> {
        self.store.read(CONNECTED_AGENTS).unwrap_or_default()
    }

    /// Agents the operator selected, read from the store.
    pub fn selected_agents(&self) -> Vec<AgentAddress> {
        self.store.read(SELECTED_AGENTS).unwrap_or_default()
    }

    /// Disconnect every agent and stop the pump.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        let _ = self.shutdown_tx.send(true);
        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                error!("Fleet: inbound pump panicked: {e}");
            }
        }
        sync_connected(&self.swarm, &self.store);
        info!("Fleet shut down");
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Publish the agents with an open link to the store.
fn sync_connected(swarm: &Swarm, store: &SharedStore) {
    let connected: Vec<AgentAddress> = swarm
        .addresses()
        .into_iter()
        .filter(|address| swarm.is_link_open(*address))
        .collect();
    if let Err(e) = store.write(CONNECTED_AGENTS, &connected) {
        warn!(error = %e, "Failed to publish connected agents");
    }
}

async fn pump_loop(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut events: broadcast::Receiver<SwarmEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    router: Arc<MacpRouter>,
    swarm: Arc<Swarm>,
    store: Arc<SharedStore>,
) {
    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(Inbound::Radio { origin, packet }) => {
                    router.distribute_radio(packet, origin).await;
                }
                Some(Inbound::Local { origin, data }) => {
                    router.distribute_local(data, origin).await;
                }
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => {
                    debug!(?event, "Fleet: membership changed");
                    sync_connected(&swarm, &store);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Fleet: membership events lagged");
                    sync_connected(&swarm, &store);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Fleet: inbound pump stopped");
}
