//! Zone worker network layer: UDP request handling and the tick loop

use crate::scheduler::{SchedulerStats, TickScheduler};
use crate::scripts::ScriptRegistry;
use crate::zone::{WorkerConfig, Zone};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, MAX_PACKET_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Stops a running worker from outside.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // No receivers left means the worker is already gone.
        let _ = self.tx.send(true);
    }
}

/// A zone bound to a UDP socket.
pub struct ZoneWorker {
    socket: Arc<UdpSocket>,
    zone: Arc<Zone>,
    config: WorkerConfig,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ZoneWorker {
    /// Builds the zone and binds its socket. The zone does not tick or answer
    /// requests until [`ZoneWorker::run`] is called.
    pub async fn bind(config: WorkerConfig, registry: ScriptRegistry) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr()).await?);
        info!(
            "Zone {} listening on {}",
            config.zone_id,
            socket.local_addr()?
        );

        let zone = Arc::new(Zone::new(&config, registry));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            socket,
            zone,
            config,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn zone(&self) -> Arc<Zone> {
        Arc::clone(&self.zone)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Spawns task that listens for requests, answering each on its own task
    fn spawn_network_receiver(&self) -> tokio::task::JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let zone = Arc::clone(&self.zone);
        let mut stop = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];

            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok((len, addr)) => match deserialize::<Packet>(&buffer[..len]) {
                            Ok(packet) => {
                                let socket = Arc::clone(&socket);
                                let zone = Arc::clone(&zone);
                                tokio::spawn(async move {
                                    if let Some(response) = zone.handle(packet).await {
                                        send_packet(&socket, &response, addr).await;
                                    }
                                });
                            }
                            Err(e) => warn!("Failed to deserialize packet from {}: {}", addr, e),
                        },
                        Err(e) => {
                            error!("Error receiving packet: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Network receiver stopped");
        })
    }

    /// Serves requests and ticks the zone until shut down.
    pub async fn run(self) -> SchedulerStats {
        let receiver = self.spawn_network_receiver();

        let scheduler = TickScheduler::new(self.config.tick_interval, self.config.max_frame_skip);
        let zone = Arc::clone(&self.zone);
        let stats = scheduler
            .run(
                move |_| {
                    let zone = Arc::clone(&zone);
                    async move {
                        zone.tick().await;
                    }
                },
                self.shutdown_rx.clone(),
            )
            .await;

        let _ = self.shutdown_tx.send(true);
        if let Err(e) = receiver.await {
            error!("Network receiver task failed: {}", e);
        }

        info!(
            "Zone {} stopped after {} ticks ({} dropped)",
            self.config.zone_id, stats.ticks, stats.dropped
        );
        stats
    }
}

async fn send_packet(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) {
    let data = match serialize(packet) {
        Ok(data) if data.len() <= MAX_PACKET_SIZE => data,
        Ok(data) => {
            warn!(
                "Response to {} is {} bytes, too large for one datagram",
                addr,
                data.len()
            );
            let rejected = Packet::Rejected {
                reason: "response too large".to_string(),
            };
            match serialize(&rejected) {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to serialize rejection: {}", e);
                    return;
                }
            }
        }
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            return;
        }
    };

    if let Err(e) = socket.send_to(&data, addr).await {
        error!("Failed to send packet to {}: {}", addr, e);
    }
}
