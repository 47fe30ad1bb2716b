//! Master network layer: answers zone lookups over UDP

use crate::directory::{character_zone, Authenticator, CharacterDirectory};
use crate::launcher::ZoneLauncher;
use crate::probe::LivenessProbe;
use crate::supervisor::ProcessSupervisor;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, MAX_PACKET_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

pub struct MasterServer<S, P> {
    socket: Arc<UdpSocket>,
    launcher: Arc<ZoneLauncher<S, P>>,
    auth: Arc<dyn Authenticator>,
    directory: Arc<dyn CharacterDirectory>,
}

impl<S, P> MasterServer<S, P>
where
    S: ProcessSupervisor + 'static,
    P: LivenessProbe + 'static,
{
    pub async fn bind(
        addr: &str,
        launcher: Arc<ZoneLauncher<S, P>>,
        auth: Arc<dyn Authenticator>,
        directory: Arc<dyn CharacterDirectory>,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Master zone server listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            launcher,
            auth,
            directory,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives requests until `stop` turns true. Every request is handled
    /// on its own task, since a resolve may wait for a worker to start.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[..len]) {
                        Ok(packet) => self.spawn_handler(packet, addr),
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

        debug!("Master zone server stopped");
    }

    fn spawn_handler(&self, packet: Packet, addr: SocketAddr) {
        let socket = Arc::clone(&self.socket);
        let launcher = Arc::clone(&self.launcher);
        let auth = Arc::clone(&self.auth);
        let directory = Arc::clone(&self.directory);

        tokio::spawn(async move {
            let response = match packet {
                Packet::Resolve { zone_id } => resolve(&launcher, &zone_id).await,
                Packet::CharacterZone {
                    credentials,
                    character,
                } => {
                    match character_zone(auth.as_ref(), directory.as_ref(), &credentials, &character)
                    {
                        Ok(zone_id) => resolve(&launcher, &zone_id).await,
                        Err(e) => {
                            warn!("Zone lookup for {} refused: {}", character, e);
                            Packet::ResolveFailed {
                                reason: e.to_string(),
                                retriable: false,
                            }
                        }
                    }
                }
                Packet::Ping => Packet::Pong {
                    zone_id: String::new(),
                    tick: 0,
                },
                other => {
                    warn!("Unexpected packet from {}: {:?}", addr, other);
                    return;
                }
            };

            match serialize(&response) {
                Ok(data) => {
                    if let Err(e) = socket.send_to(&data, addr).await {
                        error!("Failed to send packet to {}: {}", addr, e);
                    }
                }
                Err(e) => error!("Failed to serialize response: {}", e),
            }
        });
    }
}

async fn resolve<S, P>(launcher: &ZoneLauncher<S, P>, zone_id: &str) -> Packet
where
    S: ProcessSupervisor,
    P: LivenessProbe,
{
    match launcher.resolve(zone_id).await {
        Ok(endpoint) => Packet::Resolved {
            zone_id: zone_id.to_string(),
            endpoint,
        },
        Err(e) => {
            warn!("Could not resolve {}: {}", zone_id, e);
            Packet::ResolveFailed {
                reason: e.to_string(),
                retriable: e.is_retriable(),
            }
        }
    }
}
