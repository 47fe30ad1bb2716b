use bincode::{deserialize, serialize};
use log::debug;
use shared::{Packet, MAX_PACKET_SIZE};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed packet: {0}")]
    Codec(#[from] bincode::Error),
    #[error("no answer from {0} in time")]
    Timeout(String),
    #[error("cannot resolve endpoint {0}")]
    BadEndpoint(String),
    #[error("unexpected answer from {endpoint}: {answer}")]
    Unexpected { endpoint: String, answer: String },
}

/// Decides whether a worker is ready to serve traffic.
pub trait LivenessProbe: Send + Sync {
    fn probe(&self, endpoint: &str) -> impl Future<Output = bool> + Send;
}

/// Talks to zone workers: one request datagram, one response datagram.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    timeout: Duration,
}

impl WorkerClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn resolve(endpoint: &str) -> Result<SocketAddr, ClientError> {
        lookup_host(endpoint)
            .await
            .map_err(|_| ClientError::BadEndpoint(endpoint.to_string()))?
            .next()
            .ok_or_else(|| ClientError::BadEndpoint(endpoint.to_string()))
    }

    /// Sends `packet` to the worker at `endpoint` and waits for its answer.
    pub async fn request(&self, endpoint: &str, packet: &Packet) -> Result<Packet, ClientError> {
        let addr = Self::resolve(endpoint).await?;
        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        socket.send(&serialize(packet)?).await?;

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buffer))
            .await
            .map_err(|_| ClientError::Timeout(endpoint.to_string()))??;

        Ok(deserialize(&buffer[..len])?)
    }

    /// Pings a worker, returning the zone it serves and its tick count.
    pub async fn ping(&self, endpoint: &str) -> Result<(String, u64), ClientError> {
        match self.request(endpoint, &Packet::Ping).await? {
            Packet::Pong { zone_id, tick } => Ok((zone_id, tick)),
            other => Err(ClientError::Unexpected {
                endpoint: endpoint.to_string(),
                answer: format!("{:?}", other),
            }),
        }
    }
}

impl LivenessProbe for WorkerClient {
    async fn probe(&self, endpoint: &str) -> bool {
        match self.ping(endpoint).await {
            Ok((zone_id, tick)) => {
                debug!("{} ({}) alive at tick {}", endpoint, zone_id, tick);
                true
            }
            Err(e) => {
                debug!("{} failed its liveness probe: {}", endpoint, e);
                false
            }
        }
    }
}
