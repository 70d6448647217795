use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tributary_config::{Config, ListenAddr, SourceConfig};
use tributary_metrics::Sample;
use tributary_statsd::metric;
use tributary_system::ShutdownHandle;

use super::{Source, SourceError};
use crate::statsd::ServerCounters;
use crate::Ingest;

/// Largest accepted statsd datagram.
const MAX_DATAGRAM: usize = 65_536;

/// The built-in statsd listener source.
///
/// Listens on the configured `udp://` and `tcp://` addresses and parses
/// dogstatsd-flavored lines into samples. Malformed lines are counted and
/// dropped, never propagated.
pub struct StatsdSource {
    name: String,
    addresses: Vec<ListenAddr>,
}

impl StatsdSource {
    /// Creates the source for the addresses in `statsd_listen_addresses`.
    pub fn from_config(source_config: &SourceConfig, config: &Config) -> Self {
        let name = if source_config.name.is_empty() {
            "statsd".to_owned()
        } else {
            source_config.name.clone()
        };

        Self {
            name,
            addresses: config.statsd_listen_addresses.clone(),
        }
    }
}

#[async_trait]
impl Source for StatsdSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        self: Box<Self>,
        ingest: Ingest,
        shutdown: ShutdownHandle,
    ) -> Result<(), SourceError> {
        for address in &self.addresses {
            match address {
                ListenAddr::Udp(addr) => {
                    let socket = UdpSocket::bind(addr).await.map_err(|source| {
                        SourceError::Bind {
                            address: address.to_string(),
                            source,
                        }
                    })?;
                    tributary_log::info!(address = addr.as_str(), "listening for statsd over udp");
                    tokio::spawn(run_udp(socket, ingest.clone(), shutdown.clone()));
                }
                ListenAddr::Tcp(addr) => {
                    let listener = TcpListener::bind(addr).await.map_err(|source| {
                        SourceError::Bind {
                            address: address.to_string(),
                            source,
                        }
                    })?;
                    tributary_log::info!(address = addr.as_str(), "listening for statsd over tcp");
                    tokio::spawn(run_tcp(listener, ingest.clone(), shutdown.clone()));
                }
                ListenAddr::Unix(path) => {
                    tributary_log::warn!(
                        path = %path.display(),
                        "unix statsd listeners are not supported, skipping"
                    );
                }
            }
        }

        Ok(())
    }
}

fn ingest_datagram(ingest: &Ingest, datagram: &str) {
    for line in datagram.lines().filter(|line| !line.is_empty()) {
        match Sample::parse_statsd(line) {
            Ok(sample) => ingest.ingest(sample),
            Err(error) => {
                tributary_log::debug!("dropping malformed statsd line: {error}");
                metric!(
                    counter(ServerCounters::SamplesRejected) += 1,
                    reason = "parse"
                );
            }
        }
    }
}

async fn run_udp(socket: UdpSocket, ingest: Ingest, mut shutdown: ShutdownHandle) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _peer)) => {
                    let datagram = String::from_utf8_lossy(&buf[..len]);
                    ingest_datagram(&ingest, &datagram);
                }
                Err(error) => {
                    tributary_log::warn!("udp statsd receive failed: {error}");
                }
            },
        }
    }
}

async fn run_tcp(listener: TcpListener, ingest: Ingest, mut shutdown: ShutdownHandle) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            accepted = listener.accept() => match accepted {
                Ok((socket, _peer)) => {
                    tokio::spawn(run_tcp_connection(socket, ingest.clone(), shutdown.clone()));
                }
                Err(error) => {
                    tributary_log::warn!("could not accept statsd connection: {error}");
                }
            },
        }
    }
}

async fn run_tcp_connection(socket: TcpStream, ingest: Ingest, mut shutdown: ShutdownHandle) {
    let mut lines = BufReader::new(socket).lines();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            line = lines.next_line() => match line {
                Ok(Some(line)) => ingest_datagram(&ingest, &line),
                Ok(None) => break,
                Err(error) => {
                    tributary_log::debug!("statsd connection dropped: {error}");
                    break;
                }
            },
        }
    }
}
