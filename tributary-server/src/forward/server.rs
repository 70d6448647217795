use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tributary_metrics::{wire, worker_index, MergePartial, Worker};
use tributary_system::{Addr, ShutdownHandle};

/// Accepts forwarded partial streams on a global instance.
///
/// Each inbound partial is routed to the worker owning its digest and merged
/// through the worker's normal channel, so forwarded state participates in
/// the next flush exactly as locally-ingested samples do.
pub fn spawn_forward_listener(
    listener: TcpListener,
    workers: Vec<Addr<Worker>>,
    mut shutdown: ShutdownHandle,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,

                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        tributary_log::debug!(peer = %peer, "accepted forward stream");
                        let workers = workers.clone();
                        tokio::spawn(handle_stream(socket, workers));
                    }
                    Err(error) => {
                        tributary_log::warn!("could not accept forward stream: {error}");
                    }
                },
            }
        }
    });
}

async fn handle_stream(socket: TcpStream, workers: Vec<Addr<Worker>>) {
    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
    let mut accepted = 0u64;

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                tributary_log::warn!("forward stream broke mid-flight: {error}");
                return;
            }
        };

        match wire::Metric::decode(frame.freeze()) {
            Ok(partial) => {
                let index = worker_index(partial.digest, workers.len());
                if workers[index].send(MergePartial(partial)).await.is_ok() {
                    accepted += 1;
                }
            }
            Err(error) => {
                tributary_log::warn!("dropping undecodable forwarded partial: {error}");
            }
        }
    }

    let response = wire::ForwardResponse { accepted };
    if let Err(error) = framed.send(Bytes::from(response.encode_to_vec())).await {
        tributary_log::debug!("could not send forward response: {error}");
    }
}
