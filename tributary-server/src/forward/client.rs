use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tributary_metrics::wire;
use tributary_statsd::metric;

use crate::statsd::ServerCounters;

/// An error forwarding a partial batch.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The global instance could not be reached or the stream broke.
    #[error("forward address unreachable: {0}")]
    Unreachable(#[source] std::io::Error),
    /// The stream completed but no valid response arrived.
    #[error("forward response missing or malformed")]
    Serialization,
}

impl ForwardError {
    /// The telemetry tag value for this error.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Serialization => "serialization",
        }
    }
}

/// Forwards one flush interval's partials under a deadline.
///
/// Failures are counted on `forward.error_total{cause}` and the partials are
/// dropped; there is no retry and no buffering.
pub async fn forward_partials(address: String, partials: Vec<wire::Metric>, deadline: Duration) {
    let count = partials.len();

    match tokio::time::timeout(deadline, send_stream(&address, partials)).await {
        Ok(Ok(accepted)) => {
            tributary_log::debug!(
                address = address.as_str(),
                sent = count,
                accepted,
                "forwarded partial aggregates"
            );
        }
        Ok(Err(error)) => {
            tributary_log::warn!(
                address = address.as_str(),
                dropped = count,
                "could not forward partial aggregates: {error}"
            );
            metric!(
                counter(ServerCounters::ForwardErrorTotal) += 1,
                cause = error.cause()
            );
        }
        Err(_elapsed) => {
            tributary_log::warn!(
                address = address.as_str(),
                dropped = count,
                "forwarding partial aggregates exceeded the flush deadline"
            );
            metric!(
                counter(ServerCounters::ForwardErrorTotal) += 1,
                cause = "deadline_exceeded"
            );
        }
    }
}

/// Streams the partials and returns the receiver's accepted count.
async fn send_stream(address: &str, partials: Vec<wire::Metric>) -> Result<u64, ForwardError> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(ForwardError::Unreachable)?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    for partial in partials {
        framed
            .send(Bytes::from(partial.encode_to_vec()))
            .await
            .map_err(ForwardError::Unreachable)?;
    }

    // Half-close the write side so the receiver observes the end of the
    // stream and replies.
    framed
        .get_mut()
        .shutdown()
        .await
        .map_err(ForwardError::Unreachable)?;

    let frame = framed
        .next()
        .await
        .ok_or(ForwardError::Serialization)?
        .map_err(ForwardError::Unreachable)?;

    let response =
        wire::ForwardResponse::decode(frame.freeze()).map_err(|_| ForwardError::Serialization)?;

    Ok(response.accepted)
}
