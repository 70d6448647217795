//! Wire representation of forwarded partial aggregates.
//!
//! Local instances serialize the mergeable state of their aggregators into
//! these messages and stream them to the global instance, which merges them
//! into its own aggregators. Rank sketches and cardinality sketches are
//! forwarded as sketches, not as finalized values, so that global quantiles
//! and cardinalities stay exact to the sketches' guarantees.
//!
//! The message structs are maintained by hand in prost's generated style;
//! the framing on the socket is length-delimited.

use crate::MetricKind;

/// The metric kinds that can appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Kind {
    /// Unset.
    Unspecified = 0,
    /// A counter partial carrying a sum.
    Counter = 1,
    /// A gauge partial carrying the last value.
    Gauge = 2,
    /// A histogram partial carrying a rank sketch.
    Histogram = 3,
    /// A timer partial carrying a rank sketch.
    Timer = 4,
    /// A set partial carrying a cardinality sketch.
    Set = 5,
}

impl Kind {
    /// Converts the wire kind to the protocol kind.
    pub fn to_metric_kind(self) -> Option<MetricKind> {
        match self {
            Self::Unspecified => None,
            Self::Counter => Some(MetricKind::Counter),
            Self::Gauge => Some(MetricKind::Gauge),
            Self::Histogram => Some(MetricKind::Histogram),
            Self::Timer => Some(MetricKind::Timer),
            Self::Set => Some(MetricKind::Set),
        }
    }

    /// Converts a protocol kind to the wire kind, where representable.
    pub fn from_metric_kind(kind: MetricKind) -> Option<Self> {
        match kind {
            MetricKind::Counter => Some(Self::Counter),
            MetricKind::Gauge => Some(Self::Gauge),
            MetricKind::Histogram => Some(Self::Histogram),
            MetricKind::Timer => Some(Self::Timer),
            MetricKind::Set => Some(Self::Set),
            MetricKind::StatusCheck | MetricKind::Event => None,
        }
    }
}

/// One forwarded partial aggregate.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metric {
    /// The metric name.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// Tags in `k:v` form, sorted.
    #[prost(string, repeated, tag = "2")]
    pub tags: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// The metric kind.
    #[prost(enumeration = "Kind", tag = "3")]
    pub kind: i32,
    /// The sender's identity digest. Stable across processes, so the
    /// receiver shards the merge without re-deriving identity.
    #[prost(fixed64, tag = "4")]
    pub digest: u64,
    /// The kind-specific partial state.
    #[prost(oneof = "Value", tags = "5, 6, 7, 8")]
    pub value: ::core::option::Option<Value>,
}

/// The kind-specific partial state of a [`Metric`].
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Value {
    /// Counter sum.
    #[prost(sint64, tag = "5")]
    Counter(i64),
    /// Gauge last value.
    #[prost(double, tag = "6")]
    Gauge(f64),
    /// Set cardinality sketch.
    #[prost(message, tag = "7")]
    Set(SetState),
    /// Histogram rank sketch.
    #[prost(message, tag = "8")]
    Histogram(HistogramState),
}

/// Serialized HyperLogLog registers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetState {
    /// Register precision; the register count is `2^precision`.
    #[prost(uint32, tag = "1")]
    pub precision: u32,
    /// One byte per register.
    #[prost(bytes = "vec", tag = "2")]
    pub registers: ::prost::alloc::vec::Vec<u8>,
}

/// Serialized t-digest state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HistogramState {
    /// The digest's compression constant.
    #[prost(double, tag = "1")]
    pub compression: f64,
    /// Centroid means, sorted ascending.
    #[prost(double, repeated, tag = "2")]
    pub means: ::prost::alloc::vec::Vec<f64>,
    /// Centroid weights, parallel to `means`.
    #[prost(double, repeated, tag = "3")]
    pub weights: ::prost::alloc::vec::Vec<f64>,
    /// Exact minimum of the observed values.
    #[prost(double, tag = "4")]
    pub min: f64,
    /// Exact maximum of the observed values.
    #[prost(double, tag = "5")]
    pub max: f64,
    /// Exact sum of the observed values.
    #[prost(double, tag = "6")]
    pub sum: f64,
}

/// The terminal response of a forward stream.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ForwardResponse {
    /// Number of partials merged by the receiver.
    #[prost(uint64, tag = "1")]
    pub accepted: u64,
}

#[cfg(test)]
mod tests {
    use prost::Message as _;

    use super::*;

    #[test]
    fn metric_roundtrip() {
        let metric = Metric {
            name: "api.latency".to_owned(),
            tags: vec!["env:prod".to_owned()],
            kind: Kind::Histogram as i32,
            digest: 0xdead_beef,
            value: Some(Value::Histogram(HistogramState {
                compression: 100.0,
                means: vec![1.0, 2.0],
                weights: vec![1.0, 3.0],
                min: 1.0,
                max: 2.0,
                sum: 7.0,
            })),
        };

        let encoded = metric.encode_to_vec();
        let decoded = Metric::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded, metric);
        assert_eq!(decoded.kind(), Kind::Histogram);
    }

    #[test]
    fn unknown_kind_decodes_as_unspecified() {
        let metric = Metric {
            kind: 42,
            ..Default::default()
        };
        assert_eq!(metric.kind(), Kind::Unspecified);
        assert_eq!(metric.kind().to_metric_kind(), None);
    }
}
