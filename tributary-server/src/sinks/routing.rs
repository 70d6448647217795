use std::collections::BTreeSet;

use tributary_config::{SinkConfig, SinkRoutingConfig, TagMatcher};
use tributary_metrics::InterMetric;

/// Why a routed metric was or was not delivered to a sink.
///
/// Every routed metric lands in exactly one status per sink, so the five
/// per-status counters of a sink sum to the number of metrics routed to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeStatus {
    /// Shaped and delivered.
    Flushed,
    /// Excluded by the metric's own sink filter.
    Skipped,
    /// Dropped: name longer than the sink's limit.
    MaxNameLength,
    /// Dropped: more tags than the sink's limit after stripping.
    MaxTags,
    /// Dropped: a tag longer than the sink's limit after stripping.
    MaxTagLength,
}

/// All statuses, in the order their counters are emitted.
pub const SHAPE_STATUSES: [ShapeStatus; 5] = [
    ShapeStatus::Flushed,
    ShapeStatus::Skipped,
    ShapeStatus::MaxNameLength,
    ShapeStatus::MaxTags,
    ShapeStatus::MaxTagLength,
];

impl ShapeStatus {
    /// The telemetry tag value for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flushed => "flushed",
            Self::Skipped => "skipped",
            Self::MaxNameLength => "max_name_length",
            Self::MaxTags => "max_tags",
            Self::MaxTagLength => "max_tag_length",
        }
    }
}

/// Per-status counts of one sink's shaping pass over one flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShapeCounts {
    flushed: i64,
    skipped: i64,
    max_name_length: i64,
    max_tags: i64,
    max_tag_length: i64,
}

impl ShapeCounts {
    /// Records one metric landing in `status`.
    pub fn record(&mut self, status: ShapeStatus) {
        match status {
            ShapeStatus::Flushed => self.flushed += 1,
            ShapeStatus::Skipped => self.skipped += 1,
            ShapeStatus::MaxNameLength => self.max_name_length += 1,
            ShapeStatus::MaxTags => self.max_tags += 1,
            ShapeStatus::MaxTagLength => self.max_tag_length += 1,
        }
    }

    /// Returns the count for `status`.
    pub fn get(&self, status: ShapeStatus) -> i64 {
        match status {
            ShapeStatus::Flushed => self.flushed,
            ShapeStatus::Skipped => self.skipped,
            ShapeStatus::MaxNameLength => self.max_name_length,
            ShapeStatus::MaxTags => self.max_tags,
            ShapeStatus::MaxTagLength => self.max_tag_length,
        }
    }

    /// The total number of metrics accounted for.
    pub fn total(&self) -> i64 {
        self.flushed + self.skipped + self.max_name_length + self.max_tags + self.max_tag_length
    }
}

/// Evaluates routing rules to decide which sinks receive a metric.
#[derive(Debug, Default)]
pub struct SinkRouter {
    enabled: bool,
    rules: Vec<SinkRoutingConfig>,
    all_sinks: BTreeSet<String>,
}

impl SinkRouter {
    /// Creates a router over the named sinks.
    ///
    /// When `enabled` is false, every sink receives every metric.
    pub fn new(
        enabled: bool,
        rules: Vec<SinkRoutingConfig>,
        sink_names: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            enabled,
            rules,
            all_sinks: sink_names.into_iter().collect(),
        }
    }

    /// Returns the set of sinks this metric is routed to.
    pub fn route(&self, metric: &InterMetric) -> BTreeSet<String> {
        if !self.enabled {
            return self.all_sinks.clone();
        }

        let mut sinks = BTreeSet::new();
        for rule in &self.rules {
            let matched = rule.matchers.iter().any(|matcher| {
                matcher.name.matches(&metric.name)
                    && matcher.tags.iter().all(|tag| tag.matches_any(&metric.tags))
            });

            let contributed = if matched {
                &rule.sinks.matched
            } else {
                &rule.sinks.not_matched
            };
            sinks.extend(contributed.iter().cloned());
        }

        sinks
    }
}

/// Applies one sink's shaping rules to routed metrics.
///
/// The checks run in a fixed order: strip tags, then the name length, tag
/// count, and tag length limits. Stripping first can bring a metric under
/// the tag count limit or remove an over-length tag.
#[derive(Debug)]
pub struct SinkShaper {
    name: String,
    strip_tags: Vec<TagMatcher>,
    max_name_length: usize,
    max_tags: usize,
    max_tag_length: usize,
}

impl SinkShaper {
    /// Creates the shaper for one sink's configuration.
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            name: config.display_name().to_owned(),
            strip_tags: config.strip_tags.clone(),
            max_name_length: config.max_name_length,
            max_tags: config.max_tags,
            max_tag_length: config.max_tag_length,
        }
    }

    /// Shapes one metric, or returns the status that dropped it.
    pub fn shape(&self, metric: &InterMetric) -> Result<InterMetric, ShapeStatus> {
        if !metric.allows_sink(&self.name) {
            return Err(ShapeStatus::Skipped);
        }

        let mut shaped = metric.clone();
        shaped
            .tags
            .retain(|tag| !self.strip_tags.iter().any(|matcher| matcher.matches(tag)));

        if self.max_name_length > 0 && shaped.name.len() > self.max_name_length {
            return Err(ShapeStatus::MaxNameLength);
        }

        if self.max_tags > 0 && shaped.tags.len() > self.max_tags {
            return Err(ShapeStatus::MaxTags);
        }

        if self.max_tag_length > 0 && shaped.tags.iter().any(|tag| tag.len() > self.max_tag_length)
        {
            return Err(ShapeStatus::MaxTagLength);
        }

        Ok(shaped)
    }
}

#[cfg(test)]
mod tests {
    use tributary_config::Config;
    use tributary_metrics::InterMetricKind;

    use super::*;

    fn metric(name: &str, tags: &[&str]) -> InterMetric {
        InterMetric::new(
            0,
            name.to_owned(),
            &tags.iter().map(|t| (*t).to_owned()).collect::<Vec<_>>(),
            1.0,
            InterMetricKind::Counter,
        )
    }

    fn shaper() -> SinkShaper {
        let config = Config::parse(
            r#"
metric_sinks:
  - kind: channel
    name: channel
    max_name_length: 11
    max_tag_length: 11
    max_tags: 2
    strip_tags:
      - kind: prefix
        value: foo
"#,
        )
        .unwrap();
        SinkShaper::new(&config.metric_sinks[0])
    }

    #[test]
    fn strips_matching_tags() {
        let shaped = shaper()
            .shape(&metric("test.metric", &["foo:value1", "bar:value2"]))
            .unwrap();
        assert_eq!(shaped.name, "test.metric");
        assert_eq!(shaped.tags, vec!["bar:value2".to_owned()]);
    }

    #[test]
    fn drops_long_names() {
        assert_eq!(
            shaper().shape(&metric("test.longmetric", &["key1:value1", "key2:value2"])),
            Err(ShapeStatus::MaxNameLength)
        );
    }

    #[test]
    fn drops_excess_tags() {
        assert_eq!(
            shaper().shape(&metric(
                "test.metric",
                &["key1:value1", "key2:value2", "key3:value3"]
            )),
            Err(ShapeStatus::MaxTags)
        );
    }

    #[test]
    fn stripping_can_rescue_tag_count() {
        let shaped = shaper()
            .shape(&metric(
                "test.metric",
                &["foo:value1", "key2:value2", "key3:value3"],
            ))
            .unwrap();
        assert_eq!(
            shaped.tags,
            vec!["key2:value2".to_owned(), "key3:value3".to_owned()]
        );
    }

    #[test]
    fn drops_long_tags() {
        assert_eq!(
            shaper().shape(&metric(
                "test.metric",
                &["key1:long1", "key2:longvalue2", "key3:value3"]
            )),
            Err(ShapeStatus::MaxTagLength)
        );
    }

    #[test]
    fn stripping_can_rescue_tag_length() {
        let shaped = shaper()
            .shape(&metric(
                "test.metric",
                &["foo:longvalue1", "key2:value2", "key3:value3"],
            ))
            .unwrap();
        assert_eq!(
            shaped.tags,
            vec!["key2:value2".to_owned(), "key3:value3".to_owned()]
        );
    }

    #[test]
    fn sink_filter_skips() {
        let filtered = metric("test.metric", &["sinkonly:kafka"]);
        assert_eq!(shaper().shape(&filtered), Err(ShapeStatus::Skipped));
    }

    #[test]
    fn disabled_router_fans_out_to_all() {
        let router = SinkRouter::new(false, vec![], ["a".to_owned(), "b".to_owned()]);
        let routed = router.route(&metric("anything", &[]));
        assert_eq!(routed.len(), 2);
    }

    #[test]
    fn rules_union_matched_and_not_matched() {
        let config = Config::parse(
            r#"
metric_sink_routing:
  - name: api
    match:
      - name:
          kind: prefix
          value: api.
        tags:
          - kind: exact
            value: env:prod
    sinks:
      matched: [primary]
      not_matched: [fallback]
  - name: everything
    match:
      - name:
          kind: any
    sinks:
      matched: [archive]
"#,
        )
        .unwrap();

        let router = SinkRouter::new(
            true,
            config.metric_sink_routing.clone(),
            ["primary".to_owned(), "fallback".to_owned(), "archive".to_owned()],
        );

        let routed = router.route(&metric("api.hits", &["env:prod"]));
        assert!(routed.contains("primary"));
        assert!(routed.contains("archive"));
        assert!(!routed.contains("fallback"));

        // Tag matcher fails: the rule contributes its not_matched sinks.
        let routed = router.route(&metric("api.hits", &["env:dev"]));
        assert!(routed.contains("fallback"));
        assert!(!routed.contains("primary"));

        let routed = router.route(&metric("web.hits", &["env:prod"]));
        assert!(routed.contains("fallback"));
        assert!(routed.contains("archive"));
    }

    #[test]
    fn counts_sum_to_routed() {
        let shaper = shaper();
        let mut counts = ShapeCounts::default();
        let inputs = [
            metric("test.metric", &["foo:value1", "bar:value2"]),
            metric("test.longmetric", &["key1:value1"]),
            metric("test.metric", &["key1:value1", "key2:value2", "key3:value3"]),
        ];

        for input in &inputs {
            match shaper.shape(input) {
                Ok(_) => counts.record(ShapeStatus::Flushed),
                Err(status) => counts.record(status),
            }
        }

        assert_eq!(counts.total(), inputs.len() as i64);
        assert_eq!(counts.get(ShapeStatus::Flushed), 1);
        assert_eq!(counts.get(ShapeStatus::MaxNameLength), 1);
        assert_eq!(counts.get(ShapeStatus::MaxTags), 1);
    }
}
