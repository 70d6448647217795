use super::SketchError;

/// Default compression constant.
///
/// Bounds the number of retained centroids to a small multiple of this value
/// while keeping tail quantiles accurate to a fraction of a percent.
pub const DEFAULT_COMPRESSION: f64 = 100.0;

/// A weighted point of a [`TDigest`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Centroid {
    /// The weighted mean of the values folded into this centroid.
    pub mean: f64,
    /// The total weight folded into this centroid.
    pub weight: f64,
}

/// A merging t-digest rank sketch.
///
/// Values are buffered and periodically compressed into a sorted list of
/// centroids. Centroids near the distribution's tails stay small, which
/// keeps extreme quantiles accurate; centroids near the median may grow up
/// to a bound proportional to `total_weight / compression`. Memory is
/// bounded regardless of how many values are added.
///
/// Two digests with the same compression merge exactly: merging is the same
/// operation as adding the other digest's centroids as weighted values.
#[derive(Clone, Debug)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<Centroid>,
    min: f64,
    max: f64,
    sum: f64,
    count: f64,
}

impl TDigest {
    /// Creates an empty digest with the given compression constant.
    pub fn new(compression: f64) -> Self {
        let compression = if compression.is_finite() && compression >= 10.0 {
            compression
        } else {
            DEFAULT_COMPRESSION
        };

        Self {
            compression,
            centroids: Vec::new(),
            buffer: Vec::new(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0.0,
        }
    }

    /// The configured compression constant.
    pub fn compression(&self) -> f64 {
        self.compression
    }

    /// The number of values added, including weights.
    pub fn count(&self) -> f64 {
        self.count
    }

    /// The sum of all added values, scaled by their weights.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// The smallest added value, or `NaN` when empty.
    pub fn min(&self) -> f64 {
        if self.count == 0.0 {
            f64::NAN
        } else {
            self.min
        }
    }

    /// The largest added value, or `NaN` when empty.
    pub fn max(&self) -> f64 {
        if self.count == 0.0 {
            f64::NAN
        } else {
            self.max
        }
    }

    /// The weighted mean of all added values, or `NaN` when empty.
    pub fn avg(&self) -> f64 {
        self.sum / self.count
    }

    /// Adds a value with the given weight.
    ///
    /// Non-finite values and non-positive weights are ignored.
    pub fn add(&mut self, value: f64, weight: f64) {
        if !value.is_finite() || !weight.is_finite() || weight <= 0.0 {
            return;
        }

        self.buffer.push(Centroid {
            mean: value,
            weight,
        });
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value * weight;
        self.count += weight;

        if self.buffer.len() >= self.buffer_limit() {
            self.compress();
        }
    }

    /// Merges another digest into this one.
    pub fn merge(&mut self, other: &TDigest) {
        if other.count == 0.0 {
            return;
        }

        for centroid in other.centroids.iter().chain(other.buffer.iter()) {
            self.buffer.push(*centroid);
            if self.buffer.len() >= self.buffer_limit() {
                self.compress();
            }
        }

        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
    }

    /// Returns the value at rank quantile `q`, clamping to `[0, 1]`.
    ///
    /// `q = 0` returns the exact minimum and `q = 1` the exact maximum.
    /// Between centroids, the value is linearly interpolated. Returns `NaN`
    /// when the digest is empty.
    pub fn quantile(&mut self, q: f64) -> f64 {
        if self.count == 0.0 {
            return f64::NAN;
        }

        self.compress();

        if q <= 0.0 {
            return self.min;
        }
        if q >= 1.0 {
            return self.max;
        }

        let target = q * self.count;
        let mut cumulative = 0.0;
        let mut previous_mid = 0.0;
        let mut previous_mean = self.min;

        for centroid in &self.centroids {
            let mid = cumulative + centroid.weight / 2.0;
            if target < mid {
                let span = mid - previous_mid;
                let fraction = if span > 0.0 {
                    (target - previous_mid) / span
                } else {
                    0.0
                };
                let value = previous_mean + fraction * (centroid.mean - previous_mean);
                return value.clamp(self.min, self.max);
            }
            cumulative += centroid.weight;
            previous_mid = mid;
            previous_mean = centroid.mean;
        }

        // Past the last centroid's midpoint: interpolate towards the maximum.
        let span = self.count - previous_mid;
        let fraction = if span > 0.0 {
            (target - previous_mid) / span
        } else {
            1.0
        };
        (previous_mean + fraction * (self.max - previous_mean)).clamp(self.min, self.max)
    }

    /// Compresses pending values and returns the centroids, sorted by mean.
    pub fn centroids(&mut self) -> &[Centroid] {
        self.compress();
        &self.centroids
    }

    /// Reassembles a digest from its serialized parts.
    ///
    /// `means` and `weights` must have equal lengths and finite entries.
    pub fn from_parts(
        compression: f64,
        means: &[f64],
        weights: &[f64],
        min: f64,
        max: f64,
        sum: f64,
    ) -> Result<Self, SketchError> {
        if means.len() != weights.len() {
            return Err(SketchError::InvalidState);
        }

        let mut digest = Self::new(compression);
        for (&mean, &weight) in means.iter().zip(weights) {
            if !mean.is_finite() || !weight.is_finite() || weight <= 0.0 {
                return Err(SketchError::InvalidState);
            }
            digest.centroids.push(Centroid { mean, weight });
            digest.count += weight;
        }

        if digest.count > 0.0 {
            digest
                .centroids
                .sort_unstable_by(|a, b| a.mean.total_cmp(&b.mean));
            digest.min = min;
            digest.max = max;
            digest.sum = sum;
        }

        Ok(digest)
    }

    fn buffer_limit(&self) -> usize {
        (5.0 * self.compression) as usize
    }

    fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let mut all = std::mem::take(&mut self.centroids);
        all.append(&mut self.buffer);
        all.sort_unstable_by(|a, b| a.mean.total_cmp(&b.mean));

        let total = self.count;
        let mut result = Vec::with_capacity(all.len().min(2 * self.compression as usize));
        let mut iter = all.into_iter();
        let mut current = match iter.next() {
            Some(first) => first,
            None => return,
        };
        let mut cumulative = 0.0;

        for next in iter {
            let proposed = current.weight + next.weight;
            let q = (cumulative + proposed / 2.0) / total;
            let limit = 4.0 * total * q * (1.0 - q) / self.compression;

            if proposed <= limit {
                current.mean = (current.mean * current.weight + next.mean * next.weight) / proposed;
                current.weight = proposed;
            } else {
                cumulative += current.weight;
                result.push(current);
                current = next;
            }
        }

        result.push(current);
        self.centroids = result;
    }
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION)
    }
}
