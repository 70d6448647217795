use std::hash::Hasher;

use fnv::FnvHasher;

use super::SketchError;

/// Default register precision.
///
/// `2^14` one-byte registers, 16 KiB per sketch, with a relative standard
/// error around 0.8%.
pub const DEFAULT_PRECISION: u8 = 14;

const MIN_PRECISION: u8 = 4;
const MAX_PRECISION: u8 = 16;

/// A HyperLogLog cardinality sketch over hashed members.
///
/// Memory is fixed by the precision, independent of the observed
/// cardinality. Merging two sketches of equal precision is the register-wise
/// maximum and is exact with respect to the union of their member streams.
///
/// Small cardinalities are estimated with linear counting over the zero
/// registers, which keeps estimates of a handful of members exact.
#[derive(Clone, Debug)]
pub struct HyperLogLog {
    precision: u8,
    registers: Box<[u8]>,
}

impl HyperLogLog {
    /// Creates a sketch with [`DEFAULT_PRECISION`].
    pub fn new() -> Self {
        Self::with_precision(DEFAULT_PRECISION)
    }

    /// Creates a sketch with `2^precision` registers.
    ///
    /// The precision is clamped to `[4, 16]`.
    pub fn with_precision(precision: u8) -> Self {
        let precision = precision.clamp(MIN_PRECISION, MAX_PRECISION);
        Self {
            precision,
            registers: vec![0u8; 1usize << precision].into_boxed_slice(),
        }
    }

    /// The configured precision.
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Inserts a member, hashing it with FNV-1a.
    pub fn insert(&mut self, member: &[u8]) {
        let mut hasher = FnvHasher::default();
        hasher.write(member);
        self.insert_hash(hasher.finish());
    }

    /// Inserts a pre-hashed member.
    pub fn insert_hash(&mut self, hash: u64) {
        // MurmurHash3 finalizer. FNV and the FNV-derived sample digests do
        // not disperse well in the high bits used for register selection.
        let mut hash = hash;
        hash ^= hash >> 33;
        hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
        hash ^= hash >> 33;
        hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        hash ^= hash >> 33;

        let p = u32::from(self.precision);
        let index = (hash >> (64 - p)) as usize;
        let rest = hash << p;
        let rank = if rest == 0 {
            (64 - p + 1) as u8
        } else {
            rest.leading_zeros() as u8 + 1
        };

        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Returns the estimated cardinality.
    pub fn estimate(&self) -> u64 {
        let m = self.registers.len() as f64;
        let mut inverse_sum = 0.0;
        let mut zeros = 0u64;

        for &register in self.registers.iter() {
            inverse_sum += 2f64.powi(-i32::from(register));
            if register == 0 {
                zeros += 1;
            }
        }

        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m),
        };

        let raw = alpha * m * m / inverse_sum;

        // Small-range correction via linear counting.
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };

        estimate.round() as u64
    }

    /// Returns `true` if no members have been inserted.
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&register| register == 0)
    }

    /// Resets the sketch to empty.
    pub fn clear(&mut self) {
        self.registers.fill(0);
    }

    /// Merges another sketch of equal precision into this one.
    pub fn merge(&mut self, other: &HyperLogLog) -> Result<(), SketchError> {
        if self.precision != other.precision {
            return Err(SketchError::ParameterMismatch);
        }

        for (register, &other_register) in self.registers.iter_mut().zip(other.registers.iter()) {
            if other_register > *register {
                *register = other_register;
            }
        }

        Ok(())
    }

    /// Returns the raw register bytes for serialization.
    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    /// Reassembles a sketch from serialized registers.
    pub fn from_registers(precision: u8, registers: &[u8]) -> Result<Self, SketchError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision)
            || registers.len() != (1usize << precision)
        {
            return Err(SketchError::InvalidState);
        }

        Ok(Self {
            precision,
            registers: registers.to_vec().into_boxed_slice(),
        })
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}
