//! Kademlia node Id, record key or lookup target
use rand::Rng;
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs and keys in bytes.
pub const ID_SIZE: usize = 48;
/// The size of node IDs and keys in bits, and the upper bound on the number of k-buckets.
pub const NUM_BUCKETS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id, record key or lookup target.
///
/// Keys and node ids share the same 384 bit identifier space.
pub struct Id(pub [u8; ID_SIZE]);

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Debug)]
/// XOR distance between two [Id]s, compared as a big-endian unsigned integer.
pub struct Distance([u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut bytes = [0_u8; ID_SIZE];
        rand::thread_rng().fill(&mut bytes[..]);

        Id(bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// XOR distance between this Id and another.
    ///
    /// Symmetric, and zero only for identical ids.
    pub fn distance(&self, other: &Id) -> Distance {
        let mut xor = [0_u8; ID_SIZE];

        for (i, byte) in xor.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(xor)
    }

    /// Number of leading bits this Id shares with `other`.
    ///
    /// Equals [NUM_BUCKETS] for identical ids.
    pub fn prefix_len(&self, other: &Id) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Compares `a` and `b` by their distance to this Id.
    ///
    /// [Ordering::Less] means `a` is closer.
    pub fn closer(&self, a: &Id, b: &Id) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Returns the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Random Id sharing exactly `prefix_len` leading bits with this Id.
    ///
    /// If `prefix_len` is [NUM_BUCKETS], returns a copy of this Id.
    pub fn random_with_prefix(&self, prefix_len: usize) -> Id {
        if prefix_len >= NUM_BUCKETS {
            return *self;
        }

        let mut random = Id::random();

        for i in 0..prefix_len {
            random.set_bit(i, self.bit(i));
        }
        random.set_bit(prefix_len, !self.bit(prefix_len));

        random
    }

    /// Random Id sharing at least `prefix_len` leading bits with this Id.
    pub fn random_within(&self, prefix_len: usize) -> Id {
        let mut random = Id::random();

        for i in 0..prefix_len.min(NUM_BUCKETS) {
            random.set_bit(i, self.bit(i));
        }

        random
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn set_bit(&mut self, index: usize, value: bool) {
        let mask = 0x80 >> (index % 8);

        if value {
            self.0[index / 8] |= mask;
        } else {
            self.0[index / 8] &= !mask;
        }
    }
}

impl Distance {
    /// Returns `true` if the two ids were identical.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        NUM_BUCKETS
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", &self.to_string()[..8])
    }
}

impl FromStr for Id {
    type Err = Error;

    /// Parse a hex encoded Id.
    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Id> {
        Id::from_bytes(bytes)
    }
}
