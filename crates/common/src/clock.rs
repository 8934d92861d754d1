use std::{
    cmp::Ordering,
    fmt,
    io::Read,
};

use byteorder::{
    BigEndian,
    ReadBytesExt,
    WriteBytesExt,
};

use crate::errors::{
    Error,
    Result,
};

/// A vector of nonnegative sequence numbers, one coordinate per source in
/// the process-wide [`SourceSet`](crate::source::SourceSet) order.
///
/// Clocks are kept in canonical form: trailing zero coordinates are
/// stripped, so the distinguished zero clock is the empty vector. A missing
/// coordinate reads as zero, which makes the zero clock the universal floor
/// regardless of how many sources are configured.
///
/// Comparison is dominance order: `a <= b` iff every coordinate of `a` is
/// `<=` the corresponding coordinate of `b`. Two clocks where neither
/// dominates are incomparable and `partial_cmp` returns `None`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Clock {
    coordinates: Box<[u64]>,
}

impl Clock {
    /// The universal floor: every coordinate is zero.
    pub fn zero() -> Self {
        Self {
            coordinates: Box::new([]),
        }
    }

    pub fn from_coordinates(mut coordinates: Vec<u64>) -> Self {
        while coordinates.last() == Some(&0) {
            coordinates.pop();
        }
        Self {
            coordinates: coordinates.into_boxed_slice(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.coordinates.is_empty()
    }

    /// The sequence number at `coordinate`; zero for coordinates past the
    /// canonical length.
    pub fn get(&self, coordinate: usize) -> u64 {
        self.coordinates.get(coordinate).copied().unwrap_or(0)
    }

    /// A copy of this clock with one coordinate replaced.
    pub fn with_coordinate(&self, coordinate: usize, scn: u64) -> Clock {
        let len = self.coordinates.len().max(coordinate + 1);
        let mut coordinates: Vec<u64> = (0..len).map(|i| self.get(i)).collect();
        coordinates[coordinate] = scn;
        Clock::from_coordinates(coordinates)
    }

    /// Coordinate-wise maximum of the two clocks.
    pub fn merge_max(&self, other: &Clock) -> Clock {
        let len = self.coordinates.len().max(other.coordinates.len());
        Clock::from_coordinates((0..len).map(|i| self.get(i).max(other.get(i))).collect())
    }

    /// Fixed-width encoding: 8 bytes big-endian per source, padded with
    /// zero coordinates out to `num_sources`.
    pub fn encode(&self, num_sources: usize) -> Result<Vec<u8>> {
        if self.coordinates.len() > num_sources {
            return Err(Error::SerializationFailure(format!(
                "clock {self} has more than {num_sources} coordinates"
            )));
        }
        let mut buf = Vec::with_capacity(8 * num_sources);
        for coordinate in 0..num_sources {
            buf.write_u64::<BigEndian>(self.get(coordinate))?;
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], num_sources: usize) -> Result<Clock> {
        if bytes.len() != 8 * num_sources {
            return Err(Error::SerializationFailure(format!(
                "clock encoding is {} bytes, expected {}",
                bytes.len(),
                8 * num_sources
            )));
        }
        let mut reader = bytes;
        let mut coordinates = Vec::with_capacity(num_sources);
        for _ in 0..num_sources {
            coordinates.push(reader.read_u64::<BigEndian>()?);
        }
        Ok(Clock::from_coordinates(coordinates))
    }

    /// Reads a fixed-width clock from `reader`.
    pub fn read_from(reader: &mut impl Read, num_sources: usize) -> Result<Clock> {
        let mut buf = vec![0u8; 8 * num_sources];
        reader.read_exact(&mut buf)?;
        Clock::decode(&buf, num_sources)
    }
}

impl PartialOrd for Clock {
    fn partial_cmp(&self, other: &Clock) -> Option<Ordering> {
        let len = self.coordinates.len().max(other.coordinates.len());
        let mut less = false;
        let mut greater = false;
        for coordinate in 0..len {
            match self.get(coordinate).cmp(&other.get(coordinate)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {},
            }
        }
        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, scn) in self.coordinates.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{scn}")?;
        }
        write!(f, "]")
    }
}

#[cfg(any(test, feature = "testing"))]
impl proptest::arbitrary::Arbitrary for Clock {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Clock>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        use proptest::prelude::*;
        prop::collection::vec(0u64..=1_000_000, 0..4)
            .prop_map(Clock::from_coordinates)
            .boxed()
    }
}
