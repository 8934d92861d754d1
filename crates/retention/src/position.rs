use byteorder::{
    BigEndian,
    ReadBytesExt,
    WriteBytesExt,
};
use common::{
    Clock,
    Error,
    Result,
};

use crate::event::BatchId;

const TAG_INDEXED: u8 = 0;
const TAG_STREAMING: u8 = 1;

/// An opaque replay cursor for one source.
///
/// A position starts out indexed, pointing inside a sealed batch of the
/// retention, and transitions exactly once to streaming when replay
/// catches up with the log tail. Both shapes carry the merge of all clocks
/// delivered so far; the streaming shape means "every event with a clock
/// strictly greater than this on the source coordinate has not yet been
/// delivered".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Position {
    Indexed {
        source: usize,
        batch_id: BatchId,
        offset: u32,
        clock: Clock,
    },
    Streaming { source: usize, clock: Clock },
}

impl Position {
    pub fn is_indexed(&self) -> bool {
        matches!(self, Position::Indexed { .. })
    }

    pub fn source(&self) -> usize {
        match self {
            Position::Indexed { source, .. } => *source,
            Position::Streaming { source, .. } => *source,
        }
    }

    pub fn clock(&self) -> &Clock {
        match self {
            Position::Indexed { clock, .. } => clock,
            Position::Streaming { clock, .. } => clock,
        }
    }

    /// Tag-first serialization so the shape survives round-trips through
    /// consumer checkpoints.
    pub fn serialize(&self, num_sources: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Position::Indexed {
                source,
                batch_id,
                offset,
                clock,
            } => {
                buf.write_u8(TAG_INDEXED)?;
                buf.write_u16::<BigEndian>(*source as u16)?;
                buf.write_u64::<BigEndian>(*batch_id)?;
                buf.write_u32::<BigEndian>(*offset)?;
                buf.extend_from_slice(&clock.encode(num_sources)?);
            },
            Position::Streaming { source, clock } => {
                buf.write_u8(TAG_STREAMING)?;
                buf.write_u16::<BigEndian>(*source as u16)?;
                buf.extend_from_slice(&clock.encode(num_sources)?);
            },
        }
        Ok(buf)
    }

    pub fn deserialize(bytes: &[u8], num_sources: usize) -> Result<Position> {
        let mut reader = bytes;
        let position = Self::read_from(&mut reader, num_sources)?;
        if !reader.is_empty() {
            return Err(Error::SerializationFailure(format!(
                "{} trailing bytes after position",
                reader.len()
            )));
        }
        Ok(position)
    }

    fn read_from(reader: &mut &[u8], num_sources: usize) -> Result<Position> {
        let tag = reader.read_u8()?;
        let source = reader.read_u16::<BigEndian>()? as usize;
        match tag {
            TAG_INDEXED => {
                let batch_id = reader.read_u64::<BigEndian>()?;
                let offset = reader.read_u32::<BigEndian>()?;
                let clock = Clock::read_from(reader, num_sources)?;
                Ok(Position::Indexed {
                    source,
                    batch_id,
                    offset,
                    clock,
                })
            },
            TAG_STREAMING => {
                let clock = Clock::read_from(reader, num_sources)?;
                Ok(Position::Streaming { source, clock })
            },
            other => Err(Error::SerializationFailure(format!(
                "unknown position tag {other}"
            ))),
        }
    }
}

/// One cursor over several single-source readers: a vector of
/// sub-positions, one per constituent reader, in reader order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositePosition {
    positions: Vec<Position>,
}

impl CompositePosition {
    pub fn new(positions: Vec<Position>) -> Self {
        Self { positions }
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub(crate) fn set(&mut self, index: usize, position: Position) {
        self.positions[index] = position;
    }

    /// True while any constituent reader is still replaying indexed data;
    /// turns false exactly when every child has transitioned to streaming.
    /// This is the "caught up" signal for consumers.
    pub fn is_indexed(&self) -> bool {
        self.positions.iter().any(Position::is_indexed)
    }

    /// Coordinate-wise maximum of the sub-positions' clocks.
    pub fn global_clock(&self) -> Clock {
        self.positions
            .iter()
            .fold(Clock::zero(), |clock, position| {
                clock.merge_max(position.clock())
            })
    }

    pub fn serialize(&self, num_sources: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u16::<BigEndian>(self.positions.len() as u16)?;
        for position in &self.positions {
            buf.extend_from_slice(&position.serialize(num_sources)?);
        }
        Ok(buf)
    }

    pub fn deserialize(bytes: &[u8], num_sources: usize) -> Result<CompositePosition> {
        let mut reader = bytes;
        let count = reader.read_u16::<BigEndian>()? as usize;
        let mut positions = Vec::with_capacity(count);
        for _ in 0..count {
            positions.push(Position::read_from(&mut reader, num_sources)?);
        }
        if !reader.is_empty() {
            return Err(Error::SerializationFailure(format!(
                "{} trailing bytes after composite position",
                reader.len()
            )));
        }
        Ok(CompositePosition { positions })
    }
}
