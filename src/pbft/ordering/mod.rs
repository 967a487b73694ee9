//! Module to order the sequence number space shared by the
//! sub-protocols of the system.

use std::fmt;

use either::{Either, Left, Right};
use serde::{Deserialize, Serialize};

/// Represents a sequence number attributed to a consensus instance,
/// a view, or a checkpoint.
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SeqNo(u64);

/// Types that are associated with a sequence number.
pub trait Orderable {
    /// Returns the sequence number of this value.
    fn sequence_number(&self) -> SeqNo;
}

pub(crate) enum InvalidSeqNo {
    Small,
    Big,
}

impl From<u64> for SeqNo {
    #[inline]
    fn from(sequence_number: u64) -> SeqNo {
        SeqNo(sequence_number)
    }
}

impl From<SeqNo> for u64 {
    #[inline]
    fn from(sequence_number: SeqNo) -> u64 {
        sequence_number.0
    }
}

impl fmt::Debug for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNo({})", self.0)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNo {
    /// The first sequence number.
    pub const ZERO: SeqNo = SeqNo(0);

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    /// Returns the sequence number `offset` positions ahead of this one.
    #[inline]
    pub fn advanced(self, offset: u64) -> SeqNo {
        SeqNo(self.0 + offset)
    }

    /// Return an appropriate value to index a window of sequence
    /// numbers open at `low`.
    ///
    /// Sequence numbers at or before `low` yield `InvalidSeqNo::Small`,
    /// while numbers absurdly far ahead of it yield `InvalidSeqNo::Big`,
    /// which may be caused by a DoS attack of a malicious node.
    #[inline]
    pub(crate) fn index(self, low: SeqNo) -> Either<InvalidSeqNo, usize> {
        const DROP_SEQNO_THRES: u64 = 1 << 16;

        if self <= low {
            return Left(InvalidSeqNo::Small);
        }
        let index = self.0 - low.0;
        if index > DROP_SEQNO_THRES {
            Left(InvalidSeqNo::Big)
        } else {
            Right(index as usize)
        }
    }
}

impl Orderable for SeqNo {
    fn sequence_number(&self) -> SeqNo {
        *self
    }
}
