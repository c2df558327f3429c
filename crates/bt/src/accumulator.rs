//! Per-stream, per-block value tuples.
//!
//! An `Accumulator` carries one `u64` per block of every sub-stream of a
//! node. It is used both for the keys of a single entry and for sums over a
//! range of entries.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use memoria_packed::StreamSpec;

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Accumulator {
    streams: Vec<Vec<u64>>,
}

impl Accumulator {
    /// All-zero accumulator shaped after `specs`.
    pub fn zeroed(specs: &[StreamSpec]) -> Self {
        Self {
            streams: specs.iter().map(|s| vec![0; s.blocks()]).collect(),
        }
    }

    pub fn from_streams(streams: Vec<Vec<u64>>) -> Self {
        Self { streams }
    }

    pub fn streams(&self) -> &[Vec<u64>] {
        &self.streams
    }

    pub fn stream(&self, i: usize) -> &[u64] {
        &self.streams[i]
    }

    pub fn stream_mut(&mut self, i: usize) -> &mut Vec<u64> {
        &mut self.streams[i]
    }

    pub fn get(&self, stream: usize, block: usize) -> u64 {
        self.streams[stream][block]
    }

    pub fn set(&mut self, stream: usize, block: usize, value: u64) {
        self.streams[stream][block] = value;
    }

    /// Returns true if the shape matches `specs`.
    pub fn fits(&self, specs: &[StreamSpec]) -> bool {
        self.streams.len() == specs.len()
            && self
                .streams
                .iter()
                .zip(specs)
                .all(|(values, spec)| values.len() == spec.blocks())
    }

    pub fn is_zero(&self) -> bool {
        self.streams.iter().flatten().all(|&v| v == 0)
    }

    pub fn add_assign(&mut self, other: &Accumulator) {
        for (mine, theirs) in self.streams.iter_mut().zip(&other.streams) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a += *b;
            }
        }
    }

    pub fn sub_assign(&mut self, other: &Accumulator) {
        for (mine, theirs) in self.streams.iter_mut().zip(&other.streams) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a -= *b;
            }
        }
    }

    /// Signed per-value difference `other - self`.
    pub fn delta_to(&self, other: &Accumulator) -> Vec<Vec<i64>> {
        self.streams
            .iter()
            .zip(&other.streams)
            .map(|(mine, theirs)| {
                mine.iter()
                    .zip(theirs)
                    .map(|(&a, &b)| b as i64 - a as i64)
                    .collect()
            })
            .collect()
    }
}

impl fmt::Display for Accumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, stream) in self.streams.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", stream)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_arithmetic() {
        let specs = [StreamSpec::VdTree { blocks: 2 }, StreamSpec::FSeq { blocks: 1 }];
        let mut acc = Accumulator::zeroed(&specs);
        assert!(acc.is_zero());
        assert!(acc.fits(&specs));

        let other = Accumulator::from_streams(vec![vec![1, 2], vec![3]]);
        acc.add_assign(&other);
        acc.add_assign(&other);
        assert_eq!(acc.get(0, 1), 4);
        acc.sub_assign(&other);
        assert_eq!(acc, other);
        assert_eq!(acc.to_string(), "[[1, 2], [3]]");
    }

    #[test]
    fn test_delta_to() {
        let a = Accumulator::from_streams(vec![vec![5, 1]]);
        let b = Accumulator::from_streams(vec![vec![2, 4]]);
        assert_eq!(a.delta_to(&b), vec![vec![-3, 3]]);
    }
}
