//! Stream dispatcher: drives a callback over the sub-streams of an
//! allocator according to a list of [`StreamSpec`]s.

use crate::allocator::PackedAllocator;
use crate::stream::{StreamMut, StreamRef, StreamSpec};
use memoria_core::Result;

/// Maps stream numbers `0..specs.len()` onto allocator slots starting at
/// `first_slot`.
#[derive(Clone, Copy, Debug)]
pub struct Dispatcher<'s> {
    specs: &'s [StreamSpec],
    first_slot: usize,
}

impl<'s> Dispatcher<'s> {
    pub fn new(specs: &'s [StreamSpec], first_slot: usize) -> Self {
        Self { specs, first_slot }
    }

    /// Number of dispatched streams.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &'s [StreamSpec] {
        self.specs
    }

    /// Allocator slot of stream `i`.
    pub fn slot(&self, i: usize) -> usize {
        self.first_slot + i
    }

    /// Read view of stream `i`, `None` if it is not allocated.
    pub fn dispatch<'a, B: AsRef<[u8]>>(
        &self,
        alloc: &'a PackedAllocator<B>,
        i: usize,
    ) -> Option<StreamRef<'a>> {
        let slot = self.slot(i);
        if alloc.is_empty(slot) {
            None
        } else {
            Some(StreamRef::open(self.specs[i], alloc.element(slot)))
        }
    }

    /// Mutable view of stream `i`, `None` if it is not allocated.
    pub fn dispatch_mut<'a, B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &'a mut PackedAllocator<B>,
        i: usize,
    ) -> Option<StreamMut<'a, B>> {
        let slot = self.slot(i);
        if alloc.is_empty(slot) {
            None
        } else {
            Some(StreamMut::open(self.specs[i], alloc, slot))
        }
    }

    /// Visits every stream, absent ones as `None`.
    pub fn dispatch_all<B, F>(&self, alloc: &PackedAllocator<B>, mut f: F)
    where
        B: AsRef<[u8]>,
        F: FnMut(usize, Option<StreamRef<'_>>),
    {
        for i in 0..self.len() {
            f(i, self.dispatch(alloc, i));
        }
    }

    /// Visits the allocated streams.
    pub fn dispatch_not_empty<B, F>(&self, alloc: &PackedAllocator<B>, mut f: F)
    where
        B: AsRef<[u8]>,
        F: FnMut(usize, StreamRef<'_>),
    {
        for i in 0..self.len() {
            if let Some(stream) = self.dispatch(alloc, i) {
                f(i, stream);
            }
        }
    }

    /// Visits the allocated streams mutably, stopping at the first error.
    pub fn dispatch_not_empty_mut<B, F>(&self, alloc: &mut PackedAllocator<B>, mut f: F) -> Result<()>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
        F: FnMut(usize, StreamMut<'_, B>) -> Result<()>,
    {
        for i in 0..self.len() {
            if let Some(stream) = self.dispatch_mut(alloc, i) {
                f(i, stream)?;
            }
        }
        Ok(())
    }

    /// Visits the allocated streams whose bit is set in `mask`.
    pub fn dispatch_mask<B, F>(&self, alloc: &PackedAllocator<B>, mask: u64, mut f: F)
    where
        B: AsRef<[u8]>,
        F: FnMut(usize, StreamRef<'_>),
    {
        for i in 0..self.len().min(64) {
            if mask & (1 << i) == 0 {
                continue;
            }
            if let Some(stream) = self.dispatch(alloc, i) {
                f(i, stream);
            }
        }
    }

    /// Folds over the allocated streams.
    pub fn fold<B, T, F>(&self, alloc: &PackedAllocator<B>, init: T, mut f: F) -> T
    where
        B: AsRef<[u8]>,
        F: FnMut(T, usize, StreamRef<'_>) -> T,
    {
        let mut acc = init;
        for i in 0..self.len() {
            if let Some(stream) = self.dispatch(alloc, i) {
                acc = f(acc, i, stream);
            }
        }
        acc
    }

    /// Allocates the empty streams selected by `mask`.
    pub fn allocate_empty<B>(&self, alloc: &mut PackedAllocator<B>, mask: u64) -> Result<()>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        for (i, spec) in self.specs.iter().enumerate() {
            if i < 64 && mask & (1 << i) != 0 {
                StreamMut::init(*spec, alloc, self.slot(i))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{SubStream, SubStreamMut};
    use alloc::vec;
    use alloc::vec::Vec;

    const SPECS: [StreamSpec; 3] = [
        StreamSpec::VdTree { blocks: 1 },
        StreamSpec::FSeq { blocks: 2 },
        StreamSpec::VdTree { blocks: 2 },
    ];

    fn populated() -> PackedAllocator<Vec<u8>> {
        let mut alloc = PackedAllocator::new(2048, 4).unwrap();
        let dispatcher = Dispatcher::new(&SPECS, 1);
        dispatcher.allocate_empty(&mut alloc, 0b011).unwrap();
        alloc
    }

    #[test]
    fn test_dispatch_all_sees_absent_streams() {
        let alloc = populated();
        let dispatcher = Dispatcher::new(&SPECS, 1);
        let mut present = Vec::new();
        dispatcher.dispatch_all(&alloc, |i, s| present.push((i, s.is_some())));
        assert_eq!(present, vec![(0, true), (1, true), (2, false)]);
    }

    #[test]
    fn test_dispatch_not_empty_mut_inserts_everywhere() {
        let mut alloc = populated();
        let dispatcher = Dispatcher::new(&SPECS, 1);
        dispatcher
            .dispatch_not_empty_mut(&mut alloc, |i, mut s| {
                let row: Vec<u64> = (0..SPECS[i].blocks()).map(|b| (b + 1) as u64).collect();
                s.insert(0, &row)
            })
            .unwrap();

        let total = dispatcher.fold(&alloc, 0u64, |acc, _, s| acc + s.sums().iter().sum::<u64>());
        assert_eq!(total, 1 + 1 + 2);
    }

    #[test]
    fn test_dispatch_mask_selects_streams() {
        let alloc = populated();
        let dispatcher = Dispatcher::new(&SPECS, 1);
        let mut seen = Vec::new();
        dispatcher.dispatch_mask(&alloc, 0b010, |i, s| seen.push((i, s.spec())));
        assert_eq!(seen, vec![(1, StreamSpec::FSeq { blocks: 2 })]);
    }

    #[test]
    fn test_dispatch_not_empty_mut_stops_at_error() {
        let mut alloc = populated();
        let dispatcher = Dispatcher::new(&SPECS, 1);
        let mut visited = 0;
        let result = dispatcher.dispatch_not_empty_mut(&mut alloc, |_, mut s| {
            visited += 1;
            s.insert(0, &[1, 2, 3, 4])
        });
        assert!(result.is_err());
        assert_eq!(visited, 1);
    }
}
