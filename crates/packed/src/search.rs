//! Search primitives shared by the packed structures.

/// Threshold comparison used by prefix-sum searches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SearchType {
    /// Stop at the first element where the running sum becomes `>= target`.
    Ge,
    /// Stop at the first element where the running sum becomes `> target`.
    Gt,
}

impl SearchType {
    /// Returns true if `sum` meets `target` under this comparison.
    #[inline]
    pub fn matches(self, sum: u64, target: u64) -> bool {
        match self {
            SearchType::Ge => sum >= target,
            SearchType::Gt => sum > target,
        }
    }
}

/// Result of a prefix-sum search.
///
/// For a forward search `idx` is the first position meeting the threshold
/// and `prefix` the sum of the elements between the start position and
/// `idx` (exclusive). For a backward search `prefix` is the sum of the
/// elements after `idx` up to the start position. When nothing meets the
/// threshold `idx` equals the structure's size and `prefix` is the whole
/// walked range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalkResult {
    pub idx: usize,
    pub prefix: u64,
}

impl WalkResult {
    /// Creates a walk result.
    pub fn new(idx: usize, prefix: u64) -> Self {
        Self { idx, prefix }
    }

    /// Returns true if the search stopped inside a structure of `size`.
    pub fn is_found(&self, size: usize) -> bool {
        self.idx < size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_type_matches() {
        assert!(SearchType::Ge.matches(9, 9));
        assert!(!SearchType::Gt.matches(9, 9));
        assert!(SearchType::Gt.matches(10, 9));
    }

    #[test]
    fn test_walk_result_found() {
        assert!(WalkResult::new(2, 8).is_found(4));
        assert!(!WalkResult::new(4, 17).is_found(4));
    }
}
