/// Running totals for outstanding allocations.
///
/// `requested` is the sum of the sizes callers asked for; `allocated` is the
/// sum of the block sizes backing those requests. `requested <= allocated`
/// always holds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Accounting {
    requested: usize,
    allocated: usize,
}

impl Accounting {
    #[inline]
    pub fn requested(&self) -> usize {
        self.requested
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Records a successful allocation of `allocated` units for a request of
    /// `requested` units.
    pub fn charge(&mut self, requested: usize, allocated: usize) {
        debug_assert!(requested <= allocated);
        self.requested += requested;
        self.allocated += allocated;
    }

    /// Removes a freed allocation from the totals.
    pub fn release(&mut self, requested: usize, allocated: usize) {
        self.requested = self
            .requested
            .checked_sub(requested)
            .expect("released more than was requested");
        self.allocated = self
            .allocated
            .checked_sub(allocated)
            .expect("released more than was allocated");
    }

    /// Returns `requested / allocated`, or `None` if nothing is allocated.
    pub fn usage(&self) -> Option<f64> {
        (self.allocated != 0).then(|| self.requested as f64 / self.allocated as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_is_undefined_when_empty() {
        assert_eq!(Accounting::default().usage(), None);
    }

    #[test]
    fn usage_tracks_charges() {
        let mut acct = Accounting::default();
        acct.charge(3, 4);
        assert_eq!(acct.usage(), Some(0.75));

        acct.charge(5, 6);
        assert_eq!(acct.usage(), Some(0.8));

        acct.release(3, 4);
        assert_eq!(acct.requested(), 5);
        assert_eq!(acct.allocated(), 6);

        acct.release(5, 6);
        assert_eq!(acct.usage(), None);
    }
}
