//! Random workloads for measuring the space efficiency of a [`TernaryBuddy`].
//!
//! A workload is a sequence of [`AllocatorOp`]s. The [`Evaluator`] applies
//! them to an allocator, optionally checking its invariants after every step,
//! and samples the allocator's usage after each accepted allocation.

use core::{fmt, mem, num::NonZeroUsize};

use arbitrary::{Arbitrary, Unstructured};
use rand::{rngs::StdRng, Rng, SeedableRng};
use ternary_buddy::{Allocation, AllocError, FreeError, InvariantViolation, Policy, TernaryBuddy};

/// Capacity of the arena used by [`Workload::default`].
pub const DEFAULT_TOTAL: usize = 4096;

/// Largest request exponent drawn by [`Workload::default`].
pub const DEFAULT_MAX_LOG: u32 = 10;

/// Period of frees in [`Workload::default`].
pub const DEFAULT_FREE_EVERY: NonZeroUsize = match NonZeroUsize::new(3) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocatorOp {
    /// Request this many units.
    Alloc(usize),
    /// Free an outstanding allocation. Given `n` outstanding allocations, the
    /// allocation at index `idx % n` is freed.
    Dealloc(usize),
}

#[derive(Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

impl Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            // Sizes range over `1..=2 * DEFAULT_TOTAL` so that oversized
            // requests are also exercised.
            AllocatorOpTag::Alloc => {
                AllocatorOp::Alloc(u.int_in_range(1..=2 * DEFAULT_TOTAL)?)
            }
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

/// How a workload picks the allocation to free.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FreeOrder {
    /// Uniformly at random among outstanding allocations.
    Random,
    /// Always the given index, modulo the number of outstanding allocations.
    Fixed(usize),
}

/// Parameters of a randomly generated workload.
#[derive(Clone, Debug)]
pub struct Workload {
    /// Capacity of the arena.
    pub total: usize,
    /// Number of steps.
    pub rounds: usize,
    /// Every `free_every`-th step (starting with the first) frees an
    /// allocation; the others request one.
    pub free_every: NonZeroUsize,
    /// Requests are drawn by picking `l` uniformly from `1..=max_log`, then a
    /// size uniformly from `2^l..=2^(l+1)`.
    ///
    /// Must be nonzero and less than `usize::BITS - 1`.
    pub max_log: u32,
    pub free_order: FreeOrder,
}

impl Default for Workload {
    fn default() -> Self {
        Workload {
            total: DEFAULT_TOTAL,
            rounds: 10_000,
            free_every: DEFAULT_FREE_EVERY,
            max_log: DEFAULT_MAX_LOG,
            free_order: FreeOrder::Random,
        }
    }
}

impl Workload {
    /// Checks that the workload can be generated and run.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError::InvalidTotal`] if `total` is not a nonzero
    /// power of two, and [`WorkloadError::InvalidMaxLog`] if request sizes
    /// up to `2^(max_log + 1)` cannot be drawn.
    pub fn validate(&self) -> Result<(), WorkloadError> {
        if !self.total.is_power_of_two() {
            return Err(WorkloadError::InvalidTotal(self.total));
        }

        if self.max_log == 0 || self.max_log >= usize::BITS - 1 {
            return Err(WorkloadError::InvalidMaxLog(self.max_log));
        }

        Ok(())
    }

    /// Draws one request size.
    ///
    /// # Panics
    ///
    /// Panics if `max_log` is out of range; see [`Workload::validate`].
    pub fn sample_request<R: Rng>(&self, rng: &mut R) -> usize {
        let log = rng.gen_range(1..=self.max_log);
        rng.gen_range(1 << log..=1 << (log + 1))
    }

    /// Generates the operations of this workload.
    ///
    /// # Panics
    ///
    /// Panics if `max_log` is out of range; see [`Workload::validate`].
    pub fn ops<R: Rng>(&self, rng: &mut R) -> Vec<AllocatorOp> {
        (0..self.rounds)
            .map(|round| {
                if round % self.free_every.get() != 0 {
                    AllocatorOp::Alloc(self.sample_request(rng))
                } else {
                    match self.free_order {
                        FreeOrder::Random => AllocatorOp::Dealloc(rng.gen()),
                        FreeOrder::Fixed(idx) => AllocatorOp::Dealloc(idx),
                    }
                }
            })
            .collect()
    }

    /// Runs this workload against a fresh allocator with the given policy.
    ///
    /// The run is deterministic for a given `seed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the workload is invalid or the evaluation fails.
    pub fn run(&self, policy: Policy, seed: u64) -> Result<Report, WorkloadError> {
        self.validate()?;

        let buddy = TernaryBuddy::with_policy(self.total, policy)
            .map_err(|_| WorkloadError::InvalidTotal(self.total))?;

        let mut rng = StdRng::seed_from_u64(seed);
        let ops = self.ops(&mut rng);

        Ok(Evaluator::new(buddy).evaluate(ops)?)
    }
}

/// Results of binary-only and binary-plus-ternary runs of the same workload.
#[derive(Clone, Debug, PartialEq)]
pub struct Comparison {
    pub binary: Report,
    pub ternary: Report,
}

/// Runs `workload` under both policies with the same seed.
pub fn compare(workload: &Workload, seed: u64) -> Result<Comparison, WorkloadError> {
    Ok(Comparison {
        binary: workload.run(Policy::BINARY, seed)?,
        ternary: workload.run(Policy::TERNARY, seed)?,
    })
}

/// Statistics gathered over one evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Report {
    /// Number of allocation requests made.
    pub total_requests: usize,
    /// Number of allocation requests that succeeded.
    pub accepted_requests: usize,
    /// The highest usage observed after an accepted allocation.
    pub highest_usage: f64,
    usage_sum: f64,
}

impl Report {
    /// Returns the fraction of requests that were accepted.
    pub fn acceptance_ratio(&self) -> Option<f64> {
        (self.total_requests != 0)
            .then(|| self.accepted_requests as f64 / self.total_requests as f64)
    }

    /// Returns the mean usage, sampled after each accepted allocation.
    pub fn mean_usage(&self) -> Option<f64> {
        (self.accepted_requests != 0).then(|| self.usage_sum / self.accepted_requests as f64)
    }

    fn sample(&mut self, usage: f64) {
        self.accepted_requests += 1;
        self.usage_sum += usage;
        if usage > self.highest_usage {
            self.highest_usage = usage;
        }
    }
}

/// Why an evaluation stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// The allocator rejected the free of an allocation it handed out.
    Free(FreeError),
    /// An allocation was smaller than requested.
    Undersized { requested: usize, size: usize },
    /// The allocator's invariants were broken.
    Invariant(InvariantViolation),
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: AllocatorOp,
    pub reason: FailReason,
}

/// An error returned by [`Workload::run`].
#[derive(Clone, Debug)]
pub enum WorkloadError {
    /// The capacity is not a nonzero power of two.
    InvalidTotal(usize),
    /// Request sizes up to `2^(max_log + 1)` cannot be drawn.
    InvalidMaxLog(u32),
    /// The evaluation stopped early.
    Failed(Failed),
}

impl From<Failed> for WorkloadError {
    fn from(failed: Failed) -> Self {
        WorkloadError::Failed(failed)
    }
}

impl fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadError::InvalidTotal(total) => {
                write!(f, "capacity {total} is not a nonzero power of two")
            }
            WorkloadError::InvalidMaxLog(max_log) => {
                write!(f, "request exponent bound {max_log} is out of range")
            }
            WorkloadError::Failed(failed) => write!(
                f,
                "evaluation failed at {:?} after {} ops: {:?}",
                failed.failed_op,
                failed.completed.len(),
                failed.reason
            ),
        }
    }
}

impl std::error::Error for WorkloadError {}

#[derive(Debug)]
pub struct Evaluator {
    buddy: TernaryBuddy,
    verify: bool,
}

impl Evaluator {
    pub fn new(buddy: TernaryBuddy) -> Evaluator {
        Evaluator {
            buddy,
            verify: false,
        }
    }

    /// Checks the allocator's invariants after every operation.
    pub fn verify(mut self, verify: bool) -> Evaluator {
        self.verify = verify;
        self
    }

    pub fn buddy(&self) -> &TernaryBuddy {
        &self.buddy
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<Report, Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut outstanding: Vec<Allocation> = Vec::new();
        let mut report = Report::default();

        for op in ops {
            self.apply(op, &mut completed, &mut outstanding, &mut report)?;
        }

        self.drain(&mut completed, &mut outstanding, &mut report)?;

        log::debug!(
            "evaluated {} ops: accepted {}/{}, mean usage {:?}",
            completed.len(),
            report.accepted_requests,
            report.total_requests,
            report.mean_usage()
        );

        Ok(report)
    }

    /// Frees every outstanding allocation as a trailing run of `Dealloc(0)`
    /// ops, so that a failure here is reported like any other.
    fn drain(
        &mut self,
        completed: &mut Vec<AllocatorOp>,
        outstanding: &mut Vec<Allocation>,
        report: &mut Report,
    ) -> Result<(), Failed> {
        while !outstanding.is_empty() {
            self.apply(AllocatorOp::Dealloc(0), completed, outstanding, report)?;
        }

        Ok(())
    }

    fn apply(
        &mut self,
        op: AllocatorOp,
        completed: &mut Vec<AllocatorOp>,
        outstanding: &mut Vec<Allocation>,
        report: &mut Report,
    ) -> Result<(), Failed> {
        if let Err(reason) = self.step(&op, outstanding, report) {
            log::warn!("evaluation failed at {op:?}: {reason:?}");
            return Err(Failed {
                completed: mem::take(completed),
                failed_op: op,
                reason,
            });
        }

        completed.push(op);
        Ok(())
    }

    fn step(
        &mut self,
        op: &AllocatorOp,
        outstanding: &mut Vec<Allocation>,
        report: &mut Report,
    ) -> Result<(), FailReason> {
        match *op {
            AllocatorOp::Alloc(requested) => {
                report.total_requests += 1;

                match self.buddy.alloc(requested) {
                    Ok(allocation) => {
                        if allocation.size() < requested {
                            return Err(FailReason::Undersized {
                                requested,
                                size: allocation.size(),
                            });
                        }

                        outstanding.push(allocation);

                        if let Some(usage) = self.buddy.usage() {
                            report.sample(usage);
                        }
                    }

                    Err(AllocError::Exhausted | AllocError::ZeroSize) => (),
                }
            }

            AllocatorOp::Dealloc(idx) => {
                let len = outstanding.len();
                if len != 0 {
                    let allocation = outstanding.swap_remove(idx % len);
                    self.buddy
                        .free_allocation(allocation)
                        .map_err(FailReason::Free)?;
                }
            }
        }

        if self.verify {
            self.buddy
                .check_invariants()
                .map_err(FailReason::Invariant)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Workload {
        Workload {
            rounds: 2_000,
            ..Workload::default()
        }
    }

    #[test]
    fn requests_fall_in_band() {
        let workload = Workload::default();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..1_000 {
            let size = workload.sample_request(&mut rng);
            assert!((2..=2048).contains(&size));
        }
    }

    #[test]
    fn every_third_op_frees() {
        let workload = Workload {
            rounds: 9,
            free_order: FreeOrder::Fixed(1),
            ..Workload::default()
        };
        let ops = workload.ops(&mut StdRng::seed_from_u64(0));

        for (round, op) in ops.iter().enumerate() {
            if round % 3 == 0 {
                assert_eq!(*op, AllocatorOp::Dealloc(1));
            } else {
                assert!(matches!(op, AllocatorOp::Alloc(_)));
            }
        }
    }

    #[test]
    fn runs_are_deterministic() {
        let a = small().run(Policy::TERNARY, 42).unwrap();
        let b = small().run(Policy::TERNARY, 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reports_are_in_bounds() {
        let cmp = compare(&small(), 1).unwrap();

        let num_allocs = (0..2_000).filter(|round| round % 3 != 0).count();

        for report in [&cmp.binary, &cmp.ternary] {
            assert_eq!(report.total_requests, num_allocs);
            assert!(report.accepted_requests <= report.total_requests);

            let ratio = report.acceptance_ratio().unwrap();
            assert!(ratio > 0.0 && ratio <= 1.0);

            let mean = report.mean_usage().unwrap();
            assert!(mean > 0.0 && mean <= 1.0);
            assert!(report.highest_usage >= mean && report.highest_usage <= 1.0);
        }

        // Binary-only usage is bounded below by one half.
        assert!(cmp.binary.mean_usage().unwrap() > 0.5);
    }

    #[test]
    fn verified_run_leaves_allocator_empty() {
        let workload = Workload {
            total: 1024,
            rounds: 500,
            max_log: 8,
            free_order: FreeOrder::Fixed(1),
            ..Workload::default()
        };

        let buddy = TernaryBuddy::new(workload.total).unwrap();
        let mut evaluator = Evaluator::new(buddy).verify(true);
        let ops = workload.ops(&mut StdRng::seed_from_u64(3));

        evaluator.evaluate(ops).unwrap();
        assert_eq!(evaluator.buddy().outstanding(), 0);
        assert_eq!(evaluator.buddy().blocks().count(), 1);
    }

    #[test]
    fn invalid_workloads_are_rejected() {
        let bad_total = Workload {
            total: 1000,
            ..small()
        };
        assert!(matches!(
            bad_total.run(Policy::TERNARY, 0),
            Err(WorkloadError::InvalidTotal(1000))
        ));

        for max_log in [0, usize::BITS - 1, u32::MAX] {
            let workload = Workload {
                max_log,
                ..small()
            };
            assert!(matches!(
                compare(&workload, 0),
                Err(WorkloadError::InvalidMaxLog(m)) if m == max_log
            ));
        }
    }

    #[test]
    fn free_every_step_never_allocates() {
        let workload = Workload {
            rounds: 10,
            free_every: NonZeroUsize::new(1).unwrap(),
            ..Workload::default()
        };
        let report = workload.run(Policy::BINARY, 5).unwrap();

        assert_eq!(report.total_requests, 0);
        assert_eq!(report.mean_usage(), None);
    }

    #[test]
    fn failed_drain_is_reported() {
        let mut other = TernaryBuddy::new(64).unwrap();
        let foreign = other.alloc(5).unwrap();

        let mut evaluator = Evaluator::new(TernaryBuddy::new(64).unwrap()).verify(true);
        let mut completed = vec![AllocatorOp::Alloc(7)];
        let mut outstanding = vec![foreign];

        let failed = evaluator
            .drain(&mut completed, &mut outstanding, &mut Report::default())
            .unwrap_err();

        assert_eq!(failed.completed, [AllocatorOp::Alloc(7)]);
        assert_eq!(failed.failed_op, AllocatorOp::Dealloc(0));
        assert!(matches!(
            failed.reason,
            FailReason::Free(FreeError::StaleBlock(_))
        ));
    }

    #[test]
    fn arbitrary_ops_evaluate_cleanly() {
        let bytes: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let mut u = Unstructured::new(&bytes);
        let ops = Vec::<AllocatorOp>::arbitrary(&mut u).unwrap();

        let buddy = TernaryBuddy::new(DEFAULT_TOTAL).unwrap();
        Evaluator::new(buddy).verify(true).evaluate(ops).unwrap();
    }
}
