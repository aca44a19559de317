#![no_main]

use libfuzzer_sys::fuzz_target;
use ternary_buddy::{Policy, TernaryBuddy};
use ternary_buddy_workload::{AllocatorOp, Evaluator, DEFAULT_TOTAL};

fuzz_target!(|input: (bool, bool, Vec<AllocatorOp>)| {
    let (halve, ternary, ops) = input;

    let buddy = TernaryBuddy::with_policy(DEFAULT_TOTAL, Policy { halve, ternary }).unwrap();
    let mut evaluator = Evaluator::new(buddy).verify(true);

    if let Err(failed) = evaluator.evaluate(ops) {
        panic!("{:?} failed: {:?}", failed.failed_op, failed.reason);
    }
});
