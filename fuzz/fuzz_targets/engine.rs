#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use ternary_buddy::{Allocation, TernaryBuddy};

const MAX_TOTAL_BITS: u8 = 16;

// Capacities are always powers of two; invalid ones are covered by unit tests.
#[derive(Clone, Debug)]
struct Total(usize);

impl Arbitrary<'_> for Total {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Total> {
        let bits = u8::arbitrary(un)? % (MAX_TOTAL_BITS + 1);
        Ok(Total(1 << bits))
    }
}

#[derive(Clone, Debug, Arbitrary)]
enum BuddyOp {
    Configure { halve: bool, ternary: bool },
    Allocate(usize),
    Deallocate(usize),
    Init(Total),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    total: Total,
    ops: Vec<BuddyOp>,
}

fuzz_target!(|args: Args| {
    let mut buddy = TernaryBuddy::new(args.total.0).unwrap();
    let mut outstanding: Vec<Allocation> = Vec::new();

    for op in args.ops {
        match op {
            BuddyOp::Configure { halve, ternary } => buddy.configure(halve, ternary),

            BuddyOp::Allocate(size) => {
                let (requested, allocated) = (buddy.requested(), buddy.allocated());

                match buddy.alloc(size) {
                    Ok(a) => {
                        assert!(a.size() >= size);
                        outstanding.push(a);
                    }
                    Err(_) => {
                        assert_eq!(buddy.requested(), requested);
                        assert_eq!(buddy.allocated(), allocated);
                    }
                }
            }

            BuddyOp::Deallocate(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let a = outstanding.swap_remove(idx);
                buddy.free_allocation(a).unwrap();
            }

            BuddyOp::Init(total) => {
                buddy.init(total.0).unwrap();
                outstanding.clear();
            }
        }

        buddy.check_invariants().unwrap();
    }

    for a in outstanding {
        buddy.free_allocation(a).unwrap();
    }

    assert_eq!(buddy.blocks().count(), 1);
});
