//! Call-property mutation applied before each dispatch.

use crate::{prog::Prog, RngType};
use rand::Rng;

pub const FAIL_NTH_MIN: i32 = 10;
pub const FAIL_NTH_MAX: i32 = 30;

/// Re-roll the fault injection index of every call that requests one.
/// Calls with a non-positive index are left untouched.
pub fn mutate_fail_nth(prog: &mut Prog, rng: &mut RngType) {
    for call in prog.calls_mut() {
        if call.props.fail_nth > 0 {
            call.props.fail_nth = rng.gen_range(FAIL_NTH_MIN..FAIL_NTH_MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prog::{Call, CallProps};
    use rand::SeedableRng;

    fn prog() -> Prog {
        Prog::new(vec![
            Call::new("socket(0x2, 0x1, 0x0)", CallProps { fail_nth: 1 }),
            Call::new("close(0x3)", CallProps { fail_nth: 0 }),
            Call::new("read(0x3, 0x0, 0x0)", CallProps { fail_nth: 100 }),
        ])
    }

    #[test]
    fn mutated_values_stay_in_range() {
        let mut rng = RngType::seed_from_u64(7);
        for _ in 0..64 {
            let mut p = prog();
            mutate_fail_nth(&mut p, &mut rng);
            for call in p.calls().iter().filter(|c| c.props.fail_nth != 0) {
                assert!((FAIL_NTH_MIN..FAIL_NTH_MAX).contains(&call.props.fail_nth));
            }
        }
    }

    #[test]
    fn non_positive_untouched() {
        let mut rng = RngType::seed_from_u64(7);
        let mut p = prog();
        mutate_fail_nth(&mut p, &mut rng);
        assert_eq!(p.calls()[1].props.fail_nth, 0);
    }

    #[test]
    fn deterministic_under_seed() {
        let (mut a, mut b) = (prog(), prog());
        let mut rng_a = RngType::seed_from_u64(42);
        let mut rng_b = RngType::seed_from_u64(42);
        mutate_fail_nth(&mut a, &mut rng_a);
        mutate_fail_nth(&mut b, &mut rng_b);
        assert_eq!(a, b);
    }
}
