//! Property tests for the ordinate total order.

#[macro_use]
extern crate proptest;

use proptest::prelude::{Strategy, any, prop};

use cueval::ordinate::Ordinate;

/// Generate composite ordinates of the `block:ordinate:hash` form, or pure
/// integer strings.
fn ordinate_strategy() -> impl Strategy<Value = (u128, String)> {
    let suffix = prop::option::of(prop::string::string_regex(":[0-9]{1,4}:[a-z0-9]{1,8}").unwrap());
    (any::<u128>(), suffix).prop_map(|(n, suffix)| (n, suffix.unwrap_or_default()))
}

fn build(parts: &(u128, String)) -> Ordinate {
    Ordinate::new(format!("{}{}", parts.0, parts.1))
}

proptest! {
    /// The ordinate order equals the (integer, suffix) tuple order.
    #[test]
    fn prop_order_matches_tuple_order(a in ordinate_strategy(), b in ordinate_strategy()) {
        let expected = (a.0, a.1.clone()).cmp(&(b.0, b.1.clone()));
        prop_assert_eq!(build(&a).cmp(&build(&b)), expected);
    }

    /// Sort keys preserve the order under plain string comparison.
    #[test]
    fn prop_sort_key_is_order_preserving(a in ordinate_strategy(), b in ordinate_strategy()) {
        let (oa, ob) = (build(&a), build(&b));
        prop_assert_eq!(oa.sort_key().cmp(&ob.sort_key()), oa.cmp(&ob));
    }

    /// Leading zeros never change the position.
    #[test]
    fn prop_leading_zeros_are_insignificant(n in any::<u64>(), zeros in 1usize..4) {
        let padded = Ordinate::new(format!("{}{}", "0".repeat(zeros), n));
        prop_assert_eq!(padded.cmp(&Ordinate::from_int(n)), std::cmp::Ordering::Equal);
    }

    /// Display round-trips the raw form.
    #[test]
    fn prop_display_round_trips(a in ordinate_strategy()) {
        let ordinate = build(&a);
        prop_assert_eq!(Ordinate::new(ordinate.to_string()), ordinate);
    }
}
