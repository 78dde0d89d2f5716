/// Which implicit conversions the converter is permitted to perform while
/// decoding a `(T, V)` pair into a different target type `T'`.
///
/// Mirrors the bit-per-category scheme the original `uf::convpolicy`
/// bitmask uses; kept as a small hand-rolled bitset rather than pulling in
/// a `bitflags`-style crate, since a single `u16` comfortably holds every
/// category named in the spec.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Default)]
pub struct ConvertPolicy(u16);

impl ConvertPolicy {
    pub const BOOL: ConvertPolicy = ConvertPolicy(1 << 0);
    pub const INTS: ConvertPolicy = ConvertPolicy(1 << 1);
    pub const INTS_NARROWING: ConvertPolicy = ConvertPolicy(1 << 2);
    pub const DOUBLE: ConvertPolicy = ConvertPolicy(1 << 3);
    pub const EXPECTED: ConvertPolicy = ConvertPolicy(1 << 4);
    pub const ANY: ConvertPolicy = ConvertPolicy(1 << 5);
    pub const AUX: ConvertPolicy = ConvertPolicy(1 << 6);
    pub const TUPLE_LIST: ConvertPolicy = ConvertPolicy(1 << 7);

    pub const NONE: ConvertPolicy = ConvertPolicy(0);
    pub const ALL: ConvertPolicy = ConvertPolicy(0x00ff);

    pub fn contains(self, bit: ConvertPolicy) -> bool {
        self.0 & bit.0 == bit.0
    }

    pub fn union(self, other: ConvertPolicy) -> ConvertPolicy {
        ConvertPolicy(self.0 | other.0)
    }

    pub fn is_subset_of(self, other: ConvertPolicy) -> bool {
        self.0 & other.0 == self.0
    }
}

impl std::ops::BitOr for ConvertPolicy {
    type Output = ConvertPolicy;
    fn bitor(self, rhs: ConvertPolicy) -> ConvertPolicy {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for ConvertPolicy {
    fn bitor_assign(&mut self, rhs: ConvertPolicy) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod test {
    use super::ConvertPolicy;

    #[test]
    fn test_union_and_contains() {
        let p = ConvertPolicy::BOOL | ConvertPolicy::ANY;
        assert!(p.contains(ConvertPolicy::BOOL));
        assert!(p.contains(ConvertPolicy::ANY));
        assert!(!p.contains(ConvertPolicy::DOUBLE));
    }

    #[test]
    fn test_monotonicity_subset() {
        let p = ConvertPolicy::BOOL;
        let p2 = p | ConvertPolicy::INTS;
        assert!(p.is_subset_of(p2));
        assert!(!p2.is_subset_of(p));
    }

    #[test]
    fn test_all_contains_everything() {
        for bit in [
            ConvertPolicy::BOOL,
            ConvertPolicy::INTS,
            ConvertPolicy::INTS_NARROWING,
            ConvertPolicy::DOUBLE,
            ConvertPolicy::EXPECTED,
            ConvertPolicy::ANY,
            ConvertPolicy::AUX,
            ConvertPolicy::TUPLE_LIST,
        ] {
            assert!(ConvertPolicy::ALL.contains(bit));
        }
    }
}
