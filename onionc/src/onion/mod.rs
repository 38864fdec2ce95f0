//! Onion algebra
//!
//! An onion is an encryption scheme for a column supporting a specific
//! operation class. Availability is tracked as a bitmask; the bit order is
//! the fixed preference order, so tie-breaks are deterministic.

mod set;

use serde::{Deserialize, Serialize};
pub use set::{HomDesc, OnionSet};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Onion {
    Plain,
    Det,
    Ope,
    Hom,
    HomRowDesc,
    HomAgg,
    Swp,
}

impl Onion {
    pub const ALL: [Onion; 7] = [
        Onion::Plain,
        Onion::Det,
        Onion::Ope,
        Onion::Hom,
        Onion::HomRowDesc,
        Onion::HomAgg,
        Onion::Swp,
    ];

    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn mask(self) -> OnionMask {
        OnionMask(self.bit())
    }
}

/// A set of onions, in preference bit order
/// PLAIN < DET < OPE < HOM < HOM_ROW_DESC < HOM_AGG < SWP.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OnionMask(u32);

impl OnionMask {
    pub const EMPTY: OnionMask = OnionMask(0);

    pub fn all() -> OnionMask {
        Onion::ALL.iter().fold(OnionMask::EMPTY, |m, o| m | *o)
    }

    /// Onions supporting `COUNT(expr)`.
    pub fn countable() -> OnionMask {
        Onion::Det.mask() | Onion::Ope | Onion::HomRowDesc | Onion::Swp
    }

    /// Onions supporting equality comparison.
    pub fn comparable() -> OnionMask {
        Onion::Det.mask() | Onion::Ope
    }

    /// Onions supporting order comparison.
    pub fn inequal_comparable() -> OnionMask {
        Onion::Ope.mask()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, o: Onion) -> bool {
        self.0 & o.bit() != 0
    }

    pub fn intersects(self, other: OnionMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn intersect(self, other: OnionMask) -> OnionMask {
        OnionMask(self.0 & other.0)
    }

    /// The preferred onion of the mask: its lowest set bit.
    pub fn pick_one(self) -> Option<Onion> {
        self.to_seq().into_iter().next()
    }

    /// Exactly-one assertion used where a position's onion must be decided.
    pub fn expect_one(self) -> Onion {
        let seq = self.to_seq();
        assert_eq!(seq.len(), 1, "expected exactly one onion in {self:?}");
        seq[0]
    }

    /// One entry per set bit, in preference order.
    pub fn to_seq(self) -> Vec<Onion> {
        Onion::ALL.into_iter().filter(|o| self.contains(*o)).collect()
    }

    /// The bits of `self` in preference order, then the remaining onions.
    pub fn complete_seq_with_preference(self) -> Vec<Onion> {
        let mut seq = self.to_seq();
        seq.extend(Onion::ALL.into_iter().filter(|o| !self.contains(*o)));
        seq
    }
}

impl std::ops::BitOr for OnionMask {
    type Output = OnionMask;
    fn bitor(self, rhs: OnionMask) -> OnionMask {
        OnionMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOr<Onion> for OnionMask {
    type Output = OnionMask;
    fn bitor(self, rhs: Onion) -> OnionMask {
        OnionMask(self.0 | rhs.bit())
    }
}

impl std::ops::BitOrAssign for OnionMask {
    fn bitor_assign(&mut self, rhs: OnionMask) {
        self.0 |= rhs.0;
    }
}

impl From<Onion> for OnionMask {
    fn from(o: Onion) -> Self {
        o.mask()
    }
}

impl FromIterator<Onion> for OnionMask {
    fn from_iter<I: IntoIterator<Item = Onion>>(iter: I) -> Self {
        iter.into_iter().fold(OnionMask::EMPTY, |m, o| m | o)
    }
}

/// The onion of one value, together with whether the value is a
/// `GROUP_CONCAT`-packed vector representing one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionType {
    pub onion: Onion,
    pub vector_ctx: bool,
}

impl OnionType {
    pub fn new(onion: Onion) -> Self {
        OnionType {
            onion,
            vector_ctx: false,
        }
    }

    pub fn vector(onion: Onion) -> Self {
        OnionType {
            onion,
            vector_ctx: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_one_is_contained() {
        for o in Onion::ALL {
            let m = o.mask() | Onion::Swp;
            let picked = m.pick_one().unwrap();
            assert!(m.contains(picked));
        }
        assert_eq!(OnionMask::EMPTY.pick_one(), None);
    }

    #[test]
    fn to_seq_one_entry_per_bit() {
        let m = Onion::Ope.mask() | Onion::Det | Onion::Swp;
        assert_eq!(m.to_seq(), vec![Onion::Det, Onion::Ope, Onion::Swp]);
    }

    #[test]
    fn complete_seq_starts_with_own_bits() {
        let m = Onion::Ope.mask() | Onion::Swp;
        let seq = m.complete_seq_with_preference();
        assert_eq!(&seq[..2], &[Onion::Ope, Onion::Swp]);
        assert_eq!(seq.len(), Onion::ALL.len());
        for o in Onion::ALL {
            assert_eq!(seq.iter().filter(|x| **x == o).count(), 1);
        }
    }

    #[test]
    fn preference_order_is_plain_first() {
        assert_eq!(OnionMask::all().pick_one(), Some(Onion::Plain));
        assert_eq!(OnionMask::comparable().pick_one(), Some(Onion::Det));
    }

    #[test]
    fn physical_names() {
        assert_eq!(Onion::HomRowDesc.to_string(), "HOM_ROW_DESC");
        assert_eq!(Onion::Ope.to_string(), "OPE");
        assert_eq!("HOM_AGG".parse::<Onion>().unwrap(), Onion::HomAgg);
    }
}
