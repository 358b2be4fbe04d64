//! Identifier newtypes shared across the workspace.
//!
//! All identifiers are small integers so they serialize compactly into ledger
//! records and sort deterministically in `BTreeMap`s.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Create from a raw value.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Raw value.
            pub const fn value(self) -> u64 {
                self.0
            }

            /// The identifier following this one.
            pub const fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a node (replica) in a cluster.
    ///
    /// Recovered clusters allocate fresh node identifiers after the highest
    /// identifier found in the ledger, so ids never repeat across recoveries.
    NodeId,
    "node"
);

numeric_id!(
    /// Identifier of a governance member.
    MemberId,
    "member"
);

numeric_id!(
    /// Identifier of a governance proposal.
    ProposalId,
    "proposal"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_prefixed() {
        assert_eq!(NodeId::new(3).to_string(), "node-3");
        assert_eq!(MemberId::new(0).to_string(), "member-0");
        assert_eq!(ProposalId::new(7).next().to_string(), "proposal-8");
    }

    #[test]
    fn serializes_transparently() {
        let json = serde_json::to_string(&NodeId::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
