// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boards whose memory configuration is known ahead of time.

use drv_bluefield_ddr_api::{Candidate, MSS_COUNT};

/// Longest board name kept.
pub const BOARD_NAME_MAX: usize = 32;

/// Matches any single character in a known-system name.
pub const WILDCARD: u8 = b'?';

/// A board and the candidate each of its controllers uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KnownSystem {
    pub id: Option<u32>,
    pub name: &'static str,
    pub mss: [Candidate; MSS_COUNT],
}

include!(concat!(env!("OUT_DIR"), "/known_systems.rs"));

/// The identity the boot stage reports for this board.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BoardId {
    pub id: Option<u32>,
    pub name: heapless::String<BOARD_NAME_MAX>,
}

impl BoardId {
    /// Names longer than [`BOARD_NAME_MAX`] are truncated.
    pub fn new(id: Option<u32>, name: &str) -> Self {
        let mut s = heapless::String::new();
        for c in name.chars() {
            if s.push(c).is_err() {
                break;
            }
        }
        Self { id, name: s }
    }
}

/// True if `name` matches `pattern` character for character, with `?` in
/// the pattern matching anything.
pub fn name_matches(pattern: &str, name: &str) -> bool {
    pattern.len() == name.len()
        && pattern
            .bytes()
            .zip(name.bytes())
            .all(|(p, n)| p == WILDCARD || p == n)
}

/// Finds the entry for a board. A numeric id match anywhere in the table
/// wins over a name match.
pub fn lookup<'a>(
    table: &'a [KnownSystem],
    id: Option<u32>,
    name: &str,
) -> Option<&'a KnownSystem> {
    if let Some(id) = id {
        if let Some(s) = table.iter().find(|s| s.id == Some(id)) {
            return Some(s);
        }
    }
    table.iter().find(|s| name_matches(s.name, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TABLE: &[KnownSystem] = &[
        KnownSystem {
            id: None,
            name: "BF-A?",
            mss: [Candidate::Spd, Candidate::Spd],
        },
        KnownSystem {
            id: Some(7),
            name: "BF-B1",
            mss: [Candidate::Soldered8GbX8TwoRank, Candidate::NoMemory],
        },
    ];

    #[test]
    fn wildcard_matches_one_character() {
        assert!(name_matches("BF-A?", "BF-A3"));
        assert!(!name_matches("BF-A?", "BF-A"));
        assert!(!name_matches("BF-A?", "BF-A31"));
        assert!(!name_matches("BF-A?", "BF-B3"));
    }

    #[test]
    fn generated_table_is_well_formed() {
        for s in KNOWN_SYSTEMS {
            assert!(!s.name.is_empty());
            assert!(s.name.len() <= BOARD_NAME_MAX);
        }
    }

    #[test]
    fn long_names_are_truncated() {
        let b = BoardId::new(None, &"x".repeat(40));
        assert_eq!(b.name.len(), BOARD_NAME_MAX);
    }

    proptest! {
        #[test]
        fn id_match_wins_over_name(name in "BF-A[0-9]", id in 0u32..16) {
            let found = lookup(TABLE, Some(id), &name).map(|s| s.name);
            if id == 7 {
                prop_assert_eq!(found, Some("BF-B1"));
            } else {
                prop_assert_eq!(found, Some("BF-A?"));
            }
        }

        #[test]
        fn no_match_without_id_or_name(name in "[C-Z]{5}") {
            prop_assert_eq!(lookup(TABLE, None, &name), None);
        }
    }
}
