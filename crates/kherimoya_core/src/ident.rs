//! Short, human-readable server identifiers.
//!
//! Identifiers are lowercase base-36 blocks of a fixed width joined by `-`, for
//! example `a1b2` or `a1b2-c3d4`. The allocator always hands out the shortest
//! identifier whose space still has room, so identifiers only grow once every
//! value of the current length is taken. As a last resort it falls back to a
//! random UUID, which keeps allocation total.

use rand::Rng;
use std::collections::HashSet;
use tracing::debug;

/// Alphabet identifiers are drawn from.
pub const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Joins identifier blocks.
pub const GROUP_SEPARATOR: char = '-';

/// Allocates identifiers that do not collide with an existing set.
#[derive(Debug, Clone)]
pub struct IdentifierAllocator {
    /// Characters per block
    pub group_size: usize,
    /// Largest block count tried before falling back to a UUID
    pub max_groups: usize,
    /// Random draws per block count
    pub max_random_tries: usize,
}

impl Default for IdentifierAllocator {
    fn default() -> Self {
        Self {
            group_size: 4,
            max_groups: 9,
            max_random_tries: 1000,
        }
    }
}

impl IdentifierAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an identifier not present in `existing`, compared case-insensitively.
    pub fn allocate<I, S>(&self, existing: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let existing: HashSet<String> = existing
            .into_iter()
            .map(|id| id.as_ref().to_lowercase())
            .collect();

        for groups in 1..=self.max_groups {
            let space = self.space_size(groups);
            let taken = if (existing.len() as u128) < space {
                0
            } else {
                existing
                    .iter()
                    .filter(|id| self.group_count(id) == Some(groups))
                    .count() as u128
            };

            if taken >= space {
                debug!("Identifier space with {} group(s) is exhausted", groups);
                continue;
            }

            for _ in 0..self.max_random_tries {
                let candidate = self.random_id(groups);
                if !existing.contains(&candidate) {
                    return candidate;
                }
            }

            debug!(
                "No free identifier with {} group(s) after {} draws",
                groups, self.max_random_tries
            );
        }

        loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !existing.contains(&candidate) {
                return candidate;
            }
        }
    }

    /// Number of distinct identifiers with `groups` blocks, saturating at `u128::MAX`.
    pub fn space_size(&self, groups: usize) -> u128 {
        let exponent = (self.group_size * groups) as u32;
        (ALPHABET.len() as u128).checked_pow(exponent).unwrap_or(u128::MAX)
    }

    /// Block count of a well-formed lowercase identifier, `None` for anything else.
    pub fn group_count(&self, id: &str) -> Option<usize> {
        if self.group_size == 0 || id.is_empty() {
            return None;
        }

        let mut groups = 0;
        for block in id.split(GROUP_SEPARATOR) {
            if block.len() != self.group_size || !block.bytes().all(|b| ALPHABET.contains(&b)) {
                return None;
            }
            groups += 1;
        }
        Some(groups)
    }

    /// Whether `id` is a grouped identifier (of any length) in canonical form.
    pub fn is_well_formed(&self, id: &str) -> bool {
        self.group_count(id).is_some()
    }

    fn random_id(&self, groups: usize) -> String {
        // ThreadRng is a CSPRNG reseeded from the operating system.
        let mut rng = rand::rng();
        let mut id = String::with_capacity(groups * (self.group_size + 1));
        for group in 0..groups {
            if group > 0 {
                id.push(GROUP_SEPARATOR);
            }
            for _ in 0..self.group_size {
                let idx = rng.random_range(0..ALPHABET.len());
                id.push(ALPHABET[idx] as char);
            }
        }
        id
    }
}
