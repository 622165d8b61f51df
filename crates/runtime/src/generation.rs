/// Monotonic stamp for one round of priority updates.
///
/// Requests record the generation they were made in; anything not refreshed
/// in the latest generation is stale.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }

    pub fn is_older_than(self, other: Generation) -> bool {
        self.0 < other.0
    }
}
