use sparse_store::Key;
use specs::EvictionSpec;

/// How the cache picks the rows to drop when it needs room.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least recently used clean rows first, dirty rows only once every clean candidate is gone.
    #[default]
    LruCleanFirst,
    /// Least recently used, regardless of the write back cost.
    Lru,
}

/// What the policy knows about an eviction candidate.
#[derive(Debug, Clone, Copy)]
pub(super) struct Candidate {
    pub key: Key,
    pub dirty: bool,
    pub last_used: u64,
}

impl EvictionPolicy {
    /// Orders `candidates` so the first ones are the first to go.
    ///
    /// Ties are broken by key so the choice doesn't depend on hashing order.
    pub(super) fn rank(self, candidates: &mut [Candidate]) {
        match self {
            Self::LruCleanFirst => candidates.sort_unstable_by_key(|c| (c.dirty, c.last_used, c.key)),
            Self::Lru => candidates.sort_unstable_by_key(|c| (c.last_used, c.key)),
        }
    }
}

impl From<EvictionSpec> for EvictionPolicy {
    fn from(value: EvictionSpec) -> Self {
        match value {
            EvictionSpec::LruCleanFirst => Self::LruCleanFirst,
            EvictionSpec::Lru => Self::Lru,
        }
    }
}
