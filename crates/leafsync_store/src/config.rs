//! Store configuration.

/// Configuration for the reference store.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Address prefixes that reject writes.
    pub read_only: Vec<String>,
    /// Maximum operations per batch, 0 for unlimited.
    pub max_batch: usize,
}

impl StoreConfig {
    /// Creates a configuration with everything writable and no batch limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an address prefix as read-only.
    pub fn with_read_only(mut self, prefix: impl Into<String>) -> Self {
        self.read_only.push(prefix.into());
        self
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch(mut self, size: usize) -> Self {
        self.max_batch = size;
        self
    }

    /// Returns true if `address` lies in a read-only region.
    ///
    /// A prefix matches the address itself and anything below it, so `DB.a`
    /// covers `DB.a.x` and `DB.a[0]` but not `DB.ab`.
    pub fn is_read_only(&self, address: &str) -> bool {
        self.read_only.iter().any(|prefix| {
            address == prefix
                || address
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('['))
        })
    }

    /// Returns true if a batch of `size` operations is allowed.
    pub fn allows_batch(&self, size: usize) -> bool {
        self.max_batch == 0 || size <= self.max_batch
    }
}
