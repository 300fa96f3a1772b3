/// Wrap any integer into `0..count`, negative values included.
pub fn wrap_variant(variant: i64, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    variant.rem_euclid(count as i64) as usize
}

/// Visual parameter per variant
#[derive(Debug, Clone, Copy)]
pub struct VariantTable<T: Copy + 'static> {
    values: &'static [T],
}

impl<T: Copy + 'static> VariantTable<T> {
    /// `values` must not be empty.
    pub const fn new(values: &'static [T]) -> Self {
        assert!(!values.is_empty());
        Self { values }
    }

    pub const fn len(&self) -> usize {
        self.values.len()
    }

    pub fn index(&self, variant: i64) -> usize {
        wrap_variant(variant, self.values.len())
    }

    pub fn get(&self, variant: usize) -> T {
        self.values[variant % self.values.len()]
    }
}
