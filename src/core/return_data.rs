/// Result of a composite selection: what matched and how much of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnDataHolder<T> {
    pub count_entries: i64,
    pub count_bytes: i64,
    pub list: Vec<T>,
}

impl<T> Default for ReturnDataHolder<T> {
    fn default() -> Self {
        Self {
            count_entries: 0,
            count_bytes: 0,
            list: Vec::new(),
        }
    }
}

impl<T> ReturnDataHolder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T, size_in_bytes: i64) {
        self.list.push(item);
        self.count_entries += 1;
        self.count_bytes += size_in_bytes;
    }

    /// Drops the most recently pushed item, given its size.
    pub fn pop(&mut self, size_in_bytes: i64) -> Option<T> {
        let item = self.list.pop()?;
        self.count_entries -= 1;
        self.count_bytes -= size_in_bytes;
        Some(item)
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
