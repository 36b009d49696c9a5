use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::{Result, StoreError};

/// Delivery stratum, 0 (lowest) to 9 (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const LOW: Priority = Priority(3);
    pub const NORM: Priority = Priority(5);
    pub const HIGH: Priority = Priority(7);
    pub const MAX: Priority = Priority(9);

    pub fn new(value: i32) -> Result<Self> {
        if (0..=9).contains(&value) {
            Ok(Priority(value as u8))
        } else {
            Err(StoreError::IllegalArgument(format!(
                "priority {value} is out of range 0-9"
            )))
        }
    }

    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORM
    }
}

impl TryFrom<i32> for Priority {
    type Error = StoreError;

    fn try_from(value: i32) -> Result<Self> {
        Priority::new(value)
    }
}

impl From<Priority> for i32 {
    fn from(p: Priority) -> i32 {
        p.as_i32()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range() {
        assert!(Priority::new(10).is_err());
        assert!(Priority::new(-1).is_err());
        assert_eq!(Priority::new(9).unwrap(), Priority::MAX);
    }

    #[test]
    fn orders_numerically() {
        assert!(Priority::MAX > Priority::NORM);
        assert!(Priority::MIN < Priority::LOW);
    }
}
