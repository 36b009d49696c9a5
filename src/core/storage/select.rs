//! Selection rules shared by every storage, evaluated over the ordered index.
//!
//! A negative `num_entries` or `num_bytes` means unlimited.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::core::entry::OrderKey;
use crate::core::return_data::ReturnDataHolder;

/// Per-entry data the index keeps next to the tier's slot.
#[derive(Debug, Clone)]
pub(crate) struct Row<S> {
    pub size: i64,
    pub persistent: bool,
    pub slot: S,
}

pub(crate) type OrderedRows<S> = BTreeMap<OrderKey, Row<S>>;

/// Walks the rows from the head in delivery order.
///
/// Entries with priority above `max_priority` are skipped, the walk stops at
/// the first entry below `min_priority`. A negative `min_priority` selects
/// only the priority of the head entry. `start_after` makes the walk begin
/// right after that key.
pub(crate) fn forward<S>(
    rows: &OrderedRows<S>,
    num_entries: i64,
    num_bytes: i64,
    min_priority: i32,
    max_priority: i32,
    start_after: Option<OrderKey>,
) -> ReturnDataHolder<OrderKey> {
    let mut ret = ReturnDataHolder::new();
    if num_entries == 0 {
        return ret;
    }
    let range = match start_after {
        Some(key) => rows.range((Bound::Excluded(key), Bound::Unbounded)),
        None => rows.range::<OrderKey, _>(..),
    };

    let (mut min, mut max) = (min_priority, max_priority);
    for (key, row) in range {
        let prio = key.priority.as_i32();
        if min < 0 {
            min = prio;
            max = prio;
        }
        if prio < min {
            break;
        }
        if prio > max {
            continue;
        }
        if num_bytes > -1 && ret.count_entries > 0 && ret.count_bytes + row.size > num_bytes {
            break;
        }
        ret.push(*key, row.size);
        if num_entries > -1 && ret.count_entries >= num_entries {
            break;
        }
    }
    ret
}

fn is_inside_range(num_entries: i64, max_entries: i64, num_bytes: i64, max_bytes: i64) -> bool {
    if max_entries < 0 {
        return max_bytes < 0 || num_bytes < max_bytes;
    }
    if max_bytes < 0 {
        return num_entries < max_entries;
    }
    num_entries < max_entries && num_bytes < max_bytes
}

/// Walks from the tail, collecting entries of lower order than `limit`.
///
/// With `leave_one` the selection never covers every stored entry: if it
/// would, the highest-order candidate is dropped again.
pub(crate) fn lowest<S>(
    rows: &OrderedRows<S>,
    num_entries: i64,
    num_bytes: i64,
    limit: Option<OrderKey>,
    leave_one: bool,
) -> ReturnDataHolder<OrderKey> {
    let mut ret = ReturnDataHolder::new();
    for (key, row) in rows.iter().rev() {
        if let Some(limit) = limit {
            if !key.is_lower_than(&limit) {
                break;
            }
        }
        if !is_inside_range(ret.count_entries, num_entries, ret.count_bytes, num_bytes) {
            break;
        }
        ret.push(*key, row.size);
    }
    if leave_one && !ret.is_empty() && ret.list.len() == rows.len() {
        if let Some(last) = ret.list.last().copied() {
            let size = rows.get(&last).map_or(0, |r| r.size);
            ret.pop(size);
        }
    }
    ret
}

/// All keys of higher order than `limit`, plus `limit` itself when `inclusive`.
pub(crate) fn head<S>(rows: &OrderedRows<S>, limit: OrderKey, inclusive: bool) -> ReturnDataHolder<OrderKey> {
    let upper = if inclusive {
        Bound::Included(limit)
    } else {
        Bound::Excluded(limit)
    };
    let mut ret = ReturnDataHolder::new();
    for (key, row) in rows.range((Bound::Unbounded, upper)) {
        ret.push(*key, row.size);
    }
    ret
}
