//! Breadth-first bisection ordering of frame lists.
//!
//! Rendering the ends first and then repeatedly the midpoint of every
//! remaining interval means a problem confined to one part of the range
//! shows up after O(log n) frames instead of O(n).

use std::collections::VecDeque;

/// Intervals shorter than this are emitted in order rather than split.
const MIN_SPLIT: usize = 4;

/// Reorder `items`: first, last, then midpoints of the remaining
/// intervals breadth first.
pub fn bisection_order<T: Copy>(items: &[T]) -> Vec<T> {
    let n = items.len();
    if n <= 2 {
        return items.to_vec();
    }

    let mut out = Vec::with_capacity(n);
    out.push(items[0]);
    out.push(items[n - 1]);

    // Half-open index intervals still to emit.
    let mut pending = VecDeque::from([(1, n - 1)]);
    while let Some((low, high)) = pending.pop_front() {
        if high - low < MIN_SPLIT {
            out.extend_from_slice(&items[low..high]);
            continue;
        }
        let mid = low + (high - low) / 2;
        out.push(items[mid]);
        pending.push_back((low, mid));
        pending.push_back((mid + 1, high));
    }
    out
}
