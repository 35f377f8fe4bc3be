//! Stride-based loop-order heuristic used by the device backends.

use std::cmp::Ordering;

use smelt_ir::Size;

/// Pick a loop iteration order for an iteration domain.
///
/// `stride_lengths` has one row per reader and one column per dimension.
/// Size-1 dims sink to the last positions; otherwise dim `a` precedes `b`
/// when every reader either ignores `b` or strides `a` more finely. When
/// `priority_idx` names reader rows, only those rows vote. With ordering
/// disabled the result is simply reversed dimension order.
///
/// This has not been well tuned and may be something to autotune.
pub fn pick_loop_order(
    stride_lengths: &[Vec<i64>],
    sizes: &[Size],
    priority_idx: &[usize],
    pick_loop_orders: bool,
) -> Vec<usize> {
    let rows: Vec<&Vec<i64>> = if priority_idx.is_empty() {
        stride_lengths.iter().collect()
    } else {
        // if we have a priority node, only use that node's order
        priority_idx.iter().map(|&row| &stride_lengths[row]).collect()
    };

    let index_cmp = |a: usize, b: usize| -> Ordering {
        if sizes[a].is_one() || sizes[b].is_one() {
            // 1-sizes don't matter, just move them to the end
            return sizes[a].is_one().cmp(&sizes[b].is_one());
        }

        let a_first = rows.iter().all(|row| row[b] == 0 || row[a] < row[b]);
        let b_first = rows.iter().all(|row| row[a] == 0 || row[a] > row[b]);

        if a_first && !b_first {
            return Ordering::Less;
        }
        if b_first && !a_first {
            return Ordering::Greater;
        }

        // otherwise contiguous
        b.cmp(&a)
    };

    let mut order: Vec<usize> = (0..sizes.len()).rev().collect();
    if pick_loop_orders {
        order.sort_by(|&a, &b| index_cmp(a, b));
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(sizes: &[u64]) -> Vec<Size> {
        sizes.iter().map(|&size| Size::Lit(size)).collect()
    }

    #[test]
    fn disabled_order_is_reversed_range() {
        let strides = vec![vec![1, 4, 16]];
        assert_eq!(
            pick_loop_order(&strides, &lit(&[4, 4, 4]), &[], false),
            vec![2, 1, 0]
        );
    }

    #[test]
    fn finer_strides_come_first() {
        let strides = vec![vec![1, 4], vec![1, 8]];
        assert_eq!(
            pick_loop_order(&strides, &lit(&[4, 4]), &[], true),
            vec![0, 1]
        );
    }

    #[test]
    fn size_one_dims_sink_to_the_end() {
        let strides = vec![vec![1, 0, 4]];
        assert_eq!(
            pick_loop_order(&strides, &lit(&[4, 1, 4]), &[], true),
            vec![0, 2, 1]
        );
    }

    #[test]
    fn conflicting_readers_stay_contiguous() {
        // reader 0 prefers dim 0 inner, reader 1 prefers dim 1 inner; the
        // tie falls back to higher-index-first
        let strides = vec![vec![1, 4], vec![4, 1]];
        assert_eq!(
            pick_loop_order(&strides, &lit(&[4, 4]), &[], true),
            vec![1, 0]
        );
    }

    #[test]
    fn priority_rows_override_the_rest() {
        let strides = vec![vec![1, 4], vec![4, 1]];
        assert_eq!(
            pick_loop_order(&strides, &lit(&[4, 4]), &[1], true),
            vec![1, 0]
        );
        assert_eq!(
            pick_loop_order(&strides, &lit(&[4, 4]), &[0], true),
            vec![0, 1]
        );
    }
}
