// src/tracking/hungarian.rs
use ndarray::Array2;

/// Minimum-cost linear assignment on a (possibly rectangular) cost matrix.
///
/// Returns `min(rows, cols)` `(row, col)` pairs sorted by row. The matrix is
/// padded to square with zero-cost dummy entries, so a rectangular problem
/// picks the cheapest subset of the longer side. Non-finite costs are
/// replaced by a value larger than any complete finite assignment, which
/// keeps them out of the solution whenever a finite alternative exists.
/// That value is capped at `f64::MAX / 4` so that costs near the `f64`
/// limit still solve without NaN.
///
/// Runs the O(n^3) shortest-augmenting-path form of the Hungarian algorithm
/// with row/column potentials. Ties resolve in favour of the lowest column
/// index reached first, so the result is deterministic.
pub fn linear_sum_assignment(costs: &Array2<f64>) -> Vec<(usize, usize)> {
    let (n_rows, n_cols) = costs.dim();
    if n_rows == 0 || n_cols == 0 {
        return Vec::new();
    }

    let finite_total: f64 = costs.iter().filter(|v| v.is_finite()).map(|v| v.abs()).sum();
    // bounded so potential updates cannot reach inf - inf
    let forbidden = if finite_total.is_finite() {
        (finite_total + 1.0).min(f64::MAX / 4.0)
    } else {
        f64::MAX / 4.0
    };

    let n = n_rows.max(n_cols);
    let mut c = Array2::<f64>::zeros((n, n));
    for ((i, j), &value) in costs.indexed_iter() {
        c[[i, j]] = if value.is_finite() { value } else { forbidden };
    }

    // Potentials and matching are 1-indexed; index 0 is the virtual source.
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; n + 1];
    // p[j]: row assigned to column j (0 = free)
    let mut p = vec![0_usize; n + 1];
    let mut way = vec![0_usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0_usize;
        let mut min_val = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0_usize;

            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let reduced = c[[i0 - 1, j - 1]] - u[i0] - v[j];
                if reduced < min_val[j] {
                    min_val[j] = reduced;
                    way[j] = j0;
                }
                if min_val[j] < delta {
                    delta = min_val[j];
                    j1 = j;
                }
            }

            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_val[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // augment along the path
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment: Vec<(usize, usize)> = (1..=n)
        .filter(|&j| p[j] != 0)
        .map(|j| (p[j] - 1, j - 1))
        .filter(|&(row, col)| row < n_rows && col < n_cols)
        .collect();
    assignment.sort_unstable();
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn total(costs: &Array2<f64>, assignment: &[(usize, usize)]) -> f64 {
        assignment.iter().map(|&(i, j)| costs[[i, j]]).sum()
    }

    #[test]
    fn diagonal_is_kept_when_cheapest() {
        let costs = array![[0.0, 1.0], [1.0, 0.0]];
        assert_eq!(linear_sum_assignment(&costs), vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn swaps_when_off_diagonal_is_cheaper() {
        let costs = array![[1.0, 0.0], [0.0, 1.0]];
        assert_eq!(linear_sum_assignment(&costs), vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn global_optimum_beats_greedy() {
        // greedy would take (0,0)=1 then (1,1)=10; optimum is 2 + 2
        let costs = array![[1.0, 2.0], [2.0, 10.0]];
        let assignment = linear_sum_assignment(&costs);
        assert_eq!(assignment, vec![(0, 1), (1, 0)]);
        assert_eq!(total(&costs, &assignment), 4.0);
    }

    #[test]
    fn known_3x3_optimum() {
        let costs = array![[4.0, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        let assignment = linear_sum_assignment(&costs);
        assert_eq!(total(&costs, &assignment), 5.0);
        assert_eq!(assignment, vec![(0, 1), (1, 0), (2, 2)]);
    }

    #[test]
    fn wide_matrix_assigns_every_row() {
        let costs = array![[5.0, 1.0, 9.0], [1.0, 5.0, 9.0]];
        assert_eq!(linear_sum_assignment(&costs), vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn tall_matrix_picks_cheapest_rows() {
        let costs = array![[9.0], [1.0], [4.0]];
        assert_eq!(linear_sum_assignment(&costs), vec![(1, 0)]);
    }

    #[test]
    fn empty_side_yields_nothing() {
        assert!(linear_sum_assignment(&Array2::<f64>::zeros((0, 3))).is_empty());
        assert!(linear_sum_assignment(&Array2::<f64>::zeros((2, 0))).is_empty());
    }

    #[test]
    fn infinite_costs_are_avoided() {
        let costs = array![[f64::INFINITY, 3.0], [1.0, f64::INFINITY]];
        assert_eq!(linear_sum_assignment(&costs), vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn huge_costs_with_infinity_still_solve() {
        // the finite costs alone sum past f64::MAX
        let costs = array![[1e308, f64::INFINITY, 0.0], [0.0, 1e308, 1e308]];
        let assignment = linear_sum_assignment(&costs);
        assert_eq!(assignment, vec![(0, 2), (1, 0)]);
        assert_eq!(total(&costs, &assignment), 0.0);
    }
}
