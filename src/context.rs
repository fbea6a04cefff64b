use bitflags::bitflags;
use ndarray::{s, Array1, Array2};

use crate::param::EdgeIndex;

bitflags! {
    /// Functionality flags for contexts
    #[derive(Default)]
    pub struct Flag: u32 {
        /// Allocate the max-product lattice and its back-pointers
        const VITERBI = 0x01;
        /// Allocate the backward lattice for marginals and expectations
        const MARGINALS = 0x02;
        const ALL = 0xFF;
    }
}

/// Lattice of one linear chain: scores, scaled forward/backward variables
/// and the Viterbi tables.
///
/// Scores are kept in log space; potentials are their exponents shifted by
/// the per-position (state) or global (transition) maximum, and the shifts
/// are added back into the log normaliser. A state score of `-inf` gives a
/// zero potential, which removes the label at that position.
#[derive(Debug, Clone)]
pub struct ChainContext {
    /// Flag specifying the functionality
    flag: Flag,
    /// The total number of distinct labels
    num_labels: usize,
    /// The number of items in the current sequence
    num_items: usize,
    cap_items: usize,
    /// Logarithm of the normalization factor for the sequence
    log_norm: f64,
    /// Sum of the shifts taken out of the potentials
    shift: f64,
    /// State scores
    ///
    /// This is a `[T][L]` matrix whose element `[t][l]` presents total score
    /// of state features associating label #l at #t.
    pub state: Array2<f64>,
    /// Transition scores
    ///
    /// This is a `[L][L]` matrix whose element `[i][j]` represents the
    /// score of the transition from label #i to #j.
    trans: Array2<f64>,
    /// Score of every unlisted transition leaving label #i
    default: Array1<f64>,
    exp_state: Array2<f64>,
    exp_trans: Array2<f64>,
    exp_default: Array1<f64>,
    /// Scaled forward variables; every row sums to one
    alpha: Array2<f64>,
    /// Scaled backward variables
    beta: Array2<f64>,
    /// `scale[t]` is the reciprocal of the unscaled forward sum at `t`
    scale: Array1<f64>,
    /// Row vector (work space)
    row: Array1<f64>,
    /// Max-product scores
    delta: Array2<f64>,
    /// Backward edges
    ///
    /// This is a `[T][L]` matrix whose element `[t][j]` represents the label #i
    /// that yields the maximum score to arrive at (t, j).
    backward_edge: Array2<u32>,
}

impl ChainContext {
    pub fn new(flag: Flag, num_labels: usize, max_items: usize) -> Self {
        let l = num_labels;
        let mut ctx = Self {
            flag,
            num_labels: l,
            num_items: 0,
            cap_items: 0,
            log_norm: 0.0,
            shift: 0.0,
            state: Array2::zeros((0, l)),
            trans: Array2::zeros((l, l)),
            default: Array1::zeros(l),
            exp_state: Array2::zeros((0, l)),
            exp_trans: Array2::zeros((l, l)),
            exp_default: Array1::zeros(l),
            alpha: Array2::zeros((0, l)),
            beta: Array2::zeros((0, l)),
            scale: Array1::zeros(0),
            row: Array1::zeros(l),
            delta: Array2::zeros((0, l)),
            backward_edge: Array2::zeros((0, l)),
        };
        ctx.set_num_items(max_items);
        // max_items is only a capacity hint
        ctx.num_items = 0;
        ctx
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Prepare the lattice for a sequence of `t` items, growing the buffers
    /// when needed, and clear the state scores.
    pub fn set_num_items(&mut self, t: usize) {
        self.num_items = t;
        if self.cap_items < t {
            let l = self.num_labels;
            self.state = Array2::zeros((t, l));
            self.exp_state = Array2::zeros((t, l));
            self.alpha = Array2::zeros((t, l));
            self.scale = Array1::zeros(t);
            if self.flag.contains(Flag::MARGINALS) {
                self.beta = Array2::zeros((t, l));
            }
            if self.flag.contains(Flag::VITERBI) {
                self.delta = Array2::zeros((t, l));
                self.backward_edge = Array2::zeros((t, l));
            }
            self.cap_items = t;
        }
        if t > 0 {
            self.state.slice_mut(s![..t, ..]).fill(0.0);
        }
    }

    /// Load transition scores from the weights addressed by an edge index
    pub fn set_transitions(&mut self, edges: &EdgeIndex, weights: &[f64]) {
        for i in 0..self.num_labels {
            let d = edges.default_weight(weights, i as u32);
            self.default[i] = d;
            self.trans.row_mut(i).fill(d);
        }
        for edge in edges.edges() {
            self.trans[[edge.prev as usize, edge.next as usize]] = weights[edge.slot as usize];
        }
    }

    /// Exponentiate the scores into shifted potentials
    pub fn exp_factors(&mut self) {
        let t_len = self.num_items;
        let c = max_finite(self.trans.iter().chain(self.default.iter()));
        self.exp_trans.assign(&self.trans);
        self.exp_trans.mapv_inplace(|x| (x - c).exp());
        self.exp_default.assign(&self.default);
        self.exp_default.mapv_inplace(|x| (x - c).exp());

        let mut shift = c * t_len.saturating_sub(1) as f64;
        for t in 0..t_len {
            let ct = max_finite(self.state.row(t).iter());
            for j in 0..self.num_labels {
                self.exp_state[[t, j]] = (self.state[[t, j]] - ct).exp();
            }
            shift += ct;
        }
        self.shift = shift;
    }

    /// Scaled forward recursion; returns `log Z`, `-inf` when no label
    /// sequence has a positive potential.
    pub fn forward(&mut self, edges: &EdgeIndex) -> f64 {
        let t_len = self.num_items;
        let l = self.num_labels;
        if t_len == 0 {
            self.log_norm = 0.0;
            return 0.0;
        }
        let sparse = edges.has_backpointers();

        for j in 0..l {
            self.alpha[[0, j]] = self.exp_state[[0, j]];
        }
        let mut possible = self.normalize_alpha(0);

        for t in 1..t_len {
            if sparse {
                for i in 0..l {
                    self.row[i] = self.alpha[[t - 1, i]] * self.exp_default[i];
                }
                let base = self.row.sum();
                for j in 0..l {
                    let listed = edges.into(j as u32);
                    let mut sum = 0.0;
                    let mut covered = 0.0;
                    for &(i, _) in listed {
                        let i = i as usize;
                        sum += self.alpha[[t - 1, i]] * self.exp_trans[[i, j]];
                        covered += self.row[i];
                    }
                    sum += unlisted_sum(&self.row, listed, base, covered);
                    self.alpha[[t, j]] = sum * self.exp_state[[t, j]];
                }
            } else {
                for j in 0..l {
                    let mut sum = 0.0;
                    for i in 0..l {
                        sum += self.alpha[[t - 1, i]] * self.exp_trans[[i, j]];
                    }
                    self.alpha[[t, j]] = sum * self.exp_state[[t, j]];
                }
            }
            possible &= self.normalize_alpha(t);
        }

        self.log_norm = if possible {
            -self.scale.slice(s![..t_len]).iter().map(|s| s.ln()).sum::<f64>() + self.shift
        } else {
            f64::NEG_INFINITY
        };
        self.log_norm
    }

    fn normalize_alpha(&mut self, t: usize) -> bool {
        let sum = self.alpha.row(t).sum();
        if sum > 0.0 && sum.is_finite() {
            let scale = 1.0 / sum;
            self.scale[t] = scale;
            self.alpha.row_mut(t).mapv_inplace(|v| v * scale);
            true
        } else {
            self.scale[t] = 1.0;
            self.alpha.row_mut(t).fill(0.0);
            false
        }
    }

    /// Scaled backward recursion, using the scale factors of [`forward`](Self::forward)
    pub fn backward(&mut self, edges: &EdgeIndex) {
        let t_len = self.num_items;
        let l = self.num_labels;
        if t_len == 0 {
            return;
        }
        let sparse = edges.has_backpointers();

        let last = self.scale[t_len - 1];
        self.beta.row_mut(t_len - 1).fill(last);

        for t in (0..t_len - 1).rev() {
            for j in 0..l {
                self.row[j] = self.exp_state[[t + 1, j]] * self.beta[[t + 1, j]];
            }
            let scale = self.scale[t];
            if sparse {
                let total = self.row.sum();
                for i in 0..l {
                    let listed = edges.from(i as u32);
                    let mut sum = 0.0;
                    let mut covered = 0.0;
                    for &(j, _) in listed {
                        let j = j as usize;
                        sum += self.exp_trans[[i, j]] * self.row[j];
                        covered += self.row[j];
                    }
                    sum += self.exp_default[i] * unlisted_sum(&self.row, listed, total, covered);
                    self.beta[[t, i]] = sum * scale;
                }
            } else {
                for i in 0..l {
                    let mut sum = 0.0;
                    for j in 0..l {
                        sum += self.exp_trans[[i, j]] * self.row[j];
                    }
                    self.beta[[t, i]] = sum * scale;
                }
            }
        }
    }

    /// `log Z` of the last forward pass
    pub fn log_norm(&self) -> f64 {
        self.log_norm
    }

    /// `log Z` recomputed from the backward variables at position 0
    pub fn backward_log_norm(&self) -> f64 {
        let t_len = self.num_items;
        if t_len == 0 {
            return 0.0;
        }
        let head: f64 = (0..self.num_labels)
            .map(|y| self.exp_state[[0, y]] * self.beta[[0, y]])
            .sum();
        head.ln() - self.scale.slice(s![..t_len]).iter().map(|s| s.ln()).sum::<f64>()
            + self.shift
    }

    /// Marginal probability of label `y` at position `t`
    #[inline]
    pub fn state_marginal(&self, t: usize, y: usize) -> f64 {
        self.alpha[[t, y]] * self.beta[[t, y]] / self.scale[t]
    }

    /// Add `factor` times the expected transition counts of the sequence to
    /// `grad`: listed transitions to their own slots, everything else to the
    /// remainder slot of its predecessor.
    pub fn accumulate_transitions(&mut self, edges: &EdgeIndex, grad: &mut [f64], factor: f64) {
        let l = self.num_labels;
        for t in 1..self.num_items {
            for j in 0..l {
                self.row[j] = self.exp_state[[t, j]] * self.beta[[t, j]];
            }
            let total = self.row.sum();
            for i in 0..l {
                let a = self.alpha[[t - 1, i]];
                if a == 0.0 {
                    continue;
                }
                let listed = edges.from(i as u32);
                let mut covered = 0.0;
                for &(j, slot) in listed {
                    let j = j as usize;
                    grad[slot as usize] += factor * a * self.exp_trans[[i, j]] * self.row[j];
                    covered += self.row[j];
                }
                if let Some(r) = edges.remainder(i as u32) {
                    let rest = unlisted_sum(&self.row, listed, total, covered);
                    grad[r as usize] += factor * a * self.exp_default[i] * rest;
                }
            }
        }
    }

    /// Score of a label path under the current scores
    pub fn path_score(&self, labels: &[u32]) -> f64 {
        let mut score = 0.0;
        for (t, &y) in labels.iter().enumerate().take(self.num_items) {
            score += self.state[[t, y as usize]];
            if t > 0 {
                score += self.trans[[labels[t - 1] as usize, y as usize]];
            }
        }
        score
    }

    /// Best label path and its score.
    ///
    /// Ties are broken towards the lowest label id, both for back-pointers
    /// and for the final label.
    pub fn viterbi(&mut self) -> (Vec<u32>, f64) {
        let l = self.num_labels;
        let t_len = self.num_items;
        if t_len == 0 {
            return (Vec::new(), 0.0);
        }

        // Compute the scores at (0, *)
        for j in 0..l {
            self.delta[[0, j]] = self.state[[0, j]];
        }

        // Compute the scores at (t, *)
        for t in 1..t_len {
            for j in 0..l {
                let mut max_score = f64::NEG_INFINITY;
                let mut argmax = 0;
                for i in 0..l {
                    // Transit from (t-1, i) to (t, j)
                    let score = self.delta[[t - 1, i]] + self.trans[[i, j]];
                    if score > max_score {
                        max_score = score;
                        argmax = i;
                    }
                }
                // Backward link (#t, #j) -> (#t-1, #i)
                self.backward_edge[[t, j]] = argmax as u32;
                self.delta[[t, j]] = max_score + self.state[[t, j]];
            }
        }

        // Find the label at the last position with the maximum score
        let mut max_score = f64::NEG_INFINITY;
        let mut labels = vec![0u32; t_len];
        for (i, &score) in self.delta.row(t_len - 1).iter().enumerate() {
            if score > max_score {
                max_score = score;
                labels[t_len - 1] = i as u32;
            }
        }

        // Tag labels by tracing the backward links
        for t in (0..t_len - 1).rev() {
            let next = labels[t + 1] as usize;
            labels[t] = self.backward_edge[[t + 1, next]];
        }

        (labels, max_score)
    }
}

/// Sum of the non-negative `values` whose index is not in the sorted
/// `listed` ids.
///
/// `total - covered` is exact enough while the listed part is at most half
/// of the total; past that the difference cancels and the unlisted entries
/// are summed directly.
fn unlisted_sum(values: &Array1<f64>, listed: &[(u32, u32)], total: f64, covered: f64) -> f64 {
    if covered <= 0.5 * total {
        return (total - covered).max(0.0);
    }
    let mut skip = listed.iter().map(|&(k, _)| k as usize).peekable();
    let mut sum = 0.0;
    for (k, &v) in values.iter().enumerate() {
        if skip.peek() == Some(&k) {
            skip.next();
            continue;
        }
        sum += v;
    }
    sum
}

/// Largest finite value, or zero when there is none
fn max_finite<'a, I>(values: I) -> f64
where
    I: Iterator<Item = &'a f64>,
{
    let max = values
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if max.is_finite() {
        max
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamStore;

    /// Two labels, listed transitions a->b and b->b, weights chosen so
    /// that every potential differs.
    fn fixture() -> (ParamStore, Vec<f64>) {
        let mut store = ParamStore::new();
        store.add_new_state("a").unwrap();
        store.add_new_state("b").unwrap();
        let fa = store.add_edge_feature(0).unwrap();
        let fb = store.add_edge_feature(1).unwrap();
        store.update_param(1, fa, 1.0).unwrap();
        store.update_param(1, fb, 1.0).unwrap();
        store.finalize().unwrap();
        (store, vec![0.7, -1.3])
    }

    fn load(ctx: &mut ChainContext, edges: &EdgeIndex, weights: &[f64]) {
        let scores = [[0.5, -0.2], [1.5, 0.1], [-0.4, 2.0]];
        ctx.set_num_items(scores.len());
        for (t, row) in scores.iter().enumerate() {
            for (y, &v) in row.iter().enumerate() {
                ctx.state[[t, y]] = v;
            }
        }
        ctx.set_transitions(edges, weights);
        ctx.exp_factors();
    }

    fn brute_force_log_z(ctx: &ChainContext) -> f64 {
        let mut total = 0.0;
        for y0 in 0..2 {
            for y1 in 0..2 {
                for y2 in 0..2 {
                    total += ctx.path_score(&[y0, y1, y2]).exp();
                }
            }
        }
        total.ln()
    }

    #[test]
    fn test_sparse_and_dense_agree_with_brute_force() {
        for backpointers in [true, false] {
            let (mut store, weights) = fixture();
            store.build_edge_index(backpointers).unwrap();
            let edges = store.edge_index().unwrap();
            let mut ctx = ChainContext::new(Flag::ALL, 2, 3);
            load(&mut ctx, edges, &weights);
            let log_z = ctx.forward(edges);
            ctx.backward(edges);
            assert!((log_z - brute_force_log_z(&ctx)).abs() < 1e-10);
            assert!((ctx.backward_log_norm() - log_z).abs() < 1e-10);
            for t in 0..3 {
                let total: f64 = (0..2).map(|y| ctx.state_marginal(t, y)).sum();
                assert!((total - 1.0).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_listed_transition_far_below_default() {
        // only a->b is listed, and its potential is e^-40 against the
        // default of 1 leaving a
        let mut store = ParamStore::new();
        store.add_new_state("a").unwrap();
        store.add_new_state("b").unwrap();
        let fa = store.add_edge_feature(0).unwrap();
        store.update_param(1, fa, 1.0).unwrap();
        store.finalize().unwrap();
        let weights = [-40.0];

        for backpointers in [true, false] {
            store.build_edge_index(backpointers).unwrap();
            let edges = store.edge_index().unwrap();
            let mut ctx = ChainContext::new(Flag::ALL, 2, 2);
            ctx.set_num_items(2);
            ctx.state[[0, 1]] = -50.0;
            ctx.state[[1, 0]] = -50.0;
            ctx.set_transitions(edges, &weights);
            ctx.exp_factors();
            let log_z = ctx.forward(edges);
            ctx.backward(edges);

            let mut total = 0.0;
            for y0 in 0..2 {
                for y1 in 0..2 {
                    total += ctx.path_score(&[y0, y1]).exp();
                }
            }
            assert!((log_z - total.ln()).abs() < 1e-9, "log Z {}", log_z);
            assert!((ctx.backward_log_norm() - log_z).abs() < 1e-9);
            assert!(ctx.path_score(&[0, 1]) - log_z <= 0.0);
        }
    }

    #[test]
    fn test_sparse_matches_dense_on_long_chains() {
        let mut store = ParamStore::new();
        for name in ["a", "b", "c"] {
            store.add_new_state(name).unwrap();
        }
        for (prev, next) in [(0, 1), (1, 2), (2, 0)] {
            let f = store.add_edge_feature(prev).unwrap();
            store.update_param(next, f, 1.0).unwrap();
        }
        store.finalize().unwrap();
        let weights = vec![-35.0; store.n_weight()];
        let t_len = 3000;

        let mut results = Vec::new();
        for backpointers in [true, false] {
            store.build_edge_index(backpointers).unwrap();
            let edges = store.edge_index().unwrap();
            let mut ctx = ChainContext::new(Flag::ALL, 3, t_len);
            ctx.set_num_items(t_len);
            for t in 0..t_len {
                ctx.state[[t, (t + 1) % 3]] = -45.0;
                ctx.state[[t, (t + 2) % 3]] = -45.0;
            }
            ctx.set_transitions(edges, &weights);
            ctx.exp_factors();
            let log_z = ctx.forward(edges);
            ctx.backward(edges);
            assert!(ctx.backward_log_norm().is_finite());
            assert!((ctx.backward_log_norm() - log_z).abs() < 1e-6 * log_z.abs().max(1.0));
            results.push(log_z);
        }
        assert!((results[0] - results[1]).abs() < 1e-6 * results[1].abs().max(1.0));
    }

    #[test]
    fn test_viterbi_is_best_path() {
        let (mut store, weights) = fixture();
        store.build_edge_index(true).unwrap();
        let edges = store.edge_index().unwrap();
        let mut ctx = ChainContext::new(Flag::ALL, 2, 3);
        load(&mut ctx, edges, &weights);
        let (labels, score) = ctx.viterbi();
        assert!((ctx.path_score(&labels) - score).abs() < 1e-12);
        for y0 in 0..2 {
            for y1 in 0..2 {
                for y2 in 0..2 {
                    assert!(ctx.path_score(&[y0, y1, y2]) <= score + 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_viterbi_ties_pick_lowest_label() {
        let (mut store, _) = fixture();
        store.build_edge_index(true).unwrap();
        let edges = store.edge_index().unwrap();
        let mut ctx = ChainContext::new(Flag::VITERBI, 2, 2);
        ctx.set_num_items(2);
        ctx.set_transitions(edges, &[0.0, 0.0]);
        let (labels, score) = ctx.viterbi();
        assert_eq!(labels, vec![0, 0]);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_transition_expectations_sum_to_positions() {
        let (mut store, weights) = fixture();
        store.build_tied_index(2.0).unwrap();
        let mut weights = weights;
        weights.resize(store.n_weight(), 0.0);
        let edges = store.edge_index().unwrap();
        let mut ctx = ChainContext::new(Flag::ALL, 2, 3);
        load(&mut ctx, edges, &weights);
        ctx.forward(edges);
        ctx.backward(edges);
        let mut grad = vec![0.0; store.n_weight()];
        ctx.accumulate_transitions(edges, &mut grad, 1.0);
        // every transition is either listed or folded into a remainder
        let total: f64 = grad.iter().sum();
        assert!((total - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_forbidden_labels_have_zero_mass() {
        let (mut store, weights) = fixture();
        store.build_edge_index(true).unwrap();
        let edges = store.edge_index().unwrap();
        let mut ctx = ChainContext::new(Flag::ALL, 2, 2);
        ctx.set_num_items(2);
        ctx.state[[1, 1]] = f64::NEG_INFINITY;
        ctx.set_transitions(edges, &weights);
        ctx.exp_factors();
        let log_z = ctx.forward(edges);
        ctx.backward(edges);
        assert!(log_z.is_finite());
        assert_eq!(ctx.state_marginal(1, 1), 0.0);
        assert!((ctx.state_marginal(1, 0) - 1.0).abs() < 1e-12);

        ctx.state[[1, 0]] = f64::NEG_INFINITY;
        ctx.exp_factors();
        assert_eq!(ctx.forward(edges), f64::NEG_INFINITY);
    }
}
