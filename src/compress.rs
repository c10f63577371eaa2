// compress.rs
//
// Stochastic vector compression in the FRI framework. One compression is
// two stages: `find_preserve` keeps every element whose magnitude already
// exceeds the remaining norm divided by the remaining sample budget, then
// `sys_comp` resamples the rest systematically with a single random number
// broadcast from rank 0. `comp_sub` is the factored variant used when the
// matrix-vector product is split into a chain of sub-sampling steps. All
// cross-process coordination happens through the Comm interface, so every
// routine here also runs single-process.

use ndarray::{ArrayView2, ArrayViewMut2};
use rand::Rng;

use crate::comm::Comm;

/// Round a real number to an integer stochastically: `floor(p) * n` plus a
/// binomial draw on the fractional part, so the expectation is `p * n`.
pub fn round_binomially(p: f64, n: u32, rng: &mut impl Rng) -> i32 {
    let flr = p.floor();
    let prob = p - flr;
    let mut ret_val = flr as i32 * n as i32;
    for _ in 0..n {
        if rng.gen_range(0.0..1.0) < prob {
            ret_val += 1;
        }
    }
    ret_val
}

fn sift_down(values: &[f64], srt_idx: &mut [usize], start: usize, end: usize) {
    let mut root = start;
    loop {
        let child = 2 * root + 1;
        if child > end {
            return;
        }
        let mut swap = root;
        if values[srt_idx[swap]].abs() < values[srt_idx[child]].abs() {
            swap = child;
        }
        if child + 1 <= end && values[srt_idx[swap]].abs() < values[srt_idx[child + 1]].abs() {
            swap = child + 1;
        }
        if swap == root {
            return;
        }
        srt_idx.swap(root, swap);
        root = swap;
    }
}

fn heapify(values: &[f64], srt_idx: &mut [usize], count: usize) {
    if count < 2 {
        return;
    }
    let mut start = (count - 2) / 2;
    loop {
        sift_down(values, srt_idx, start, count - 1);
        if start == 0 {
            return;
        }
        start -= 1;
    }
}

/// Mark for exact preservation every element whose magnitude is at least the
/// remaining one-norm divided by the remaining sample budget. The global
/// one-norm is re-synchronised across processes on every pass because the
/// threshold depends on it; the loop ends when no process preserved
/// anything.
/// # Arguments:
///     `values`: local element values.
///     `srt_idx`: scratch permutation of 0..values.len(), heapified here.
///     `keep_idx`: output preservation mask.
///     `n_samp`: in: target sample count; out: remaining budget for the
///     systematic stage.
/// Returns (local residual one-norm of un-kept elements, global one-norm of
/// the input).
pub fn find_preserve(
    values: &[f64],
    srt_idx: &mut [usize],
    keep_idx: &mut [bool],
    n_samp: &mut u32,
    comm: &dyn Comm,
) -> (f64, f64) {
    let count = values.len();
    let mut loc_one_norm: f64 = values.iter().map(|v| v.abs()).sum();
    let global_norm = comm.sum_f64(loc_one_norm);
    let mut heap_count = count;
    heapify(values, srt_idx, heap_count);

    let mut glob_one_norm = global_norm;
    let mut glob_sampled = 1i64;
    while glob_sampled > 0 {
        glob_one_norm = comm.sum_f64(loc_one_norm);
        let mut loc_sampled = 0i64;
        let mut keep_going = true;
        while keep_going && heap_count > 0 {
            let budget = *n_samp as i64 - loc_sampled;
            let max_idx = srt_idx[0];
            let el_magn = values[max_idx].abs();
            if budget > 0 && el_magn >= glob_one_norm / budget as f64 {
                keep_idx[max_idx] = true;
                loc_sampled += 1;
                loc_one_norm -= el_magn;
                glob_one_norm -= el_magn;

                heap_count -= 1;
                if heap_count > 0 {
                    srt_idx[0] = srt_idx[heap_count];
                    srt_idx[heap_count] = max_idx;
                    sift_down(values, srt_idx, 0, heap_count - 1);
                } else {
                    keep_going = false;
                }
            } else {
                keep_going = false;
            }
        }
        glob_sampled = comm.sum_i64(loc_sampled);
        *n_samp = (*n_samp as i64 - glob_sampled).max(0) as u32;
    }

    let mut loc_residual = 0.0;
    if glob_one_norm < 1e-9 {
        *n_samp = 0;
    } else {
        for (idx, val) in values.iter().enumerate() {
            if !keep_idx[idx] {
                loc_residual += val.abs();
            }
        }
    }
    (loc_residual, global_norm)
}

/// Shift the systematic random number into this process' slab of the global
/// norm interval and return the slab's lower bound.
fn seed_sys(loc_norms: &[f64], rn: &mut f64, n_samp: u32, rank: usize) -> f64 {
    let lbound: f64 = loc_norms[..rank].iter().sum();
    let global_norm: f64 = lbound + loc_norms[rank..].iter().sum::<f64>();
    let step = global_norm / n_samp as f64;
    *rn *= step;
    *rn += step * (lbound / step).floor();
    if *rn < lbound {
        *rn += step;
    }
    lbound
}

/// Systematic (low-variance) resampling of the un-preserved elements across
/// all processes. Exact-keep entries pass through with their flag cleared;
/// every other nonzero entry either becomes `±global_norm / n_samp` or is
/// zeroed with its flag set so the caller can delete the position.
/// # Arguments:
///     `vec_vals`: local values, modified in place.
///     `loc_norms`: per-process residual norms from `find_preserve`; on
///     return holds the per-process norms of the output.
///     `n_samp`: number of systematic samples to draw globally.
///     `keep_exact`: preservation mask from `find_preserve`.
///     `rand_num`: systematic random number in [0, 1), used as broadcast
///     from rank 0.
pub fn sys_comp(
    vec_vals: &mut [f64],
    loc_norms: &mut [f64],
    n_samp: u32,
    keep_exact: &mut [bool],
    rand_num: f64,
    comm: &dyn Comm,
) {
    let rank = comm.rank();
    let mut rn_sys = rand_num;
    comm.bcast_f64(&mut rn_sys);
    let tmp_glob_norm: f64 = loc_norms.iter().sum();

    let mut lbound;
    if n_samp > 0 {
        lbound = seed_sys(loc_norms, &mut rn_sys, n_samp, rank);
    } else {
        lbound = 0.0;
        rn_sys = f64::INFINITY;
    }
    let samp_val = tmp_glob_norm / n_samp.max(1) as f64;

    let mut my_norm = 0.0;
    for (idx, val) in vec_vals.iter_mut().enumerate() {
        if keep_exact[idx] {
            my_norm += val.abs();
            keep_exact[idx] = false;
        } else if *val != 0.0 {
            lbound += val.abs();
            if rn_sys < lbound {
                *val = samp_val * val.signum();
                my_norm += samp_val;
                rn_sys += samp_val;
            } else {
                *val = 0.0;
                keep_exact[idx] = true;
            }
        }
    }
    comm.allgather_f64(my_norm, loc_norms);
}

/// Exact-keep pass of the factored compression. Rows with `n_div[i] > 0`
/// split uniformly into `n_div[i]` pieces; other rows split by their
/// sub-weight vector. Whole rows and individual sub-weights above the
/// preservation threshold are marked in `keep_idx`; `wt_remain` receives
/// each row's un-kept weight. A final re-scan (`last_pass`) catches
/// sub-weights that became large relative to the shrunken residual norm.
/// Returns the local residual norm.
pub fn find_keep_sub(
    values: &[f64],
    n_div: &[u32],
    sub_weights: ArrayView2<f64>,
    keep_idx: &mut ArrayViewMut2<bool>,
    sub_sizes: Option<&[u16]>,
    n_samp: &mut u32,
    wt_remain: &mut [f64],
    comm: &dyn Comm,
) -> f64 {
    let count = values.len();
    let mut loc_one_norm = 0.0;
    for idx in 0..count {
        loc_one_norm += values[idx];
        wt_remain[idx] = values[idx];
    }

    let mut glob_one_norm = 0.0;
    let mut glob_sampled = 1i64;
    let mut last_pass = false;
    while glob_sampled > 0 {
        glob_one_norm = comm.sum_f64(loc_one_norm);
        if glob_one_norm < 0.0 {
            break;
        }
        let mut loc_sampled = 0i64;
        'rows: for det_idx in 0..count {
            let el_magn = values[det_idx];
            let budget = (*n_samp as i64 - loc_sampled).max(1) as f64;
            let mut keep_thresh = glob_one_norm / budget;
            if el_magn < keep_thresh {
                continue;
            }
            if n_div[det_idx] > 0 {
                let divisor = n_div[det_idx] as f64;
                if el_magn / divisor >= keep_thresh && !keep_idx[(det_idx, 0)] {
                    keep_idx[(det_idx, 0)] = true;
                    wt_remain[det_idx] = 0.0;
                    loc_sampled += n_div[det_idx] as i64;
                    loc_one_norm -= el_magn;
                    glob_one_norm -= el_magn;
                    if glob_one_norm < 0.0 {
                        break 'rows;
                    }
                }
            } else {
                let mut sub_remain = 0.0;
                let n_sub = match sub_sizes {
                    Some(sizes) => sizes[det_idx] as usize,
                    None => sub_weights.ncols(),
                };
                for sub_idx in 0..n_sub {
                    if keep_idx[(det_idx, sub_idx)] {
                        continue;
                    }
                    let sub_magn = el_magn * sub_weights[(det_idx, sub_idx)];
                    if sub_magn >= keep_thresh && sub_magn.abs() > 1e-10 {
                        keep_idx[(det_idx, sub_idx)] = true;
                        loc_sampled += 1;
                        loc_one_norm -= sub_magn;
                        glob_one_norm -= sub_magn;
                        if glob_one_norm < 0.0 {
                            wt_remain[det_idx] = sub_remain;
                            break 'rows;
                        }
                        let budget = (*n_samp as i64 - loc_sampled).max(1) as f64;
                        keep_thresh = glob_one_norm / budget;
                    } else {
                        sub_remain += sub_magn;
                    }
                }
                wt_remain[det_idx] = sub_remain;
            }
        }
        glob_sampled = comm.sum_i64(loc_sampled);
        *n_samp = (*n_samp as i64 - glob_sampled).max(0) as u32;

        if last_pass && glob_sampled > 0 {
            last_pass = false;
        }
        if glob_sampled == 0 && !last_pass {
            // One more sweep over the remainders; shrinking the norm may
            // have pushed further sub-weights over the threshold.
            last_pass = true;
            glob_sampled = 1;
            loc_one_norm = wt_remain.iter().sum();
        }
    }

    if *n_samp == 0 || glob_one_norm / *n_samp as f64 < 1e-8 {
        *n_samp = 0;
        0.0
    } else {
        wt_remain.iter().sum()
    }
}

/// Systematic resampling stage of the factored compression. Emits one
/// `(row, sub)` pair per surviving draw into `new_idx` / `new_vals`:
/// exact-keep entries with their exact weights, resampled entries with
/// magnitude `global_norm / n_samp`. Returns the number of emitted entries.
#[allow(clippy::too_many_arguments)]
pub fn sys_sub(
    values: &[f64],
    n_div: &[u32],
    sub_weights: ArrayView2<f64>,
    keep_idx: &mut ArrayViewMut2<bool>,
    sub_sizes: Option<&[u16]>,
    n_samp: u32,
    wt_remain: &[f64],
    loc_norms: &mut [f64],
    rand_num: f64,
    new_vals: &mut [f64],
    new_idx: &mut [(usize, usize)],
    comm: &dyn Comm,
) -> usize {
    let rank = comm.rank();
    let mut rn_sys = rand_num;
    comm.bcast_f64(&mut rn_sys);
    let tmp_glob_norm: f64 = loc_norms.iter().sum();

    let mut lbound;
    if n_samp > 0 {
        lbound = seed_sys(loc_norms, &mut rn_sys, n_samp, rank);
    } else {
        lbound = 0.0;
        rn_sys = f64::INFINITY;
    }
    let samp_val = tmp_glob_norm / n_samp.max(1) as f64;

    let mut my_norm = 0.0;
    let mut num_new = 0;
    for wt_idx in 0..values.len() {
        let tmp_val = values[wt_idx];
        lbound += wt_remain[wt_idx];
        if n_div[wt_idx] > 0 {
            if keep_idx[(wt_idx, 0)] {
                keep_idx[(wt_idx, 0)] = false;
                for sub_idx in 0..n_div[wt_idx] as usize {
                    new_vals[num_new] = tmp_val / n_div[wt_idx] as f64;
                    new_idx[num_new] = (wt_idx, sub_idx);
                    num_new += 1;
                }
                my_norm += tmp_val;
            } else if tmp_val != 0.0 {
                while rn_sys < lbound {
                    let sub_idx = ((lbound - rn_sys) * n_div[wt_idx] as f64 / tmp_val) as usize;
                    new_vals[num_new] = samp_val;
                    new_idx[num_new] = (wt_idx, sub_idx.min(n_div[wt_idx] as usize - 1));
                    num_new += 1;
                    rn_sys += samp_val;
                    my_norm += samp_val;
                }
            }
        } else if wt_remain[wt_idx] < tmp_val || rn_sys < lbound {
            // Some sub-weights were kept exactly, or a sample lands in this
            // row's remainder interval.
            my_norm += tmp_val - wt_remain[wt_idx];
            let mut sub_lbound = lbound - wt_remain[wt_idx];
            let n_sub = match sub_sizes {
                Some(sizes) => sizes[wt_idx] as usize,
                None => sub_weights.ncols(),
            };
            for sub_idx in 0..n_sub {
                if keep_idx[(wt_idx, sub_idx)] {
                    keep_idx[(wt_idx, sub_idx)] = false;
                    new_vals[num_new] = tmp_val * sub_weights[(wt_idx, sub_idx)];
                    new_idx[num_new] = (wt_idx, sub_idx);
                    num_new += 1;
                } else {
                    sub_lbound += tmp_val * sub_weights[(wt_idx, sub_idx)];
                    if rn_sys < sub_lbound {
                        new_vals[num_new] = samp_val;
                        new_idx[num_new] = (wt_idx, sub_idx);
                        num_new += 1;
                        my_norm += samp_val;
                        rn_sys += samp_val;
                    }
                }
            }
        }
    }
    loc_norms[rank] = my_norm;
    num_new
}

/// One factored compression: broadcast the systematic random number, run
/// the exact-keep pass, synchronise per-process residual norms, and
/// resample. Returns the number of surviving `(row, sub)` draws.
#[allow(clippy::too_many_arguments)]
pub fn comp_sub(
    values: &[f64],
    n_div: &[u32],
    sub_weights: ArrayView2<f64>,
    keep_idx: &mut ArrayViewMut2<bool>,
    sub_sizes: Option<&[u16]>,
    n_samp: u32,
    wt_remain: &mut [f64],
    rand_num: f64,
    new_vals: &mut [f64],
    new_idx: &mut [(usize, usize)],
    comm: &dyn Comm,
) -> usize {
    assert_eq!(
        keep_idx.ncols(),
        sub_weights.ncols(),
        "column dimension of sub_weights must equal column dimension of keep_idx"
    );
    let mut rn_sys = rand_num;
    comm.bcast_f64(&mut rn_sys);

    let mut tmp_nsamp = n_samp;
    let loc_norm = find_keep_sub(
        values,
        n_div,
        sub_weights,
        keep_idx,
        sub_sizes,
        &mut tmp_nsamp,
        wt_remain,
        comm,
    );
    let mut loc_norms = vec![0.0f64; comm.n_procs()];
    comm.allgather_f64(loc_norm, &mut loc_norms);
    sys_sub(
        values,
        n_div,
        sub_weights,
        keep_idx,
        sub_sizes,
        tmp_nsamp,
        wt_remain,
        &mut loc_norms,
        rn_sys,
        new_vals,
        new_idx,
        comm,
    )
}

/// Logarithmic shift update toward a target one-norm. Inactive until the
/// norm first exceeds `target_norm`.
pub fn adjust_shift(
    shift: &mut f64,
    one_norm: f64,
    last_norm: &mut f64,
    target_norm: f64,
    damp_factor: f64,
) {
    if *last_norm != 0.0 {
        *shift -= damp_factor * (one_norm / *last_norm).ln();
        *last_norm = one_norm;
    }
    if *last_norm == 0.0 && one_norm > target_norm {
        *last_norm = one_norm;
    }
}

/// Build Walker's alias table for O(1) categorical sampling.
/// # Arguments:
///     `probs`: normalized probabilities.
///     `aliases`: output alias index per state.
///     `alias_probs`: output acceptance threshold per state.
pub fn setup_alias(probs: &[f64], aliases: &mut [u32], alias_probs: &mut [f64]) {
    let n_states = probs.len();
    let mut smaller = Vec::with_capacity(n_states);
    let mut bigger = Vec::with_capacity(n_states);
    for idx in 0..n_states {
        aliases[idx] = idx as u32;
        alias_probs[idx] = n_states as f64 * probs[idx];
        if alias_probs[idx] < 1.0 {
            smaller.push(idx);
        } else {
            bigger.push(idx);
        }
    }
    while let (Some(&small), Some(&big)) = (smaller.last(), bigger.last()) {
        aliases[small] = big as u32;
        alias_probs[big] += alias_probs[small] - 1.0;
        if alias_probs[big] < 1.0 {
            *smaller.last_mut().expect("nonempty") = big;
            bigger.pop();
        } else {
            smaller.pop();
        }
    }
}

/// Draw one state from an alias table.
pub fn sample_alias(aliases: &[u32], alias_probs: &[f64], rng: &mut impl Rng) -> usize {
    let n_states = aliases.len();
    let chosen = rng.gen_range(0..n_states);
    if rng.gen_range(0.0..1.0) < alias_probs[chosen] {
        chosen
    } else {
        aliases[chosen] as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use ndarray::Array2;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn find_preserve_keeps_dominant_elements() {
        let comm = SerialComm;
        let values = [0.05, -0.6, 0.1, 0.02, 0.23];
        let mut srt: Vec<usize> = (0..values.len()).collect();
        let mut keep = vec![false; values.len()];
        let mut n_samp = 2u32;
        let (residual, global) = find_preserve(&values, &mut srt, &mut keep, &mut n_samp, &comm);
        assert!((global - 1.0).abs() < 1e-12);
        // -0.6 dominates: 0.6 >= 1.0 / 2. After removing it the residual is
        // 0.4 and 0.23 >= 0.4 / 1 fails, so exactly one element is kept.
        assert_eq!(keep.iter().filter(|&&k| k).count(), 1);
        assert!(keep[1]);
        assert_eq!(n_samp, 1);
        assert!((residual - 0.4).abs() < 1e-12);
    }

    #[test]
    fn sys_comp_preserves_expected_value_and_support_bound() {
        let comm = SerialComm;
        let input = [0.10125, 0.05625, 0.0875, 0.03, 0.095, 0.05375, 0.095, 0.0875, 0.0625, 0.33125];
        let n_grid = 10_000usize;
        let mut mean = vec![0.0f64; input.len()];
        for grid_idx in 0..n_grid {
            let rn = grid_idx as f64 / n_grid as f64;
            let mut vals = input.to_vec();
            let mut srt: Vec<usize> = (0..vals.len()).collect();
            let mut keep = vec![false; vals.len()];
            let mut n_samp = 4u32;
            let (residual, _) = find_preserve(&vals, &mut srt, &mut keep, &mut n_samp, &comm);
            let n_kept = keep.iter().filter(|&&k| k).count();
            let mut loc_norms = vec![residual];
            sys_comp(&mut vals, &mut loc_norms, n_samp, &mut keep, rn, &comm);

            let support = vals.iter().filter(|v| **v != 0.0).count();
            assert!(support <= n_samp as usize + n_kept, "support bound violated");
            for (acc, v) in mean.iter_mut().zip(vals.iter()) {
                *acc += v / n_grid as f64;
            }
        }
        for (avg, exact) in mean.iter().zip(input.iter()) {
            assert!(
                (avg - exact).abs() < 1e-3,
                "compression biased: {} vs {}",
                avg,
                exact
            );
        }
    }

    #[test]
    fn comp_sub_preserves_expected_value() {
        let comm = SerialComm;
        // Two uniform-divisor rows and two sub-weighted rows.
        let values = [0.3, 0.1, 0.4, 0.2];
        let n_div = [2u32, 3, 0, 0];
        let mut subwt = Array2::<f64>::zeros((4, 3));
        subwt.row_mut(2).assign(&ndarray::arr1(&[0.5, 0.25, 0.25]));
        subwt.row_mut(3).assign(&ndarray::arr1(&[0.1, 0.6, 0.3]));

        let n_grid = 4000usize;
        let mut mean = Array2::<f64>::zeros((4, 3));
        for grid_idx in 0..n_grid {
            let rn = grid_idx as f64 / n_grid as f64;
            let mut keep = Array2::<bool>::default((4, 3));
            let mut wt_remain = [0.0f64; 4];
            let mut new_vals = [0.0f64; 64];
            let mut new_idx = [(0usize, 0usize); 64];
            let n_new = comp_sub(
                &values,
                &n_div,
                subwt.view(),
                &mut keep.view_mut(),
                None,
                5,
                &mut wt_remain,
                rn,
                &mut new_vals,
                &mut new_idx,
                &comm,
            );
            for samp in 0..n_new {
                let (row, sub) = new_idx[samp];
                mean[(row, sub)] += new_vals[samp] / n_grid as f64;
            }
        }
        for row in 0..4 {
            let n_sub = if n_div[row] > 0 { n_div[row] as usize } else { 3 };
            for sub in 0..n_sub {
                let exact = if n_div[row] > 0 {
                    values[row] / n_div[row] as f64
                } else {
                    values[row] * subwt[(row, sub)]
                };
                assert!(
                    (mean[(row, sub)] - exact).abs() < 5e-3,
                    "row {} sub {}: {} vs {}",
                    row,
                    sub,
                    mean[(row, sub)],
                    exact
                );
            }
        }
    }

    #[test]
    fn alias_method_reproduces_distribution() {
        let probs = [0.10125, 0.05625, 0.0875, 0.03, 0.095, 0.05375, 0.095, 0.0875, 0.0625, 0.33125];
        let mut aliases = [0u32; 10];
        let mut alias_probs = [0.0f64; 10];
        setup_alias(&probs, &mut aliases, &mut alias_probs);

        let mut rng = SmallRng::seed_from_u64(12);
        let n_iter = 100_000usize;
        let mut counts = [0usize; 10];
        for _ in 0..n_iter {
            counts[sample_alias(&aliases, &alias_probs, &mut rng)] += 1;
        }
        let max_diff = counts
            .iter()
            .zip(probs.iter())
            .map(|(&c, &p)| (c as f64 / n_iter as f64 - p).abs())
            .fold(0.0, f64::max);
        assert!(max_diff < 1e-3, "max deviation {}", max_diff);
    }

    #[test]
    fn shift_activates_after_target_norm() {
        let mut shift = 0.0;
        let mut last_norm = 0.0;
        // Below target: inactive.
        adjust_shift(&mut shift, 50.0, &mut last_norm, 100.0, 0.05);
        assert_eq!(shift, 0.0);
        assert_eq!(last_norm, 0.0);
        // Crossing the target arms the update.
        adjust_shift(&mut shift, 120.0, &mut last_norm, 100.0, 0.05);
        assert_eq!(last_norm, 120.0);
        // Growth now lowers the shift.
        adjust_shift(&mut shift, 150.0, &mut last_norm, 100.0, 0.05);
        assert!(shift < 0.0);
        assert_eq!(last_norm, 150.0);
    }

    #[test]
    fn binomial_rounding_is_exact_for_integers() {
        let mut rng = SmallRng::seed_from_u64(7);
        assert_eq!(round_binomially(3.0, 5, &mut rng), 15);
        assert_eq!(round_binomially(-2.0, 4, &mut rng), -8);
        // Fractional part averages to the expectation.
        let n_iter = 20_000;
        let mut acc = 0i64;
        for _ in 0..n_iter {
            acc += round_binomially(0.25, 1, &mut rng) as i64;
        }
        let mean = acc as f64 / n_iter as f64;
        assert!((mean - 0.25).abs() < 0.01, "mean {}", mean);
    }
}
