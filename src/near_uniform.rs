// near_uniform.rs
//
// Near-uniform factorization of the Hamiltonian's column distribution: the
// occupied pair is drawn uniformly, the virtual irrep pair by the weights of
// the symmetry-allowed choices, and the virtual orbitals uniformly within
// the chosen irrep pair. Every sampler returns the exact proposal
// probability of each draw; draws with no allowed virtuals are null and are
// dropped from the output.

use ndarray::Array2;
use rand::Rng;

use crate::symm::{
    count_sing_allowed, count_sing_virt, symm_pair_wt, virt_from_idx, VirtCounts,
};
use crate::N_IRREPS;

/// Draw from a binomial(n, p) distribution by counting successes. Used to
/// split walkers between double and single proposals.
pub fn bin_sample(n: u32, p: f64, rng: &mut impl Rng) -> u32 {
    let mut successes = 0;
    for _ in 0..n {
        if rng.gen_range(0.0..1.0) < p {
            successes += 1;
        }
    }
    successes
}

/// Multinomial sampling of double excitations from one determinant.
/// Writes up to `n_samp` records [i, j, a, b] (i < j; same-spin virtuals
/// sorted, opposite-spin with the up orbital first) and their proposal
/// probabilities. Returns the number of non-null samples.
/// # Arguments:
///     `det`: origin determinant.
///     `occ_orbs`: its occupied-orbital list.
///     `n_orb`: number of unfrozen spatial orbitals.
///     `lookup`: irrep lookup table.
///     `orb_symm`: irrep of each spatial orbital.
///     `virt_counts`: unoccupied orbitals per (irrep, spin).
///     `n_samp`: number of draws.
#[allow(clippy::too_many_arguments)]
pub fn doub_multin(
    det: &[u8],
    occ_orbs: &[u8],
    n_orb: u32,
    lookup: &Array2<u8>,
    orb_symm: &[u8],
    virt_counts: &VirtCounts,
    n_samp: u32,
    rng: &mut impl Rng,
    chosen_orbs: &mut [[u8; 4]],
    prob_vec: &mut [f64],
) -> usize {
    let n_elec = occ_orbs.len();
    let n_pairs = n_elec * (n_elec - 1) / 2;
    let mut n_valid = 0;

    for _ in 0..n_samp {
        let pair_idx = rng.gen_range(0..n_pairs);
        let mut choice = [pair_idx as u8, 0];
        let mut weights = [0.0f64; N_IRREPS];
        let mut counts = [0u32; N_IRREPS];
        symm_pair_wt(
            occ_orbs,
            orb_symm,
            n_orb,
            virt_counts,
            &mut choice,
            &mut weights,
            &mut counts,
        );
        let [i_orb, j_orb] = choice;
        let s_i = i_orb as u32 / n_orb;
        let s_j = j_orb as u32 / n_orb;
        let same_spin = s_i == s_j;
        let xor_symm = orb_symm[(i_orb as u32 % n_orb) as usize]
            ^ orb_symm[(j_orb as u32 % n_orb) as usize];

        // Choose the irrep of the first virtual by its weight.
        let r = rng.gen_range(0.0..1.0);
        let mut cum = 0.0;
        let mut chosen_irrep = None;
        for g in 0..N_IRREPS {
            cum += weights[g];
            if r < cum {
                chosen_irrep = Some(g);
                break;
            }
        }
        // No symmetry-allowed virtual pair exists: null draw.
        let Some(g) = chosen_irrep else { continue };
        let h = g ^ xor_symm as usize;

        // Choose an ordered virtual pair uniformly within the irrep pair.
        let pair_choice = rng.gen_range(0..counts[g]);
        let m_h = virt_counts[h][s_j as usize];
        let (a_idx, b_idx) = if same_spin && g == h {
            let a_idx = pair_choice / (m_h - 1);
            let mut b_idx = pair_choice % (m_h - 1);
            if b_idx >= a_idx {
                b_idx += 1;
            }
            (a_idx, b_idx)
        } else {
            (pair_choice / m_h, pair_choice % m_h)
        };
        let g_row = lookup.row(g);
        let h_row = lookup.row(h);
        let a = virt_from_idx(
            det,
            g_row.to_slice().expect("row-major lookup"),
            (s_i * n_orb) as u8,
            a_idx,
        )
        .expect("virtual count guarantees existence");
        let b = virt_from_idx(
            det,
            h_row.to_slice().expect("row-major lookup"),
            (s_j * n_orb) as u8,
            b_idx,
        )
        .expect("virtual count guarantees existence");

        let (a, b) = if a < b { (a, b) } else { (b, a) };
        chosen_orbs[n_valid] = [i_orb, j_orb, a, b];
        // Same-spin pairs are reachable through two ordered draws.
        let orderings = if same_spin { 2.0 } else { 1.0 };
        prob_vec[n_valid] = orderings * weights[g] / counts[g] as f64 / n_pairs as f64;
        n_valid += 1;
    }
    n_valid
}

/// Multinomial sampling of single excitations from one determinant: a
/// uniform choice among symmetry-allowed occupied orbitals followed by a
/// uniform choice among the virtuals sharing its irrep and spin. Returns
/// the number of non-null samples.
#[allow(clippy::too_many_arguments)]
pub fn sing_multin(
    det: &[u8],
    occ_orbs: &[u8],
    n_orb: u32,
    lookup: &Array2<u8>,
    orb_symm: &[u8],
    virt_counts: &VirtCounts,
    n_samp: u32,
    rng: &mut impl Rng,
    chosen_orbs: &mut [[u8; 2]],
    prob_vec: &mut [f64],
) -> usize {
    let n_allowed = count_sing_allowed(occ_orbs, orb_symm, n_orb, virt_counts);
    if n_allowed == 0 {
        return 0;
    }
    let mut n_valid = 0;
    for _ in 0..n_samp {
        let mut occ_choice = rng.gen_range(0..n_allowed) as u8;
        let n_virt = count_sing_virt(occ_orbs, orb_symm, n_orb, virt_counts, &mut occ_choice);
        let o_orb = occ_choice;
        let spin_shift = (o_orb as u32 / n_orb * n_orb) as u8;
        let irrep = orb_symm[(o_orb as u32 % n_orb) as usize] as usize;
        let virt_idx = rng.gen_range(0..n_virt);
        let row = lookup.row(irrep);
        let a = virt_from_idx(
            det,
            row.to_slice().expect("row-major lookup"),
            spin_shift,
            virt_idx,
        )
        .expect("virtual count guarantees existence");
        chosen_orbs[n_valid] = [o_orb, a];
        prob_vec[n_valid] = 1.0 / (n_allowed as f64 * n_virt as f64);
        n_valid += 1;
    }
    n_valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{find_bits, gen_hf_bitstring};
    use crate::symm::{count_symm_virt, doub_ex_symm, gen_symm_lookup, sing_ex_symm};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    #[test]
    fn binomial_split_has_correct_mean() {
        let mut rng = SmallRng::seed_from_u64(3);
        let n_iter = 5000;
        let mut acc = 0u64;
        for _ in 0..n_iter {
            acc += bin_sample(40, 0.3, &mut rng) as u64;
        }
        let mean = acc as f64 / n_iter as f64;
        assert!((mean - 12.0).abs() < 0.2, "mean {}", mean);
    }

    #[test]
    fn double_sampler_marginals_match_reported_probabilities() {
        let n_orb = 5u32;
        let n_elec = 4u32;
        let symm = [0u8, 1, 0, 1, 0];
        let lookup = gen_symm_lookup(&symm);
        let mut det = vec![0u8; crate::ceil_bytes(2 * n_orb)];
        gen_hf_bitstring(n_orb, n_elec, &mut det);
        let mut occ = vec![0u8; n_elec as usize];
        find_bits(&det, &mut occ);
        let counts = count_symm_virt(&occ, n_orb, &lookup, &symm);

        // Reference set of allowed excitations.
        let mut allowed = vec![[0u8; 4]; 1000];
        let n_allowed = doub_ex_symm(&det, &occ, n_orb, &mut allowed, &symm);
        let allowed: Vec<[u8; 4]> = allowed[..n_allowed].to_vec();

        let mut rng = SmallRng::seed_from_u64(99);
        let n_draws = 200_000u32;
        let mut chosen = vec![[0u8; 4]; n_draws as usize];
        let mut probs = vec![0.0f64; n_draws as usize];
        let n_valid = doub_multin(
            &det, &occ, n_orb, &lookup, &symm, &counts, n_draws, &mut rng, &mut chosen, &mut probs,
        );
        assert!(n_valid > 0);

        let mut freq: HashMap<[u8; 4], (usize, f64)> = HashMap::new();
        for samp in 0..n_valid {
            let entry = freq.entry(chosen[samp]).or_insert((0, probs[samp]));
            entry.0 += 1;
            assert!(
                (entry.1 - probs[samp]).abs() < 1e-12,
                "inconsistent probability for one excitation"
            );
        }
        for (ex, (count, prob)) in &freq {
            assert!(allowed.contains(ex), "sampled {:?} is not a valid excitation", ex);
            let empirical = *count as f64 / n_draws as f64;
            assert!(
                (empirical - prob).abs() < 5e-3,
                "{:?}: empirical {} vs reported {}",
                ex,
                empirical,
                prob
            );
        }
    }

    #[test]
    fn single_sampler_marginals_match_reported_probabilities() {
        let n_orb = 5u32;
        let n_elec = 4u32;
        let symm = [0u8, 1, 0, 1, 0];
        let lookup = gen_symm_lookup(&symm);
        let mut det = vec![0u8; crate::ceil_bytes(2 * n_orb)];
        gen_hf_bitstring(n_orb, n_elec, &mut det);
        let mut occ = vec![0u8; n_elec as usize];
        find_bits(&det, &mut occ);
        let counts = count_symm_virt(&occ, n_orb, &lookup, &symm);

        let mut allowed = vec![[0u8; 2]; 100];
        let n_allowed = sing_ex_symm(&det, &occ, n_orb, &mut allowed, &symm);
        let allowed: Vec<[u8; 2]> = allowed[..n_allowed].to_vec();

        let mut rng = SmallRng::seed_from_u64(4);
        let n_draws = 100_000u32;
        let mut chosen = vec![[0u8; 2]; n_draws as usize];
        let mut probs = vec![0.0f64; n_draws as usize];
        let n_valid = sing_multin(
            &det, &occ, n_orb, &lookup, &symm, &counts, n_draws, &mut rng, &mut chosen, &mut probs,
        );

        let mut freq: HashMap<[u8; 2], (usize, f64)> = HashMap::new();
        for samp in 0..n_valid {
            let entry = freq.entry(chosen[samp]).or_insert((0, probs[samp]));
            entry.0 += 1;
        }
        for (ex, (count, prob)) in &freq {
            assert!(allowed.contains(ex), "sampled {:?} is invalid", ex);
            let empirical = *count as f64 / n_draws as f64;
            assert!(
                (empirical - prob).abs() < 5e-3,
                "{:?}: empirical {} vs reported {}",
                ex,
                empirical,
                prob
            );
        }
    }
}
