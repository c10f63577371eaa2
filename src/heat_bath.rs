// heat_bath.rs
//
// Heat-bath Power-Pitzer factorization of the double-excitation part of the
// Hamiltonian. The occupied pair is proposed from pair weights summed over
// the repulsion integrals; each virtual is proposed from the square root of
// its exchange integral with the occupied orbital it replaces. All tables
// are computed once from the integrals; the occupied-pair tables are
// determinant-independent, so the unnormalised variant can divide out
// global normalisers and absorb the determinant-dependent ones into the
// sampled weight, accepting zero-weight draws.

use ndarray::{Array2, ArrayView1};
use rand::Rng;

use crate::bits::read_bit;
use crate::compress::{sample_alias, setup_alias};
use crate::error::{FriError, Result};
use crate::HfData;

/// Hamiltonian factorization used to propose excitations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HDist {
    NearUniform,
    HeatBath,
    HeatBathUnnorm,
}

impl std::str::FromStr for HDist {
    type Err = FriError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NU" => Ok(HDist::NearUniform),
            "HB" => Ok(HDist::HeatBath),
            "HB_unnorm" => Ok(HDist::HeatBathUnnorm),
            other => Err(FriError::UnknownDistribution(other.to_string())),
        }
    }
}

/// Precomputed heat-bath tables over the active spatial orbitals.
pub struct HbInfo {
    n_orb: usize,
    /// Same-spin pair weights: sums over |antisymmetrised| integrals.
    d_same: Array2<f64>,
    /// Opposite-spin pair weights: sums over |integrals|.
    d_diff: Array2<f64>,
    /// First-electron weights, summed over all partner orbitals.
    s_tens: Vec<f64>,
    s_norm: f64,
    /// sqrt of exchange-integral magnitudes, the Power-Pitzer virtual
    /// proposal weights.
    exch_sqrt: Array2<f64>,
    exch_norms: Vec<f64>,
    /// Alias tables per occupied orbital for O(1) virtual draws.
    exch_aliases: Array2<u32>,
    exch_alias_probs: Array2<f64>,
}

/// Build the heat-bath tables from the repulsion integrals.
pub fn set_up(hf: &HfData) -> HbInfo {
    let n_orb = hf.n_orb as usize;
    let frz = (hf.n_frz / 2) as usize;
    let eris = &hf.eris;

    let mut d_same = Array2::<f64>::zeros((n_orb, n_orb));
    let mut d_diff = Array2::<f64>::zeros((n_orb, n_orb));
    for p in 0..n_orb {
        for q in 0..n_orb {
            let mut same = 0.0;
            let mut diff = 0.0;
            for r in 0..n_orb {
                for s in 0..n_orb {
                    let direct = eris[(p + frz, q + frz, r + frz, s + frz)];
                    diff += direct.abs();
                    if r < s {
                        let exch = eris[(p + frz, q + frz, s + frz, r + frz)];
                        same += (direct - exch).abs();
                    }
                }
            }
            if p != q {
                d_same[(p, q)] = same;
            }
            d_diff[(p, q)] = diff;
        }
    }

    let mut s_tens = vec![0.0f64; n_orb];
    for p in 0..n_orb {
        s_tens[p] = (0..n_orb).map(|q| d_same[(p, q)] + d_diff[(p, q)]).sum();
    }
    let s_norm = s_tens.iter().sum();

    let mut exch_sqrt = Array2::<f64>::zeros((n_orb, n_orb));
    let mut exch_norms = vec![0.0f64; n_orb];
    for p in 0..n_orb {
        for a in 0..n_orb {
            exch_sqrt[(p, a)] = eris[(p + frz, a + frz, a + frz, p + frz)].abs().sqrt();
        }
        exch_norms[p] = exch_sqrt.row(p).sum();
    }

    let mut exch_aliases = Array2::<u32>::zeros((n_orb, n_orb));
    let mut exch_alias_probs = Array2::<f64>::zeros((n_orb, n_orb));
    for p in 0..n_orb {
        if exch_norms[p] == 0.0 {
            continue;
        }
        let probs: Vec<f64> = (0..n_orb).map(|a| exch_sqrt[(p, a)] / exch_norms[p]).collect();
        let mut aliases = vec![0u32; n_orb];
        let mut alias_probs = vec![0.0f64; n_orb];
        setup_alias(&probs, &mut aliases, &mut alias_probs);
        for a in 0..n_orb {
            exch_aliases[(p, a)] = aliases[a];
            exch_alias_probs[(p, a)] = alias_probs[a];
        }
    }

    HbInfo {
        n_orb,
        d_same,
        d_diff,
        s_tens,
        s_norm,
        exch_sqrt,
        exch_norms,
        exch_aliases,
        exch_alias_probs,
    }
}

impl HbInfo {
    fn spatial(&self, orb: u8) -> usize {
        orb as usize % self.n_orb
    }

    fn spin(&self, orb: u8) -> usize {
        orb as usize / self.n_orb
    }

    fn pair_wt(&self, o1: u8, o2: u8) -> f64 {
        let p = self.spatial(o1);
        let q = self.spatial(o2);
        if self.spin(o1) == self.spin(o2) {
            self.d_same[(p, q)]
        } else {
            self.d_diff[(p, q)]
        }
    }

    /// Fill the first-occupied sub-weights for one determinant and return
    /// the ratio of their sum to the global normaliser (the factor the
    /// unnormalised variant folds into the sampled weight).
    pub fn calc_o1_probs(&self, occ: &[u8], subwt: &mut [f64]) -> f64 {
        let mut tot = 0.0;
        for (e, &orb) in occ.iter().enumerate() {
            subwt[e] = self.s_tens[self.spatial(orb)];
            tot += subwt[e];
        }
        if tot > 0.0 {
            subwt[..occ.len()].iter_mut().for_each(|w| *w /= tot);
        }
        tot / self.s_norm
    }

    /// Fill the second-occupied sub-weights given the first choice. On
    /// input `o1_idx` holds the chosen electron index; on output the
    /// orbital itself.
    pub fn calc_o2_probs(&self, occ: &[u8], o1_idx: &mut u8, subwt: &mut [f64]) -> f64 {
        let e1 = *o1_idx as usize;
        let o1 = occ[e1];
        let mut tot = 0.0;
        for (e, &orb) in occ.iter().enumerate() {
            subwt[e] = if e == e1 { 0.0 } else { self.pair_wt(o1, orb) };
            tot += subwt[e];
        }
        if tot > 0.0 {
            subwt[..occ.len()].iter_mut().for_each(|w| *w /= tot);
        }
        *o1_idx = o1;
        let denom = self.s_tens[self.spatial(o1)];
        if denom > 0.0 {
            tot / denom
        } else {
            0.0
        }
    }

    /// Fill the first-virtual sub-weights (over spatial orbitals, occupied
    /// ones zeroed) for a chosen first occupied orbital.
    pub fn calc_u1_probs(&self, o1_orb: u8, det: &[u8], subwt: &mut [f64]) -> f64 {
        let p1 = self.spatial(o1_orb);
        let spin_shift = (self.spin(o1_orb) * self.n_orb) as u8;
        let mut tot = 0.0;
        for a in 0..self.n_orb {
            subwt[a] = if read_bit(det, a as u8 + spin_shift) {
                0.0
            } else {
                self.exch_sqrt[(p1, a)]
            };
            tot += subwt[a];
        }
        if tot > 0.0 {
            subwt[..self.n_orb].iter_mut().for_each(|w| *w /= tot);
        }
        if self.exch_norms[p1] > 0.0 {
            tot / self.exch_norms[p1]
        } else {
            0.0
        }
    }

    /// Fill the second-virtual sub-weights over the lookup-table row of the
    /// symmetry-forced irrep. Occupancy is not filtered here; an occupied
    /// final draw is a null event for the caller. Returns the weight ratio
    /// and the row length.
    pub fn calc_u2_probs(
        &self,
        orb_symm: &[u8],
        lookup: &Array2<u8>,
        o1_orb: u8,
        o2_orb: u8,
        u1_orb: u8,
        subwt: &mut [f64],
    ) -> (f64, u16) {
        let p2 = self.spatial(o2_orb);
        let u2_irrep = (orb_symm[self.spatial(o1_orb)]
            ^ orb_symm[self.spatial(o2_orb)]
            ^ orb_symm[self.spatial(u1_orb)]) as usize;
        let row = lookup.row(u2_irrep);
        let n_sub = row[0] as usize;
        let mut tot = 0.0;
        for k in 0..n_sub {
            let b_spatial = row[k + 1] as usize;
            subwt[k] = self.exch_sqrt[(p2, b_spatial)];
            tot += subwt[k];
        }
        if tot > 0.0 {
            subwt[..n_sub].iter_mut().for_each(|w| *w /= tot);
        }
        let ratio = if self.exch_norms[p2] > 0.0 {
            tot / self.exch_norms[p2]
        } else {
            0.0
        };
        (ratio, n_sub as u16)
    }

    /// Orderings of [i, j, a, b] through which the factored chain can reach
    /// the same excitation, respecting spin matching between each occupied
    /// orbital and the virtual replacing it.
    fn orderings(&self, orbs: &[u8; 4]) -> impl Iterator<Item = (u8, u8, u8, u8)> {
        let [i, j, a, b] = *orbs;
        let spin = |orb: u8, n_orb: usize| orb as usize / n_orb;
        let n_orb = self.n_orb;
        [(i, a, j, b), (j, b, i, a), (i, b, j, a), (j, a, i, b)]
            .into_iter()
            .filter(move |&(o1, u1, o2, u2)| {
                spin(o1, n_orb) == spin(u1, n_orb) && spin(o2, n_orb) == spin(u2, n_orb)
            })
    }

    /// Determinant-independent proposal weight of an excitation under the
    /// unnormalised variant, summed over all orderings of the factored
    /// chain.
    pub fn calc_unnorm_wt(&self, orbs: &[u8; 4]) -> f64 {
        if self.s_norm == 0.0 {
            return 0.0;
        }
        self.orderings(orbs)
            .map(|(o1, u1, o2, u2)| {
                let p1 = self.spatial(o1);
                let p2 = self.spatial(o2);
                if self.exch_norms[p1] == 0.0 || self.exch_norms[p2] == 0.0 {
                    return 0.0;
                }
                self.pair_wt(o1, o2) / self.s_norm
                    * (self.exch_sqrt[(p1, self.spatial(u1))] / self.exch_norms[p1])
                    * (self.exch_sqrt[(p2, self.spatial(u2))] / self.exch_norms[p2])
            })
            .sum()
    }

    /// Full proposal probability of an excitation under the normalised
    /// variant, with every conditional renormalised exactly as the sampling
    /// chain does it.
    pub fn calc_norm_wt(
        &self,
        orbs: &[u8; 4],
        occ: &[u8],
        det: &[u8],
        lookup: &Array2<u8>,
        orb_symm: &[u8],
    ) -> f64 {
        self.path_prob(orbs, occ, det, lookup, orb_symm, true)
    }

    /// Shared proposal-probability computation. `u1_over_unocc` selects the
    /// normalisation of the first virtual: over unoccupied orbitals (the
    /// systematic chain) or over the whole exchange row (the multinomial
    /// sampler, which treats occupied draws as nulls).
    fn path_prob(
        &self,
        orbs: &[u8; 4],
        occ: &[u8],
        det: &[u8],
        lookup: &Array2<u8>,
        orb_symm: &[u8],
        u1_over_unocc: bool,
    ) -> f64 {
        let s_occ: f64 = occ.iter().map(|&o| self.s_tens[self.spatial(o)]).sum();
        if s_occ == 0.0 {
            return 0.0;
        }
        self.orderings(orbs)
            .map(|(o1, u1, o2, u2)| {
                let p1 = self.spatial(o1);
                let p2 = self.spatial(o2);
                let d_occ: f64 = occ
                    .iter()
                    .filter(|&&orb| orb != o1)
                    .map(|&orb| self.pair_wt(o1, orb))
                    .sum();
                if d_occ == 0.0 {
                    return 0.0;
                }
                let u1_norm = if u1_over_unocc {
                    let spin_shift = (self.spin(o1) * self.n_orb) as u8;
                    (0..self.n_orb)
                        .filter(|&a| !read_bit(det, a as u8 + spin_shift))
                        .map(|a| self.exch_sqrt[(p1, a)])
                        .sum()
                } else {
                    self.exch_norms[p1]
                };
                let u2_irrep = (orb_symm[p1]
                    ^ orb_symm[self.spatial(o2)]
                    ^ orb_symm[self.spatial(u1)]) as usize;
                let row = lookup.row(u2_irrep);
                let u2_norm: f64 = (0..row[0] as usize)
                    .map(|k| self.exch_sqrt[(p2, row[k + 1] as usize)])
                    .sum();
                if u1_norm == 0.0 || u2_norm == 0.0 {
                    return 0.0;
                }
                (self.s_tens[p1] / s_occ)
                    * (self.pair_wt(o1, o2) / d_occ)
                    * (self.exch_sqrt[(p1, self.spatial(u1))] / u1_norm)
                    * (self.exch_sqrt[(p2, self.spatial(u2))] / u2_norm)
            })
            .sum()
    }

    fn alias_row(&self, p: usize) -> (ArrayView1<u32>, ArrayView1<f64>) {
        (self.exch_aliases.row(p), self.exch_alias_probs.row(p))
    }

    /// Multinomial sampling of double excitations through the heat-bath
    /// chain. Writes canonically ordered records [i, j, a, b] and their
    /// proposal probabilities; occupied or coincident virtual draws are
    /// null. Returns the number of non-null samples.
    #[allow(clippy::too_many_arguments)]
    pub fn hb_doub_multi(
        &self,
        det: &[u8],
        occ: &[u8],
        orb_symm: &[u8],
        lookup: &Array2<u8>,
        n_samp: u32,
        rng: &mut impl Rng,
        chosen_orbs: &mut [[u8; 4]],
        prob_vec: &mut [f64],
    ) -> usize {
        let n_elec = occ.len();
        let s_occ: f64 = occ.iter().map(|&o| self.s_tens[self.spatial(o)]).sum();
        if s_occ == 0.0 {
            return 0;
        }
        let mut n_valid = 0;
        for _ in 0..n_samp {
            // First occupied orbital by its heat-bath weight.
            let mut target = rng.gen_range(0.0..1.0) * s_occ;
            let mut e1 = n_elec - 1;
            for (e, &orb) in occ.iter().enumerate() {
                target -= self.s_tens[self.spatial(orb)];
                if target < 0.0 {
                    e1 = e;
                    break;
                }
            }
            let o1 = occ[e1];

            // Second occupied orbital by the pair weight.
            let d_occ: f64 = occ
                .iter()
                .enumerate()
                .filter(|&(e, _)| e != e1)
                .map(|(_, &orb)| self.pair_wt(o1, orb))
                .sum();
            if d_occ == 0.0 {
                continue;
            }
            let mut target = rng.gen_range(0.0..1.0) * d_occ;
            let mut o2 = occ[if e1 == 0 { 1 } else { 0 }];
            for (e, &orb) in occ.iter().enumerate() {
                if e == e1 {
                    continue;
                }
                target -= self.pair_wt(o1, orb);
                if target < 0.0 {
                    o2 = orb;
                    break;
                }
            }

            // First virtual by alias draw on the exchange row.
            let p1 = self.spatial(o1);
            if self.exch_norms[p1] == 0.0 {
                continue;
            }
            let (aliases, alias_probs) = self.alias_row(p1);
            let a_spatial = sample_alias(
                aliases.to_slice().expect("row-major alias table"),
                alias_probs.to_slice().expect("row-major alias table"),
                rng,
            );
            let u1 = a_spatial as u8 + (self.spin(o1) * self.n_orb) as u8;
            if read_bit(det, u1) {
                continue;
            }

            // Second virtual within the symmetry-forced irrep row.
            let p2 = self.spatial(o2);
            let u2_irrep =
                (orb_symm[p1] ^ orb_symm[p2] ^ orb_symm[a_spatial]) as usize;
            let row = lookup.row(u2_irrep);
            let u2_norm: f64 = (0..row[0] as usize)
                .map(|k| self.exch_sqrt[(p2, row[k + 1] as usize)])
                .sum();
            if u2_norm == 0.0 {
                continue;
            }
            let mut target = rng.gen_range(0.0..1.0) * u2_norm;
            let mut b_spatial = None;
            for k in 0..row[0] as usize {
                let cand = row[k + 1] as usize;
                target -= self.exch_sqrt[(p2, cand)];
                if target < 0.0 {
                    b_spatial = Some(cand);
                    break;
                }
            }
            let Some(b_spatial) = b_spatial else { continue };
            let u2 = b_spatial as u8 + (self.spin(o2) * self.n_orb) as u8;
            if read_bit(det, u2) || u2 == u1 {
                continue;
            }

            // Canonical ordering: i < j, same-spin virtuals sorted, the
            // up-spin orbital first for opposite-spin pairs.
            let same_spin = self.spin(o1) == self.spin(o2);
            let (i, j, a, b) = if same_spin {
                let (i, j) = if o1 < o2 { (o1, o2) } else { (o2, o1) };
                let (a, b) = if u1 < u2 { (u1, u2) } else { (u2, u1) };
                (i, j, a, b)
            } else if self.spin(o1) == 0 {
                (o1, o2, u1, u2)
            } else {
                (o2, o1, u2, u1)
            };
            let orbs = [i, j, a, b];
            chosen_orbs[n_valid] = orbs;
            prob_vec[n_valid] = self.path_prob(&orbs, occ, det, lookup, orb_symm, false);
            n_valid += 1;
        }
        n_valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{find_bits, gen_hf_bitstring};
    use crate::symm::{doub_ex_symm, gen_symm_lookup};
    use ndarray::Array4;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    /// Four orbitals with nontrivial, properly symmetric repulsion
    /// integrals: (ik|jl) invariant under i<->k, j<->l, and pair swap.
    fn test_system() -> HfData {
        let n = 4usize;
        let mut eris = Array4::<f64>::zeros((n, n, n, n));
        for i in 0..n {
            for k in 0..n {
                for j in 0..n {
                    for l in 0..n {
                        let pair = |p: usize, q: usize| {
                            let (lo, hi) = if p <= q { (p, q) } else { (q, p) };
                            1.0 + 0.37 * lo as f64 + 0.11 * hi as f64 * hi as f64
                        };
                        eris[(i, j, k, l)] = 0.1 / (pair(i, k) + pair(j, l));
                    }
                }
            }
        }
        HfData {
            n_elec: 4,
            n_frz: 0,
            n_orb: 4,
            eps: 0.05,
            hf_en: 0.0,
            symm: vec![0; 4],
            h_core: ndarray::Array2::zeros((n, n)),
            eris,
        }
    }

    #[test]
    fn tables_are_symmetric_with_zero_same_spin_diagonal() {
        let hf = test_system();
        let hb = set_up(&hf);
        for p in 0..4 {
            assert_eq!(hb.d_same[(p, p)], 0.0);
            for q in 0..4 {
                assert!((hb.d_same[(p, q)] - hb.d_same[(q, p)]).abs() < 1e-12);
                assert!((hb.d_diff[(p, q)] - hb.d_diff[(q, p)]).abs() < 1e-12);
            }
        }
        let s_sum: f64 = hb.s_tens.iter().sum();
        assert!((s_sum - hb.s_norm).abs() < 1e-12);
    }

    #[test]
    fn multinomial_marginals_match_reported_probabilities() {
        let hf = test_system();
        let hb = set_up(&hf);
        let lookup = gen_symm_lookup(&hf.symm);
        let mut det = vec![0u8; crate::ceil_bytes(8)];
        gen_hf_bitstring(4, 4, &mut det);
        let mut occ = [0u8; 4];
        find_bits(&det, &mut occ);

        let mut allowed = vec![[0u8; 4]; 1000];
        let n_allowed = doub_ex_symm(&det, &occ, 4, &mut allowed, &hf.symm);
        let allowed: Vec<[u8; 4]> = allowed[..n_allowed].to_vec();

        let mut rng = SmallRng::seed_from_u64(2024);
        let n_draws = 200_000u32;
        let mut chosen = vec![[0u8; 4]; n_draws as usize];
        let mut probs = vec![0.0f64; n_draws as usize];
        let n_valid = hb.hb_doub_multi(
            &det, &occ, &hf.symm, &lookup, n_draws, &mut rng, &mut chosen, &mut probs,
        );
        assert!(n_valid > 0);

        let mut freq: HashMap<[u8; 4], (usize, f64)> = HashMap::new();
        for samp in 0..n_valid {
            let entry = freq.entry(chosen[samp]).or_insert((0, probs[samp]));
            entry.0 += 1;
            assert!((entry.1 - probs[samp]).abs() < 1e-12);
        }
        for (ex, (count, prob)) in &freq {
            assert!(allowed.contains(ex), "sampled {:?} is not allowed", ex);
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
    fn chain_stage_weights_compose_to_norm_wt() {
        // The product of the per-stage normalised sub-weights along one
        // ordering, summed over orderings, must equal calc_norm_wt.
        let hf = test_system();
        let hb = set_up(&hf);
        let lookup = gen_symm_lookup(&hf.symm);
        let mut det = vec![0u8; crate::ceil_bytes(8)];
        gen_hf_bitstring(4, 4, &mut det);
        let mut occ = [0u8; 4];
        find_bits(&det, &mut occ);

        // Opposite-spin excitation (0up, 0dn) -> (2up, 3dn).
        let orbs = [0u8, 4, 2, 7];
        let mut by_stages = 0.0;
        for (o1, u1, o2, u2) in [(0u8, 2u8, 4u8, 7u8), (4, 7, 0, 2)] {
            let e1 = occ.iter().position(|&o| o == o1).unwrap() as u8;
            let mut subwt = [0.0f64; 8];
            hb.calc_o1_probs(&occ, &mut subwt);
            let p_o1 = subwt[e1 as usize];
            let mut o1_io = e1;
            let mut subwt2 = [0.0f64; 8];
            hb.calc_o2_probs(&occ, &mut o1_io, &mut subwt2);
            let e2 = occ.iter().position(|&o| o == o2).unwrap();
            let p_o2 = subwt2[e2];
            let mut subwt3 = [0.0f64; 8];
            hb.calc_u1_probs(o1, &det, &mut subwt3);
            let p_u1 = subwt3[(u1 as usize) % 4];
            let mut subwt4 = [0.0f64; 8];
            let (_, n_sub) = hb.calc_u2_probs(&hf.symm, &lookup, o1, o2, u1, &mut subwt4);
            let row = lookup.row(0);
            let k = (0..n_sub as usize)
                .position(|k| row[k + 1] == (u2 % 4))
                .unwrap();
            let p_u2 = subwt4[k];
            by_stages += p_o1 * p_o2 * p_u1 * p_u2;
        }
        let direct = hb.calc_norm_wt(&orbs, &occ, &det, &lookup, &hf.symm);
        assert!(
            (by_stages - direct).abs() < 1e-12,
            "{} vs {}",
            by_stages,
            direct
        );
    }
}
