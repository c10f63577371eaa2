// symm.rs
//
// Point-group bookkeeping and enumeration of symmetry-allowed excitations.
// Irreps are labelled 0..8 and the group operation is XOR, so a double
// excitation (i, j) -> (a, b) is allowed iff the XOR of the four irreps
// vanishes and a single i -> a requires equal irreps.

use crate::bits::read_bit;
use crate::N_IRREPS;
use ndarray::Array2;

/// Number of unoccupied orbitals per (irrep, spin) pair.
pub type VirtCounts = [[u32; 2]; N_IRREPS];

/// Build the irrep lookup table. Row g holds the number of spatial orbitals
/// carrying irrep g in column 0, followed by those orbital indices in
/// ascending order.
/// # Arguments:
///     `orb_symm`: irrep label of each unfrozen spatial orbital.
pub fn gen_symm_lookup(orb_symm: &[u8]) -> Array2<u8> {
    let n_orb = orb_symm.len();
    let mut table = Array2::<u8>::zeros((N_IRREPS, n_orb + 1));
    for (orb, &symm) in orb_symm.iter().enumerate() {
        let count = table[(symm as usize, 0)];
        table[(symm as usize, 1 + count as usize)] = orb as u8;
        table[(symm as usize, 0)] = count + 1;
    }
    table
}

/// Count the unoccupied orbitals of each irrep and spin in a determinant.
/// # Arguments:
///     `occ_orbs`: occupied spin orbitals in the determinant.
///     `n_orb`: number of unfrozen spatial orbitals.
///     `lookup`: irrep lookup table from `gen_symm_lookup`.
///     `orb_symm`: irrep label of each spatial orbital.
pub fn count_symm_virt(
    occ_orbs: &[u8],
    n_orb: u32,
    lookup: &Array2<u8>,
    orb_symm: &[u8],
) -> VirtCounts {
    let mut counts = [[0u32; 2]; N_IRREPS];
    for (irrep, row) in counts.iter_mut().enumerate() {
        let tot = lookup[(irrep, 0)] as u32;
        row[0] = tot;
        row[1] = tot;
    }
    for &orb in occ_orbs {
        let spin = (orb as u32 / n_orb) as usize;
        let irrep = orb_symm[(orb as u32 % n_orb) as usize] as usize;
        counts[irrep][spin] -= 1;
    }
    counts
}

/// Enumerate every symmetry-allowed double excitation from a determinant.
/// Records are [i, j, a, b] with i < j and, for same-spin pairs, a < b; for
/// opposite-spin pairs the spin-up orbitals occupy the first slots of each
/// half. Returns the number of records written.
/// # Arguments:
///     `det`: origin determinant bit string.
///     `occ_orbs`: its occupied-orbital list.
///     `n_orb`: number of unfrozen spatial orbitals.
///     `res_arr`: output excitation records.
///     `orb_symm`: irrep of each spatial orbital.
pub fn doub_ex_symm(
    det: &[u8],
    occ_orbs: &[u8],
    n_orb: u32,
    res_arr: &mut [[u8; 4]],
    orb_symm: &[u8],
) -> usize {
    let num_elec = occ_orbs.len();
    let half = num_elec / 2;
    let n_orb_u8 = n_orb as u8;
    let mut idx = 0;

    // Opposite-spin excitations: i up, j down, a up, b down.
    for &i_orb in &occ_orbs[..half] {
        for &j_orb in &occ_orbs[half..] {
            for a in 0..n_orb_u8 {
                if read_bit(det, a) {
                    continue;
                }
                for b in n_orb_u8..2 * n_orb_u8 {
                    let symm_prod = orb_symm[i_orb as usize]
                        ^ orb_symm[(j_orb - n_orb_u8) as usize]
                        ^ orb_symm[a as usize]
                        ^ orb_symm[(b - n_orb_u8) as usize];
                    if !read_bit(det, b) && symm_prod == 0 {
                        res_arr[idx] = [i_orb, j_orb, a, b];
                        idx += 1;
                    }
                }
            }
        }
    }
    // Same-spin excitations for both spin channels, i < j and a < b.
    for spin in 0..2u8 {
        let range = if spin == 0 { 0..half } else { half..num_elec };
        let orb_lo = spin * n_orb_u8;
        let orb_hi = (spin + 1) * n_orb_u8;
        for e1 in range.clone() {
            let i_orb = occ_orbs[e1];
            for e2 in e1 + 1..range.end {
                let j_orb = occ_orbs[e2];
                for a in orb_lo..orb_hi {
                    if read_bit(det, a) {
                        continue;
                    }
                    for b in a + 1..orb_hi {
                        let symm_prod = orb_symm[(i_orb - orb_lo) as usize]
                            ^ orb_symm[(j_orb - orb_lo) as usize]
                            ^ orb_symm[(a - orb_lo) as usize]
                            ^ orb_symm[(b - orb_lo) as usize];
                        if !read_bit(det, b) && symm_prod == 0 {
                            res_arr[idx] = [i_orb, j_orb, a, b];
                            idx += 1;
                        }
                    }
                }
            }
        }
    }
    idx
}

/// Enumerate every symmetry-allowed single excitation [i, a] from a
/// determinant. Returns the number of records written.
pub fn sing_ex_symm(
    det: &[u8],
    occ_orbs: &[u8],
    n_orb: u32,
    res_arr: &mut [[u8; 2]],
    orb_symm: &[u8],
) -> usize {
    let half = occ_orbs.len() / 2;
    let n_orb_u8 = n_orb as u8;
    let mut idx = 0;
    for (elec_idx, &i_orb) in occ_orbs.iter().enumerate() {
        let spin_shift = if elec_idx < half { 0 } else { n_orb_u8 };
        for a in spin_shift..spin_shift + n_orb_u8 {
            if !read_bit(det, a)
                && orb_symm[(i_orb - spin_shift) as usize] == orb_symm[(a - spin_shift) as usize]
            {
                res_arr[idx] = [i_orb, a];
                idx += 1;
            }
        }
    }
    idx
}

/// Count symmetry-allowed single excitations without materialising them.
pub fn count_singex(
    det: &[u8],
    occ_orbs: &[u8],
    orb_symm: &[u8],
    n_orb: u32,
    lookup: &Array2<u8>,
) -> usize {
    let mut num_ex = 0;
    for &orb in occ_orbs {
        let spin_shift = (orb as u32 / n_orb * n_orb) as u8;
        let irrep = orb_symm[(orb as u32 % n_orb) as usize] as usize;
        let n_same = lookup[(irrep, 0)] as usize;
        for symm_idx in 0..n_same {
            if !read_bit(det, lookup[(irrep, symm_idx + 1)] + spin_shift) {
                num_ex += 1;
            }
        }
    }
    num_ex
}

/// Closed-form count of double excitations ignoring symmetry: same-spin
/// occupied pairs (in both orders) times same-spin virtual pairs for both
/// channels, plus opposite-spin products. An upper bound on the enumerated
/// count, used for sizing scratch arrays.
pub fn count_doub_nosymm(num_elec: u32, num_orb: u32) -> usize {
    let num_unocc = num_orb - num_elec / 2;
    let virt_pairs = num_unocc * num_unocc.saturating_sub(1) / 2;
    let same_spin = num_elec * (num_elec / 2).saturating_sub(1) * virt_pairs;
    let opp_spin = (num_elec / 2) * (num_elec / 2) * num_unocc * num_unocc;
    (same_spin + opp_spin) as usize
}

/// Number of occupied orbitals from which at least one symmetry-allowed
/// single excitation exists.
pub fn count_sing_allowed(
    occ_orbs: &[u8],
    orb_symm: &[u8],
    n_orb: u32,
    virt_counts: &VirtCounts,
) -> u32 {
    let mut allowed = 0;
    for &orb in occ_orbs {
        let spin = (orb as u32 / n_orb) as usize;
        let irrep = orb_symm[(orb as u32 % n_orb) as usize] as usize;
        if virt_counts[irrep][spin] > 0 {
            allowed += 1;
        }
    }
    allowed
}

/// Resolve the k-th symmetry-allowed occupied orbital and count its allowed
/// virtuals. On input `occ_choice` holds the index among allowed occupied
/// orbitals; on output it holds the spin orbital itself. Returns the number
/// of virtual orbitals sharing its irrep and spin.
pub fn count_sing_virt(
    occ_orbs: &[u8],
    orb_symm: &[u8],
    n_orb: u32,
    virt_counts: &VirtCounts,
    occ_choice: &mut u8,
) -> u32 {
    let mut allowed_idx = 0;
    for &orb in occ_orbs {
        let spin = (orb as u32 / n_orb) as usize;
        let irrep = orb_symm[(orb as u32 % n_orb) as usize] as usize;
        let n_virt = virt_counts[irrep][spin];
        if n_virt > 0 {
            if allowed_idx == *occ_choice {
                *occ_choice = orb;
                return n_virt;
            }
            allowed_idx += 1;
        }
    }
    0
}

/// Weights and choice counts of the virtual irrep pairs compatible with a
/// chosen occupied pair.
///
/// On input `occ_choice` holds [pair index, 0] where the pair index runs
/// over unordered electron pairs in triangular order; on output it holds the
/// two occupied spin orbitals. `virt_weights[g]` receives the probability of
/// picking irrep g for the first virtual and `virt_counts[g]` the number of
/// ordered virtual-pair choices available once g is fixed.
pub fn symm_pair_wt(
    occ_orbs: &[u8],
    orb_symm: &[u8],
    n_orb: u32,
    unocc_counts: &VirtCounts,
    occ_choice: &mut [u8; 2],
    virt_weights: &mut [f64; N_IRREPS],
    virt_counts: &mut [u32; N_IRREPS],
) {
    let num_elec = occ_orbs.len();
    // Decode the triangular pair index into electron indices e1 < e2.
    let mut pair_idx = occ_choice[0] as usize;
    let mut e1 = 0;
    while pair_idx >= num_elec - e1 - 1 {
        pair_idx -= num_elec - e1 - 1;
        e1 += 1;
    }
    let e2 = e1 + 1 + pair_idx;
    let i_orb = occ_orbs[e1];
    let j_orb = occ_orbs[e2];
    occ_choice[0] = i_orb;
    occ_choice[1] = j_orb;

    let s_i = (i_orb as u32 / n_orb) as usize;
    let s_j = (j_orb as u32 / n_orb) as usize;
    let same_spin = s_i == s_j;
    let xor_symm =
        orb_symm[(i_orb as u32 % n_orb) as usize] ^ orb_symm[(j_orb as u32 % n_orb) as usize];

    let mut total = 0u64;
    for g in 0..N_IRREPS {
        let h = g ^ (xor_symm as usize);
        let m_g = unocc_counts[g][s_i];
        let m_h = unocc_counts[h][s_j];
        // Ordered pair counts; for a same-irrep same-spin pair the second
        // draw excludes the first orbital.
        let count = if same_spin && g == h {
            m_g * m_g.saturating_sub(1)
        } else {
            m_g * m_h
        };
        virt_counts[g] = count;
        total += count as u64;
    }
    for g in 0..N_IRREPS {
        virt_weights[g] = if total > 0 {
            virt_counts[g] as f64 / total as f64
        } else {
            0.0
        };
    }
}

/// Find the n-th unoccupied orbital of a given irrep and spin.
/// # Arguments:
///     `det`: determinant bit string.
///     `lookup_row`: row of the irrep lookup table, count in column 0.
///     `spin_shift`: n_orb * spin of the sought virtual.
///     `index`: which unoccupied orbital of that irrep to return.
/// Returns the spin orbital, or None if fewer than index + 1 exist.
pub fn virt_from_idx(det: &[u8], lookup_row: &[u8], spin_shift: u8, index: u32) -> Option<u8> {
    let n_of_irrep = lookup_row[0] as usize;
    let mut virt_idx = 0;
    for &spatial in &lookup_row[1..1 + n_of_irrep] {
        let orb = spatial + spin_shift;
        if !read_bit(det, orb) {
            if virt_idx == index {
                return Some(orb);
            }
            virt_idx += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{find_bits, gen_hf_bitstring};

    fn hf_det(n_orb: u32, n_elec: u32) -> (Vec<u8>, Vec<u8>) {
        let mut det = vec![0u8; crate::ceil_bytes(2 * n_orb)];
        gen_hf_bitstring(n_orb, n_elec, &mut det);
        let mut occ = vec![0u8; n_elec as usize];
        assert_eq!(find_bits(&det, &mut occ), n_elec as usize);
        (det, occ)
    }

    #[test]
    fn lookup_table_lists_orbitals_by_irrep() {
        let symm = [0u8, 1, 0, 2, 1];
        let table = gen_symm_lookup(&symm);
        assert_eq!(table[(0, 0)], 2);
        assert_eq!(table[(0, 1)], 0);
        assert_eq!(table[(0, 2)], 2);
        assert_eq!(table[(1, 0)], 2);
        assert_eq!(table[(2, 0)], 1);
        assert_eq!(table[(3, 0)], 0);
    }

    #[test]
    fn virt_counts_exclude_occupied() {
        let symm = [0u8, 0, 1, 1];
        let lookup = gen_symm_lookup(&symm);
        let (_, occ) = hf_det(4, 4);
        let counts = count_symm_virt(&occ, 4, &lookup, &symm);
        // Orbitals 0 and 1 (irrep 0) are occupied for both spins.
        assert_eq!(counts[0], [0, 0]);
        assert_eq!(counts[1], [2, 2]);
    }

    #[test]
    fn doubles_closed_form_bounds_symmetry_free_enumeration() {
        // All orbitals share one irrep, so symmetry never filters anything.
        let n_orb = 4u32;
        let n_elec = 4u32;
        let symm = vec![0u8; n_orb as usize];
        let (det, occ) = hf_det(n_orb, n_elec);
        let mut res = vec![[0u8; 4]; 1000];
        let n_doub = doub_ex_symm(&det, &occ, n_orb, &mut res, &symm);
        // With two unoccupied orbitals per spin the closed form gives
        // 4 * (4/2 - 1) * 2 * (2 - 1) / 2 + (4/2)^2 * 2^2 = 20.
        assert_eq!(count_doub_nosymm(n_elec, n_orb), 20);
        assert!(n_doub > 0);
        assert!(n_doub <= count_doub_nosymm(n_elec, n_orb));
    }

    #[test]
    fn enumerated_doubles_satisfy_symmetry_closure_and_ordering() {
        let n_orb = 5u32;
        let symm = [0u8, 1, 2, 1, 0];
        let (det, occ) = hf_det(n_orb, 4);
        let mut res = vec![[0u8; 4]; 1000];
        let n_doub = doub_ex_symm(&det, &occ, n_orb, &mut res, &symm);
        assert!(n_doub > 0);
        for ex in &res[..n_doub] {
            let spatial = |orb: u8| (orb as u32 % n_orb) as usize;
            let xor = symm[spatial(ex[0])] ^ symm[spatial(ex[1])] ^ symm[spatial(ex[2])] ^ symm[spatial(ex[3])];
            assert_eq!(xor, 0, "excitation {:?} breaks symmetry", ex);
            assert!(ex[0] < ex[1]);
            let same_spin = ex[0] as u32 / n_orb == ex[1] as u32 / n_orb;
            if same_spin {
                assert!(ex[2] < ex[3]);
            }
            assert!(!read_bit(&det, ex[2]));
            assert!(!read_bit(&det, ex[3]));
        }
    }

    #[test]
    fn singles_preserve_irrep_and_match_count() {
        let n_orb = 5u32;
        let symm = [0u8, 1, 2, 1, 0];
        let lookup = gen_symm_lookup(&symm);
        let (det, occ) = hf_det(n_orb, 4);
        let mut res = vec![[0u8; 2]; 100];
        let n_sing = sing_ex_symm(&det, &occ, n_orb, &mut res, &symm);
        assert_eq!(n_sing, count_singex(&det, &occ, &symm, n_orb, &lookup));
        for ex in &res[..n_sing] {
            let spatial = |orb: u8| (orb as u32 % n_orb) as usize;
            assert_eq!(symm[spatial(ex[0])], symm[spatial(ex[1])]);
            assert_eq!(ex[0] as u32 / n_orb, ex[1] as u32 / n_orb);
        }
    }

    #[test]
    fn sing_virt_resolves_chosen_occupied() {
        let n_orb = 5u32;
        let symm = [0u8, 1, 2, 1, 0];
        let lookup = gen_symm_lookup(&symm);
        let (_, occ) = hf_det(n_orb, 4);
        let counts = count_symm_virt(&occ, n_orb, &lookup, &symm);
        let n_allowed = count_sing_allowed(&occ, &symm, n_orb, &counts);
        assert!(n_allowed > 0);
        for k in 0..n_allowed {
            let mut choice = k as u8;
            let n_virt = count_sing_virt(&occ, &symm, n_orb, &counts, &mut choice);
            assert!(n_virt > 0);
            assert!(occ.contains(&choice));
        }
    }

    #[test]
    fn virt_from_idx_walks_unoccupied_in_order() {
        let n_orb = 5u32;
        let symm = [0u8, 0, 0, 1, 1];
        let lookup = gen_symm_lookup(&symm);
        let (det, _) = hf_det(n_orb, 4);
        // Irrep 0 row is {0, 1, 2}; spin-up 0 and 1 are occupied.
        let row: Vec<u8> = lookup.row(0).to_vec();
        assert_eq!(virt_from_idx(&det, &row, 0, 0), Some(2));
        assert_eq!(virt_from_idx(&det, &row, 0, 1), None);
    }
}
