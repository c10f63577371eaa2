// hamiltonian.rs
//
// Slater-Condon matrix elements over frozen-core-renormalised integrals,
// application of the off-diagonal and diagonal parts of the Hamiltonian to a
// distributed vector, and the precomputed sparse block used for the
// semi-stochastic deterministic subspace. Matrix-element routines return
// the magnitude-correct value without the permutation sign; callers obtain
// the sign from the parity functions while toggling the bit string.

use ndarray::Array2;

use crate::bits::{doub_det_parity, find_bits, sing_det_parity};
use crate::comm::Comm;
use crate::error::Result;
use crate::symm::{count_doub_nosymm, doub_ex_symm, sing_ex_symm};
use crate::vector::DistVec;
use crate::{ceil_bytes, HfData};

/// Off-diagonal element for a double excitation [i, j, a, b], no sign:
/// (ij|ab) minus the exchange integral when the pair is same-spin.
pub fn doub_matr_el_nosgn(chosen_orbs: &[u8; 4], hf: &HfData) -> f64 {
    let adj_n_orb = hf.n_orb as usize;
    let half_frz = (hf.n_frz / 2) as usize;
    let same_sp =
        chosen_orbs[0] as usize / adj_n_orb == chosen_orbs[1] as usize / adj_n_orb;
    let sp0 = chosen_orbs[0] as usize % adj_n_orb + half_frz;
    let sp1 = chosen_orbs[1] as usize % adj_n_orb + half_frz;
    let sp2 = chosen_orbs[2] as usize % adj_n_orb + half_frz;
    let sp3 = chosen_orbs[3] as usize % adj_n_orb + half_frz;

    let mut mat_el = hf.eris[(sp0, sp1, sp2, sp3)];
    if same_sp {
        mat_el -= hf.eris[(sp0, sp1, sp3, sp2)];
    }
    mat_el
}

/// Off-diagonal element for a single excitation [i, a], no sign: the core
/// contribution plus Coulomb and exchange sums over the frozen shell and the
/// other occupied electrons.
pub fn sing_matr_el_nosgn(chosen_orbs: &[u8; 2], occ_orbs: &[u8], hf: &HfData) -> f64 {
    let adj_n_orb = hf.n_orb as usize;
    let half_frz = (hf.n_frz / 2) as usize;
    let n_elec = occ_orbs.len();
    let occ_spa = chosen_orbs[0] as usize % adj_n_orb + half_frz;
    let unocc_spa = chosen_orbs[1] as usize % adj_n_orb + half_frz;
    let occ_spin = chosen_orbs[0] as usize / adj_n_orb;

    let mut mat_el = hf.h_core[(occ_spa, unocc_spa)];
    for j in 0..half_frz {
        mat_el += hf.eris[(occ_spa, j, unocc_spa, j)] * 2.0;
        mat_el -= hf.eris[(occ_spa, j, j, unocc_spa)];
    }
    for j in 0..n_elec / 2 {
        let elec = occ_orbs[j] as usize + half_frz;
        mat_el += hf.eris[(occ_spa, elec, unocc_spa, elec)];
        if occ_spin == 0 {
            mat_el -= hf.eris[(occ_spa, elec, elec, unocc_spa)];
        }
    }
    for j in n_elec / 2..n_elec {
        let elec = occ_orbs[j] as usize - adj_n_orb + half_frz;
        mat_el += hf.eris[(occ_spa, elec, unocc_spa, elec)];
        if occ_spin == 1 {
            mat_el -= hf.eris[(occ_spa, elec, elec, unocc_spa)];
        }
    }
    mat_el
}

/// Diagonal Hamiltonian element of a determinant: the HF-like expectation
/// value including the frozen-core energy.
pub fn diag_matrel(occ_orbs: &[u8], hf: &HfData) -> f64 {
    let half_frz = (hf.n_frz / 2) as usize;
    let adj_n_orb = hf.n_orb as usize;
    let n_e_unf = occ_orbs.len();
    let mut matr_sum = 0.0;

    for j in 0..half_frz {
        matr_sum += hf.h_core[(j, j)] * 2.0;
        matr_sum += hf.eris[(j, j, j, j)];
        for k in j + 1..half_frz {
            matr_sum += hf.eris[(j, k, j, k)] * 4.0;
            matr_sum -= hf.eris[(j, k, k, j)] * 2.0;
        }
    }
    for j in 0..n_e_unf / 2 {
        let elec_1 = occ_orbs[j] as usize + half_frz;
        matr_sum += hf.h_core[(elec_1, elec_1)];
        for k in 0..half_frz {
            matr_sum += hf.eris[(elec_1, k, elec_1, k)] * 2.0;
            matr_sum -= hf.eris[(elec_1, k, k, elec_1)];
        }
        for k in j + 1..n_e_unf / 2 {
            let elec_2 = occ_orbs[k] as usize + half_frz;
            matr_sum += hf.eris[(elec_1, elec_2, elec_1, elec_2)];
            matr_sum -= hf.eris[(elec_1, elec_2, elec_2, elec_1)];
        }
        for k in n_e_unf / 2..n_e_unf {
            let elec_2 = occ_orbs[k] as usize - adj_n_orb + half_frz;
            matr_sum += hf.eris[(elec_1, elec_2, elec_1, elec_2)];
        }
    }
    for j in n_e_unf / 2..n_e_unf {
        let elec_1 = occ_orbs[j] as usize - adj_n_orb + half_frz;
        matr_sum += hf.h_core[(elec_1, elec_1)];
        for k in 0..half_frz {
            matr_sum += hf.eris[(elec_1, k, elec_1, k)] * 2.0;
            matr_sum -= hf.eris[(elec_1, k, k, elec_1)];
        }
        for k in j + 1..n_e_unf {
            let elec_2 = occ_orbs[k] as usize - adj_n_orb + half_frz;
            matr_sum += hf.eris[(elec_1, elec_2, elec_1, elec_2)];
            matr_sum -= hf.eris[(elec_1, elec_2, elec_2, elec_1)];
        }
    }
    matr_sum
}

/// Apply the off-diagonal part of `h_fac * H` to the row `src_row`,
/// accumulating spawns into row `dest_row` through the staging buffers.
/// Every enumerated excitation is staged as an initiator; the adder must be
/// sized for a full application. Leaves `curr_vec_idx` at `dest_row`.
pub fn h_op_offdiag(
    vec: &mut DistVec<f64>,
    hf: &HfData,
    src_row: usize,
    dest_row: usize,
    h_fac: f64,
    comm: &dyn Comm,
) -> Result<()> {
    let n_bytes = ceil_bytes(vec.n_bits());
    let n_elec = vec.n_elec();
    let mut doub_scratch = vec![[0u8; 4]; count_doub_nosymm(n_elec as u32, hf.n_orb)];
    let mut sing_scratch = vec![[0u8; 2]; n_elec * hf.n_orb as usize];
    let mut new_det = vec![0u8; n_bytes];

    vec.set_curr_vec_idx(dest_row)?;
    for pos in 0..vec.curr_size() {
        let curr_el = vec.value_at(src_row, pos);
        if curr_el == 0.0 {
            continue;
        }
        let curr_det: Vec<u8> = vec.idx_at_pos(pos).to_vec();
        let occ: Vec<u8> = vec.orbs_at_pos(pos).to_vec();

        let n_sing = sing_ex_symm(&curr_det, &occ, hf.n_orb, &mut sing_scratch, &hf.symm);
        for ex in &sing_scratch[..n_sing] {
            let mut matr_el = sing_matr_el_nosgn(ex, &occ, hf);
            new_det.copy_from_slice(&curr_det);
            matr_el *= sing_det_parity(&mut new_det, ex) as f64;
            vec.add(&new_det, matr_el * curr_el * h_fac, true);
        }

        let n_doub = doub_ex_symm(&curr_det, &occ, hf.n_orb, &mut doub_scratch, &hf.symm);
        for ex in &doub_scratch[..n_doub] {
            let mut matr_el = doub_matr_el_nosgn(ex, hf);
            new_det.copy_from_slice(&curr_det);
            matr_el *= doub_det_parity(&mut new_det, ex) as f64;
            vec.add(&new_det, matr_el * curr_el * h_fac, true);
        }
    }
    vec.perform_add(dest_row, comm);
    Ok(())
}

/// Apply `id_fac + h_fac * H` to the current value row in place: spawns
/// from the off-diagonal part are staged while the diagonal scales each
/// element, so the scaling never touches freshly spawned contributions.
/// Used to build `H * trial` and for exact power iterations.
pub fn h_op(
    vec: &mut DistVec<f64>,
    hf: &HfData,
    id_fac: f64,
    h_fac: f64,
    comm: &dyn Comm,
) -> Result<()> {
    let n_bytes = ceil_bytes(vec.n_bits());
    let n_elec = vec.n_elec();
    let mut doub_scratch = vec![[0u8; 4]; count_doub_nosymm(n_elec as u32, hf.n_orb)];
    let mut sing_scratch = vec![[0u8; 2]; n_elec * hf.n_orb as usize];
    let mut new_det = vec![0u8; n_bytes];
    let row = vec.curr_vec_idx();

    for pos in 0..vec.curr_size() {
        let curr_el = vec.value_at(row, pos);
        if curr_el == 0.0 {
            continue;
        }
        let curr_det: Vec<u8> = vec.idx_at_pos(pos).to_vec();
        let occ: Vec<u8> = vec.orbs_at_pos(pos).to_vec();

        let n_sing = sing_ex_symm(&curr_det, &occ, hf.n_orb, &mut sing_scratch, &hf.symm);
        for ex in &sing_scratch[..n_sing] {
            let mut matr_el = sing_matr_el_nosgn(ex, &occ, hf);
            new_det.copy_from_slice(&curr_det);
            matr_el *= sing_det_parity(&mut new_det, ex) as f64;
            vec.add(&new_det, matr_el * curr_el * h_fac, true);
        }
        let n_doub = doub_ex_symm(&curr_det, &occ, hf.n_orb, &mut doub_scratch, &hf.symm);
        for ex in &doub_scratch[..n_doub] {
            let mut matr_el = doub_matr_el_nosgn(ex, hf);
            new_det.copy_from_slice(&curr_det);
            matr_el *= doub_det_parity(&mut new_det, ex) as f64;
            vec.add(&new_det, matr_el * curr_el * h_fac, true);
        }

        let diag = vec.diag_el_at_pos(pos, |occ| diag_matrel(occ, hf) - hf.hf_en);
        vec.set_value_at(row, pos, curr_el * (id_fac + h_fac * diag));
    }
    vec.perform_add(row, comm);
    Ok(())
}

/// Apply `id_fac + h_fac * (H_aa - hf_en)` to the diagonal: in place when
/// `src_row == dest_row`, otherwise accumulating `src * (...)` into the
/// destination row. Diagonal elements are cached lazily per position.
pub fn h_op_diag(
    vec: &mut DistVec<f64>,
    hf: &HfData,
    src_row: usize,
    dest_row: usize,
    id_fac: f64,
    h_fac: f64,
) {
    for pos in 0..vec.curr_size() {
        let src_val = vec.value_at(src_row, pos);
        if src_val == 0.0 {
            continue;
        }
        let diag = vec.diag_el_at_pos(pos, |occ| diag_matrel(occ, hf) - hf.hf_en);
        let fac = id_fac + h_fac * diag;
        if src_row == dest_row {
            vec.set_value_at(dest_row, pos, src_val * fac);
        } else {
            let dest_val = vec.value_at(dest_row, pos);
            vec.set_value_at(dest_row, pos, dest_val + src_val * fac);
        }
    }
}

/// Enumerate all double excitations from the HF determinant along with
/// their signed matrix elements. Used to seed compressed trial vectors.
/// Returns the number of excited determinants written.
pub fn gen_hf_ex(
    hf_det: &[u8],
    hf_occ: &[u8],
    hf: &HfData,
    ex_dets: &mut Array2<u8>,
    ex_mel: &mut [f64],
) -> usize {
    let n_bytes = ex_dets.ncols();
    let mut ex_arr = vec![[0u8; 4]; count_doub_nosymm(hf_occ.len() as u32, hf.n_orb)];
    let num_hf_doub = doub_ex_symm(hf_det, hf_occ, hf.n_orb, &mut ex_arr, &hf.symm);
    for (idx, ex) in ex_arr[..num_hf_doub].iter().enumerate() {
        let row = ex_dets
            .row_mut(idx)
            .into_slice()
            .expect("row-major determinant storage");
        row.copy_from_slice(&hf_det[..n_bytes]);
        let mut matr_el = doub_matr_el_nosgn(ex, hf);
        matr_el *= doub_det_parity(row, ex) as f64;
        ex_mel[idx] = matr_el;
    }
    num_hf_doub
}

/// Build a compressed trial vector from the HF determinant and its double
/// excitations, weighted by first-order perturbation theory. Returns the
/// determinants as a flat buffer of `n_bytes`-wide rows alongside their
/// coefficients, the HF determinant first with coefficient 1.
pub fn hf_doub_trial(
    hf_det: &[u8],
    hf_occ: &[u8],
    hf: &HfData,
    n_bytes: usize,
) -> (Vec<u8>, Vec<f64>) {
    let max_doub = count_doub_nosymm(hf_occ.len() as u32, hf.n_orb);
    let mut ex_dets = Array2::<u8>::zeros((max_doub, n_bytes));
    let mut ex_mel = vec![0.0; max_doub];
    let n_doub = gen_hf_ex(hf_det, hf_occ, hf, &mut ex_dets, &mut ex_mel);

    let hf_diag = diag_matrel(hf_occ, hf);
    let mut dets = hf_det[..n_bytes].to_vec();
    let mut vals = vec![1.0];
    let mut occ = vec![0u8; hf_occ.len()];
    for idx in 0..n_doub {
        let row = ex_dets.row(idx);
        let row = row.to_slice().expect("row-major determinant storage");
        find_bits(row, &mut occ);
        let en_gap = hf_diag - diag_matrel(&occ, hf);
        if en_gap.abs() > 1e-9 {
            dets.extend_from_slice(row);
            vals.push(ex_mel[idx] / en_gap);
        }
    }
    (dets, vals)
}

/// Precomputed sparse block of `-eps * H` whose origin determinants lie in
/// the deterministic subspace. Origins are referenced by storage position,
/// which stays valid across iterations because positions never move.
pub struct DetermHam {
    from: Vec<usize>,
    to: Vec<u8>,
    matr_el: Vec<f64>,
    n_bytes: usize,
}

impl DetermHam {
    /// Enumerate every Hamiltonian connection out of the first `n_determ`
    /// positions of the vector, with matrix elements scaled by `-eps`.
    pub fn build(vec: &DistVec<f64>, n_determ: usize, hf: &HfData, eps: f64) -> Self {
        let n_bytes = ceil_bytes(vec.n_bits());
        let n_elec = vec.n_elec();
        let mut doub_scratch = vec![[0u8; 4]; count_doub_nosymm(n_elec as u32, hf.n_orb)];
        let mut sing_scratch = vec![[0u8; 2]; n_elec * hf.n_orb as usize];

        let mut from = Vec::new();
        let mut to = Vec::new();
        let mut matr_el = Vec::new();
        for det_idx in 0..n_determ {
            let curr_det: Vec<u8> = vec.idx_at_pos(det_idx).to_vec();
            let occ: Vec<u8> = vec.orbs_at_pos(det_idx).to_vec();

            let n_sing = sing_ex_symm(&curr_det, &occ, hf.n_orb, &mut sing_scratch, &hf.symm);
            for ex in &sing_scratch[..n_sing] {
                let mut el = sing_matr_el_nosgn(ex, &occ, hf);
                let mut new_det = curr_det.clone();
                el *= sing_det_parity(&mut new_det, ex) as f64 * -eps;
                from.push(det_idx);
                to.extend_from_slice(&new_det);
                matr_el.push(el);
            }
            let n_doub = doub_ex_symm(&curr_det, &occ, hf.n_orb, &mut doub_scratch, &hf.symm);
            for ex in &doub_scratch[..n_doub] {
                let mut el = doub_matr_el_nosgn(ex, hf);
                let mut new_det = curr_det.clone();
                el *= doub_det_parity(&mut new_det, ex) as f64 * -eps;
                from.push(det_idx);
                to.extend_from_slice(&new_det);
                matr_el.push(el);
            }
        }
        Self {
            from,
            to,
            matr_el,
            n_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.from.len()
    }

    pub fn is_empty(&self) -> bool {
        self.from.is_empty()
    }

    /// Stage the exact product of this block with the current value row.
    /// The caller flushes with `perform_add`.
    pub fn apply(&self, vec: &mut DistVec<f64>) {
        for (entry, &origin) in self.from.iter().enumerate() {
            let mat_vec = vec.value_at_pos(origin) * self.matr_el[entry];
            let det = &self.to[entry * self.n_bytes..(entry + 1) * self.n_bytes];
            vec.add(det, mat_vec, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{find_bits, gen_hf_bitstring};
    use ndarray::{Array2 as A2, Array4};

    /// Two spatial orbitals, two electrons, no frozen core, zero repulsion.
    fn diagonal_system() -> HfData {
        HfData {
            n_elec: 2,
            n_frz: 0,
            n_orb: 2,
            eps: 0.05,
            hf_en: 0.0,
            symm: vec![0, 0],
            h_core: ndarray::arr2(&[[-1.0, 0.0], [0.0, -2.0]]),
            eris: Array4::zeros((2, 2, 2, 2)),
        }
    }

    #[test]
    fn diagonal_elements_sum_orbital_energies() {
        let hf = diagonal_system();
        // Both electrons in orbital 0 (spin orbitals 0 and 2).
        assert!((diag_matrel(&[0, 2], &hf) - -2.0).abs() < 1e-12);
        // One electron in each spatial orbital.
        assert!((diag_matrel(&[0, 3], &hf) - -3.0).abs() < 1e-12);
        assert!((diag_matrel(&[1, 3], &hf) - -4.0).abs() < 1e-12);
    }

    #[test]
    fn single_element_reduces_to_h_core_without_repulsion() {
        let mut hf = diagonal_system();
        hf.h_core = ndarray::arr2(&[[-1.0, 0.3], [0.3, -2.0]]);
        // Excite spin-up electron from orbital 0 to orbital 1.
        let el = sing_matr_el_nosgn(&[0, 1], &[0, 2], &hf);
        assert!((el - 0.3).abs() < 1e-12);
    }

    #[test]
    fn double_element_combines_coulomb_and_exchange() {
        let n = 2usize;
        let mut eris = Array4::zeros((n, n, n, n));
        eris[(0, 0, 1, 1)] = 0.7;
        eris[(0, 0, 1, 1)] = 0.7;
        let mut hf = diagonal_system();
        hf.eris = eris;
        // Opposite-spin double (0up, 0dn) -> (1up, 1dn): element (01|01).
        hf.eris[(0, 0, 1, 1)] = 0.7;
        let el = doub_matr_el_nosgn(&[0, 2, 1, 3], &hf);
        assert!((el - 0.7).abs() < 1e-12);

        // Same-spin pairs subtract the exchange part.
        let mut hf4 = HfData {
            n_elec: 4,
            n_frz: 0,
            n_orb: 4,
            eps: 0.05,
            hf_en: 0.0,
            symm: vec![0; 4],
            h_core: A2::zeros((4, 4)),
            eris: Array4::zeros((4, 4, 4, 4)),
        };
        hf4.eris[(0, 1, 2, 3)] = 0.5;
        hf4.eris[(0, 1, 3, 2)] = 0.2;
        let el = doub_matr_el_nosgn(&[0, 1, 2, 3], &hf4);
        assert!((el - 0.3).abs() < 1e-12);
    }

    #[test]
    fn hf_doubles_enumeration_carries_signed_elements() {
        let mut hf = HfData {
            n_elec: 4,
            n_frz: 0,
            n_orb: 4,
            eps: 0.05,
            hf_en: 0.0,
            symm: vec![0; 4],
            h_core: A2::zeros((4, 4)),
            eris: Array4::from_elem((4, 4, 4, 4), 1.0),
        };
        hf.eris[(0, 0, 2, 2)] = 0.25;
        let n_bytes = crate::ceil_bytes(8);
        let mut det = vec![0u8; n_bytes];
        gen_hf_bitstring(4, 4, &mut det);
        let mut occ = [0u8; 4];
        find_bits(&det, &mut occ);

        let max_doub = count_doub_nosymm(4, 4);
        let mut ex_dets = A2::zeros((max_doub, n_bytes));
        let mut ex_mel = vec![0.0; max_doub];
        let written = gen_hf_ex(&det, &occ, &hf, &mut ex_dets, &mut ex_mel);
        // Two same-spin pairs plus sixteen opposite-spin products.
        assert_eq!(written, 18);
        assert!(written <= max_doub);
        // Every target determinant still has four electrons.
        let mut tmp = [0u8; 8];
        for idx in 0..written {
            let row: Vec<u8> = ex_dets.row(idx).to_vec();
            assert_eq!(find_bits(&row, &mut tmp), 4);
        }
    }

    #[test]
    fn pt_trial_vector_starts_at_hf_with_unit_weight() {
        // Ascending orbital energies put every double above the HF
        // determinant; constant repulsion makes the pair terms cancel out
        // of the gaps.
        let hf = HfData {
            n_elec: 4,
            n_frz: 0,
            n_orb: 4,
            eps: 0.05,
            hf_en: 0.0,
            symm: vec![0; 4],
            h_core: A2::from_diag(&ndarray::arr1(&[-4.0, -3.0, -2.0, -1.0])),
            eris: Array4::from_elem((4, 4, 4, 4), 0.1),
        };
        let n_bytes = crate::ceil_bytes(8);
        let mut det = vec![0u8; n_bytes];
        gen_hf_bitstring(4, 4, &mut det);
        let mut occ = [0u8; 4];
        find_bits(&det, &mut occ);

        let (dets, vals) = hf_doub_trial(&det, &occ, &hf, n_bytes);
        assert_eq!(dets.len(), vals.len() * n_bytes);
        assert_eq!(&dets[..n_bytes], &det[..]);
        assert_eq!(vals[0], 1.0);

        let hf_diag = diag_matrel(&occ, &hf);
        let mut tmp = [0u8; 4];
        for (row, &coeff) in dets.chunks_exact(n_bytes).zip(vals.iter()).skip(1) {
            assert_eq!(find_bits(row, &mut tmp), 4);
            let en_gap = hf_diag - diag_matrel(&tmp, &hf);
            assert!(en_gap < 0.0, "double excitation below the HF determinant");
            // Opposite-spin elements are 0.1; same-spin exchange cancels.
            let mel = (coeff * en_gap).abs();
            assert!(mel < 1e-12 || (mel - 0.1).abs() < 1e-12, "element {}", mel);
        }
    }
}
