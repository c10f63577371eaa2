// frisys.rs
//
// Systematic-FRI power iteration for a molecular Hamiltonian. Each
// iteration compresses the factored matrix-vector product through a chain
// of five sub-sampling stages (singles/doubles split, first occupied,
// second occupied or single-virtual count, first virtual, second virtual
// within the symmetry-forced irrep), distributes the surviving spawns,
// applies death/cloning on the diagonal, and compresses the iterate back
// down to the target support size.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;
use ndarray::{s, Array2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use fri_rs::bits::{doub_det_parity, find_bits, gen_hf_bitstring, read_bit, sing_det_parity};
use fri_rs::comm::{broadcast, Comm, MpiComm};
use fri_rs::compress::{adjust_shift, comp_sub, find_preserve, sys_comp};
use fri_rs::hamiltonian::{
    diag_matrel, doub_matr_el_nosgn, h_op, hf_doub_trial, sing_matr_el_nosgn, DetermHam,
};
use fri_rs::heat_bath::{self, HDist};
use fri_rs::io;
use fri_rs::symm::{
    count_sing_allowed, count_sing_virt, count_singex, count_symm_virt, doub_ex_symm,
    gen_symm_lookup, virt_from_idx,
};
use fri_rs::vector::DistVec;
use fri_rs::{ceil_bytes, N_IRREPS};

/// Systematic FRI calculation for a molecular system.
#[derive(Parser, Debug)]
#[command(name = "frisys")]
struct Args {
    /// Directory containing sys_params.txt, symm.txt, hcore.txt, eris.txt.
    #[arg(short = 'd', long)]
    hf_path: PathBuf,

    /// Directory in which to save output files.
    #[arg(short = 'y', long, default_value = "./")]
    result_dir: PathBuf,

    /// Target one-norm of the solution vector.
    #[arg(short = 't', long, default_value_t = 0.0)]
    target_norm: f64,

    /// Hamiltonian factorization: HB or HB_unnorm.
    #[arg(short = 'q', long, default_value = "HB")]
    distribution: String,

    /// Target number of nonzero vector elements kept after each iteration.
    #[arg(short = 'm', long)]
    vec_nonz: u32,

    /// Target number of nonzero matrix elements kept after each iteration.
    #[arg(short = 'M', long)]
    mat_nonz: u32,

    /// Maximum number of determinants on a single process.
    #[arg(short = 'p', long)]
    max_dets: usize,

    /// Magnitude a vector element needs to make its determinant an
    /// initiator.
    #[arg(short = 'i', long, default_value_t = 0.0)]
    initiator: f64,

    /// Directory holding checkpoint files from a previous run.
    #[arg(short = 'l', long)]
    load_dir: Option<PathBuf>,

    /// Prefix of the text files (<prefix>dets, <prefix>vals) to initialise
    /// from.
    #[arg(short = 'n', long)]
    ini_vec: Option<String>,

    /// Prefix of the trial-vector files used for the energy estimate.
    #[arg(long)]
    trial_vec: Option<String>,

    /// Build the trial vector from the HF determinant and its double
    /// excitations with first-order perturbation-theory weights instead of
    /// reading it from files.
    #[arg(long, default_value_t = false, conflicts_with = "trial_vec")]
    pt_trial: bool,

    /// Prefix of the sign-vector files used to track the iterate's sign.
    #[arg(long)]
    sign_vec: Option<String>,

    /// Text file listing the determinants of the deterministic subspace.
    #[arg(short = 's', long)]
    det_space: Option<String>,

    /// Number of iterations to run.
    #[arg(long, default_value_t = 1_000_000)]
    max_iter: u32,
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("could not open {} for writing", path.display()))?;
    Ok(BufWriter::new(file))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.vec_nonz == 0 {
        bail!("target number of nonzero vector elements must not be zero");
    }
    if args.mat_nonz == 0 {
        bail!("target number of nonzero matrix elements must not be zero");
    }
    if args.max_dets == 0 {
        bail!("maximum number of determinants per process must not be zero");
    }
    let qmc_dist: HDist = args.distribution.parse()?;
    if qmc_dist == HDist::NearUniform {
        bail!("frisys supports the HB and HB_unnorm factorizations; use fciqmc for NU");
    }
    let unnorm = qmc_dist == HDist::HeatBathUnnorm;

    let universe = mpi::initialize().context("MPI initialization failed")?;
    let comm = MpiComm::new(universe.world());
    let n_procs = comm.n_procs();
    let proc_rank = comm.rank();

    // Fixed parameters of the propagation.
    let shift_damping = 0.05;
    let shift_interval = 10u32;
    let save_interval = 100u32;
    let mut en_shift = 0.0;
    let mut last_norm = 0.0;

    let hf = io::parse_hf_input(&args.hf_path)?;
    let eps = hf.eps;
    let n_orb = hf.n_orb;
    let n_elec_unf = hf.n_elec_unf();
    let det_size = ceil_bytes(hf.n_bits());

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs();
    let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(proc_rank as u64));

    let spawn_length = ((args.mat_nonz as usize * 5 / n_procs).max(16)).min(5_000_000);
    let adder_size = spawn_length.min(1_000_000);

    // Process scrambler: loaded with a checkpoint, otherwise generated on
    // rank 0, persisted, and broadcast.
    let mut proc_scrambler = vec![0u32; hf.n_bits() as usize];
    if let Some(load_dir) = &args.load_dir {
        proc_scrambler = io::load_proc_hash(load_dir, hf.n_bits() as usize)?;
    } else {
        if proc_rank == 0 {
            rng.fill(&mut proc_scrambler[..]);
            io::save_proc_hash(&args.result_dir, &proc_scrambler)?;
        }
        comm.bcast_u32_slice(&mut proc_scrambler);
    }
    let mut vec_scrambler = vec![0u32; hf.n_bits() as usize];
    rng.fill(&mut vec_scrambler[..]);

    let mut sol_vec = DistVec::<f64>::new(
        args.max_dets,
        adder_size,
        hf.n_bits(),
        n_elec_unf,
        n_procs,
        1,
        proc_scrambler.clone(),
        vec_scrambler.clone(),
    );

    let symm_lookup = gen_symm_lookup(&hf.symm);
    let max_n_symm = (0..N_IRREPS)
        .map(|irrep| symm_lookup[(irrep, 0)] as usize)
        .max()
        .unwrap_or(0);

    let mut hf_det = vec![0u8; det_size];
    gen_hf_bitstring(n_orb, n_elec_unf, &mut hf_det);
    let hf_proc = sol_vec.idx_to_proc(&hf_det);
    let mut hf_occ = vec![0u8; n_elec_unf as usize];
    find_bits(&hf_det, &mut hf_occ);

    // Trial vector and H * trial vector, replicated on every process.
    let n_ex = (n_orb as usize).pow(2) * (n_elec_unf as usize).pow(2);
    let (trial_dets, trial_vals) = match &args.trial_vec {
        Some(prefix) if proc_rank == 0 => io::load_vec_txt(prefix, det_size)?,
        Some(_) => (Vec::new(), Vec::new()),
        None if args.pt_trial && proc_rank == 0 => {
            hf_doub_trial(&hf_det, &hf_occ, &hf, det_size)
        }
        None if args.pt_trial => (Vec::new(), Vec::new()),
        None => (hf_det.clone(), vec![1.0]),
    };
    let n_trial_loc = trial_vals.len();
    let mut trial_vec = DistVec::<f64>::new(
        n_trial_loc.max(1),
        n_trial_loc.max(1),
        hf.n_bits(),
        n_elec_unf,
        n_procs,
        1,
        proc_scrambler.clone(),
        vec_scrambler.clone(),
    );
    let mut htrial_vec = DistVec::<f64>::new(
        (n_trial_loc.max(1) * n_ex / n_procs).max(16),
        (n_trial_loc.max(1) * n_ex / n_procs).max(16),
        hf.n_bits(),
        n_elec_unf,
        n_procs,
        1,
        proc_scrambler.clone(),
        vec_scrambler.clone(),
    );
    let add_trial = if args.trial_vec.is_some() || args.pt_trial {
        proc_rank == 0
    } else {
        proc_rank == hf_proc
    };
    if add_trial {
        for (det, &val) in trial_dets.chunks_exact(det_size).zip(trial_vals.iter()) {
            trial_vec.add(det, val, true);
            htrial_vec.add(det, val, true);
        }
    }
    trial_vec.perform_add(0, &comm);
    htrial_vec.perform_add(0, &comm);

    trial_vec.collect_procs(&comm);
    let mut tmp_occ = vec![0u8; n_elec_unf as usize];
    let trial_hashes: Vec<u64> = (0..trial_vec.curr_size())
        .map(|idx| sol_vec.idx_to_hash(trial_vec.idx_at_pos(idx), &mut tmp_occ))
        .collect();

    h_op(&mut htrial_vec, &hf, 0.0, 1.0, &comm)?;
    htrial_vec.collect_procs(&comm);
    let htrial_hashes: Vec<u64> = (0..htrial_vec.curr_size())
        .map(|idx| sol_vec.idx_to_hash(htrial_vec.idx_at_pos(idx), &mut tmp_occ))
        .collect();

    // Sign vector, broadcast so every process can dot against it.
    let (mut sgnv_dets, mut sgnv_vals) = match &args.sign_vec {
        Some(prefix) if proc_rank == 0 => io::load_vec_txt(prefix, det_size)?,
        Some(_) => (Vec::new(), Vec::new()),
        None => (hf_det.clone(), vec![1.0]),
    };
    broadcast(&comm, &mut sgnv_dets);
    broadcast(&comm, &mut sgnv_vals);
    let sgnv_arr = Array2::from_shape_vec((sgnv_vals.len(), det_size), sgnv_dets)
        .expect("sign vector rows are det_size bytes");
    let sgn_hashes: Vec<u64> = (0..sgnv_vals.len())
        .map(|idx| {
            sol_vec.idx_to_hash(
                sgnv_arr.row(idx).to_slice().expect("row-major"),
                &mut tmp_occ,
            )
        })
        .collect();

    // Probability of proposing a double excitation, from the HF counts.
    let mut doub_scratch = vec![[0u8; 4]; fri_rs::symm::count_doub_nosymm(n_elec_unf, n_orb)];
    let n_hf_doub = doub_ex_symm(&hf_det, &hf_occ, n_orb, &mut doub_scratch, &hf.symm);
    let n_hf_sing = count_singex(&hf_det, &hf_occ, &hf.symm, n_orb, &symm_lookup);
    let p_doub = n_hf_doub as f64 / (n_hf_sing + n_hf_doub) as f64;

    // Deterministic subspace, then the starting vector.
    let mut n_determ = 0usize;
    if args.load_dir.is_none() {
        if let Some(determ_path) = &args.det_space {
            n_determ = sol_vec.init_dense(determ_path, &args.result_dir, &comm)?;
        }
    }
    if let Some(load_dir) = &args.load_dir {
        n_determ = sol_vec.load(load_dir, &comm)?;
        en_shift = io::read_last_shift(load_dir)?;
    } else if let Some(ini_prefix) = &args.ini_vec {
        if proc_rank == 0 {
            let (ini_dets, ini_vals) = io::load_vec_txt(ini_prefix, det_size)?;
            for (det, &val) in ini_dets.chunks_exact(det_size).zip(ini_vals.iter()) {
                sol_vec.add(det, val, true);
            }
        }
    } else if proc_rank == hf_proc {
        sol_vec.add(&hf_det, 100.0, true);
    }
    sol_vec.perform_add(0, &comm);
    let mut glob_norm = comm.sum_f64(sol_vec.local_norm());
    if args.load_dir.is_some() {
        last_norm = glob_norm;
    }

    let determ_ham = DetermHam::build(&sol_vec, n_determ, &hf, eps);

    // Output files live on the process owning the HF determinant.
    let mut num_file = None;
    let mut den_file = None;
    let mut shift_file = None;
    let mut norm_file = None;
    let mut nonz_file = None;
    let mut sign_file = None;
    let mut ini_file = None;
    if proc_rank == hf_proc {
        num_file = Some(open_append(&args.result_dir.join("projnum.txt"))?);
        den_file = Some(open_append(&args.result_dir.join("projden.txt"))?);
        shift_file = Some(open_append(&args.result_dir.join("S.txt"))?);
        norm_file = Some(open_append(&args.result_dir.join("norm.txt"))?);
        nonz_file = Some(open_append(&args.result_dir.join("nonz.txt"))?);
        sign_file = Some(open_append(&args.result_dir.join("sign.txt"))?);
        ini_file = Some(open_append(&args.result_dir.join("nini.txt"))?);

        let mut param_f = File::create(args.result_dir.join("params.txt"))?;
        writeln!(
            param_f,
            "FRI calculation\nHF path: {}\nepsilon (imaginary time step): {}\nTarget norm: {}\nInitiator threshold: {}\nMatrix nonzero: {}\nVector nonzero: {}",
            args.hf_path.display(),
            eps,
            args.target_norm,
            args.initiator,
            args.mat_nonz,
            args.vec_nonz
        )?;
        if let Some(load_dir) = &args.load_dir {
            writeln!(param_f, "Restarting calculation from {}", load_dir.display())?;
        } else if let Some(ini_prefix) = &args.ini_vec {
            writeln!(param_f, "Initializing calculation from vector files with prefix {}", ini_prefix)?;
        } else {
            writeln!(param_f, "Initializing calculation from HF unit vector")?;
        }
    }

    // Scratch for the compression chain.
    let max_subwt = (n_elec_unf as usize).max(n_orb as usize).max(max_n_symm).max(2);
    let mut subwt_mem = Array2::<f64>::zeros((spawn_length, max_subwt));
    let mut keep_idx = Array2::<bool>::default((spawn_length, max_subwt));
    let mut ndiv_vec = vec![0u32; spawn_length];
    let mut comp_vec1 = vec![0.0f64; spawn_length];
    let mut comp_vec2 = vec![0.0f64; spawn_length];
    let mut comp_idx = vec![(0usize, 0usize); spawn_length];
    let mut wt_remain = vec![0.0f64; spawn_length];
    let mut sub_sizes = vec![0u16; spawn_length];
    let mut det_indices1 = vec![0usize; spawn_length];
    let mut det_indices2 = vec![0usize; spawn_length];
    let mut orb_indices1 = vec![[0u8; 4]; spawn_length];
    let mut orb_indices2 = vec![[0u8; 4]; spawn_length];
    let mut spawn_dets = vec![0u8; spawn_length * det_size];
    let mut spawn_vals = vec![0.0f64; spawn_length];
    let mut spawn_ini = vec![false; spawn_length];

    let hb_probs = heat_bath::set_up(&hf);

    let mut max_n_dets = sol_vec.max_size();
    let mut srt_arr: Vec<usize> = (0..max_n_dets).collect();
    let mut keep_exact = vec![false; max_n_dets];
    let mut loc_norms = vec![0.0f64; n_procs];

    for iterat in 0..args.max_iter {
        let mut n_ini = 0usize;
        let glob_n_nonz = comm.sum_i64(sol_vec.n_nonz() as i64);
        if glob_n_nonz > args.mat_nonz as i64 {
            log::warn!(
                "target number of matrix samples ({}) is less than the number of nonzero vector elements ({})",
                args.mat_nonz,
                glob_n_nonz
            );
        }

        // Stage 1: singles vs doubles.
        let count = sol_vec.curr_size() - n_determ;
        for det_idx in 0..count {
            let weight = sol_vec.value_at_pos(det_idx + n_determ).abs();
            comp_vec1[det_idx] = weight;
            if weight > 0.0 {
                subwt_mem[(det_idx, 0)] = p_doub;
                subwt_mem[(det_idx, 1)] = 1.0 - p_doub;
                ndiv_vec[det_idx] = 0;
            } else {
                ndiv_vec[det_idx] = 1;
            }
        }
        let mut rn_sys = if proc_rank == 0 { rng.gen_range(0.0..1.0) } else { 0.0 };
        let mut comp_len = comp_sub(
            &comp_vec1[..count],
            &ndiv_vec[..count],
            subwt_mem.slice(s![..count, ..2]),
            &mut keep_idx.slice_mut(s![..count, ..2]),
            None,
            args.mat_nonz,
            &mut wt_remain[..count],
            rn_sys,
            &mut comp_vec2,
            &mut comp_idx,
            &comm,
        );

        // Stage 2: first occupied orbital.
        let n_subwt = n_elec_unf as usize;
        for samp_idx in 0..comp_len {
            let det_idx = comp_idx[samp_idx].0 + n_determ;
            det_indices1[samp_idx] = det_idx;
            orb_indices1[samp_idx][0] = comp_idx[samp_idx].1 as u8;
            let occ: Vec<u8> = sol_vec.orbs_at_pos(det_idx).to_vec();
            if orb_indices1[samp_idx][0] == 0 {
                // Double excitation.
                ndiv_vec[samp_idx] = 0;
                let row = subwt_mem
                    .slice_mut(s![samp_idx, ..n_subwt])
                    .into_slice()
                    .expect("row-major scratch");
                let tot_weight = hb_probs.calc_o1_probs(&occ, row);
                if unnorm {
                    comp_vec2[samp_idx] *= tot_weight;
                }
            } else {
                let virt_counts = count_symm_virt(&occ, n_orb, &symm_lookup, &hf.symm);
                let n_occ = count_sing_allowed(&occ, &hf.symm, n_orb, &virt_counts);
                if n_occ == 0 {
                    ndiv_vec[samp_idx] = 1;
                    comp_vec2[samp_idx] = 0.0;
                } else {
                    ndiv_vec[samp_idx] = n_occ;
                }
            }
        }
        rn_sys = if proc_rank == 0 { rng.gen_range(0.0..1.0) } else { 0.0 };
        comp_len = comp_sub(
            &comp_vec2[..comp_len],
            &ndiv_vec[..comp_len],
            subwt_mem.slice(s![..comp_len, ..n_subwt]),
            &mut keep_idx.slice_mut(s![..comp_len, ..n_subwt]),
            None,
            args.mat_nonz,
            &mut wt_remain[..comp_len],
            rn_sys,
            &mut comp_vec1,
            &mut comp_idx,
            &comm,
        );

        // Stage 3: second occupied orbital (doubles); virtual count
        // (singles).
        for samp_idx in 0..comp_len {
            let weight_idx = comp_idx[samp_idx].0;
            let det_idx = det_indices1[weight_idx];
            det_indices2[samp_idx] = det_idx;
            orb_indices2[samp_idx][0] = orb_indices1[weight_idx][0];
            orb_indices2[samp_idx][1] = comp_idx[samp_idx].1 as u8;
            let occ: Vec<u8> = sol_vec.orbs_at_pos(det_idx).to_vec();
            if orb_indices2[samp_idx][0] == 0 {
                ndiv_vec[samp_idx] = 0;
                let row = subwt_mem
                    .slice_mut(s![samp_idx, ..n_subwt])
                    .into_slice()
                    .expect("row-major scratch");
                let mut o1_io = orb_indices2[samp_idx][1];
                let tot_weight = hb_probs.calc_o2_probs(&occ, &mut o1_io, row);
                orb_indices2[samp_idx][1] = o1_io;
                if unnorm {
                    comp_vec1[samp_idx] *= tot_weight;
                }
            } else {
                let virt_counts = count_symm_virt(&occ, n_orb, &symm_lookup, &hf.symm);
                let mut occ_choice = orb_indices2[samp_idx][1];
                let n_virt =
                    count_sing_virt(&occ, &hf.symm, n_orb, &virt_counts, &mut occ_choice);
                orb_indices2[samp_idx][1] = occ_choice;
                if n_virt == 0 {
                    ndiv_vec[samp_idx] = 1;
                    comp_vec1[samp_idx] = 0.0;
                } else {
                    ndiv_vec[samp_idx] = n_virt;
                    orb_indices2[samp_idx][3] = n_virt as u8;
                }
            }
        }
        rn_sys = if proc_rank == 0 { rng.gen_range(0.0..1.0) } else { 0.0 };
        comp_len = comp_sub(
            &comp_vec1[..comp_len],
            &ndiv_vec[..comp_len],
            subwt_mem.slice(s![..comp_len, ..n_subwt]),
            &mut keep_idx.slice_mut(s![..comp_len, ..n_subwt]),
            None,
            args.mat_nonz,
            &mut wt_remain[..comp_len],
            rn_sys,
            &mut comp_vec2,
            &mut comp_idx,
            &comm,
        );

        // Stage 4: first virtual orbital (doubles only).
        let n_subwt = n_orb as usize;
        for samp_idx in 0..comp_len {
            let weight_idx = comp_idx[samp_idx].0;
            let det_idx = det_indices2[weight_idx];
            det_indices1[samp_idx] = det_idx;
            orb_indices1[samp_idx][0] = orb_indices2[weight_idx][0];
            let o1_orb = orb_indices2[weight_idx][1];
            orb_indices1[samp_idx][1] = o1_orb;
            if orb_indices1[samp_idx][0] == 0 {
                ndiv_vec[samp_idx] = 0;
                let occ_tmp: Vec<u8> = sol_vec.orbs_at_pos(det_idx).to_vec();
                orb_indices1[samp_idx][2] = occ_tmp[comp_idx[samp_idx].1];
                let det: Vec<u8> = sol_vec.idx_at_pos(det_idx).to_vec();
                let row = subwt_mem
                    .slice_mut(s![samp_idx, ..n_subwt])
                    .into_slice()
                    .expect("row-major scratch");
                let tot_weight = hb_probs.calc_u1_probs(o1_orb, &det, row);
                if unnorm {
                    comp_vec2[samp_idx] *= tot_weight;
                }
            } else {
                orb_indices1[samp_idx][2] = comp_idx[samp_idx].1 as u8;
                orb_indices1[samp_idx][3] = orb_indices2[weight_idx][3];
                ndiv_vec[samp_idx] = 1;
            }
        }
        rn_sys = if proc_rank == 0 { rng.gen_range(0.0..1.0) } else { 0.0 };
        comp_len = comp_sub(
            &comp_vec2[..comp_len],
            &ndiv_vec[..comp_len],
            subwt_mem.slice(s![..comp_len, ..n_subwt]),
            &mut keep_idx.slice_mut(s![..comp_len, ..n_subwt]),
            None,
            args.mat_nonz,
            &mut wt_remain[..comp_len],
            rn_sys,
            &mut comp_vec1,
            &mut comp_idx,
            &comm,
        );

        // Stage 5: second virtual orbital within the symmetry-forced irrep.
        let n_subwt = max_subwt;
        for samp_idx in 0..comp_len {
            let weight_idx = comp_idx[samp_idx].0;
            let det_idx = det_indices1[weight_idx];
            det_indices2[samp_idx] = det_idx;
            orb_indices2[samp_idx][0] = orb_indices1[weight_idx][0];
            let o1_orb = orb_indices1[weight_idx][1];
            orb_indices2[samp_idx][1] = o1_orb;
            let o2_orb = orb_indices1[weight_idx][2];
            orb_indices2[samp_idx][2] = o2_orb;
            if orb_indices2[samp_idx][0] == 0 {
                let u1_orb =
                    comp_idx[samp_idx].1 as u8 + n_orb as u8 * (o1_orb / n_orb as u8);
                if read_bit(sol_vec.idx_at_pos(det_idx), u1_orb) {
                    comp_vec1[samp_idx] = 0.0;
                    ndiv_vec[samp_idx] = 1;
                    sub_sizes[samp_idx] = 1;
                } else {
                    ndiv_vec[samp_idx] = 0;
                    orb_indices2[samp_idx][3] = u1_orb;
                    let row = subwt_mem
                        .slice_mut(s![samp_idx, ..n_subwt])
                        .into_slice()
                        .expect("row-major scratch");
                    let (tot_weight, n_sub) = hb_probs.calc_u2_probs(
                        &hf.symm,
                        &symm_lookup,
                        o1_orb,
                        o2_orb,
                        u1_orb,
                        row,
                    );
                    sub_sizes[samp_idx] = n_sub.max(1);
                    if unnorm || tot_weight == 0.0 {
                        comp_vec1[samp_idx] *= tot_weight;
                    }
                }
            } else {
                orb_indices2[samp_idx][3] = orb_indices1[weight_idx][3];
                ndiv_vec[samp_idx] = 1;
                sub_sizes[samp_idx] = 1;
            }
        }
        rn_sys = if proc_rank == 0 { rng.gen_range(0.0..1.0) } else { 0.0 };
        comp_len = comp_sub(
            &comp_vec1[..comp_len],
            &ndiv_vec[..comp_len],
            subwt_mem.slice(s![..comp_len, ..n_subwt]),
            &mut keep_idx.slice_mut(s![..comp_len, ..n_subwt]),
            Some(&sub_sizes[..comp_len]),
            args.mat_nonz,
            &mut wt_remain[..comp_len],
            rn_sys,
            &mut comp_vec2,
            &mut comp_idx,
            &comm,
        );

        // Assemble the surviving spawns with matrix elements, signs, and
        // proposal-probability corrections.
        let mut num_added = 0usize;
        for samp_idx in 0..comp_len {
            let weight_idx = comp_idx[samp_idx].0;
            let det_idx = det_indices2[weight_idx];
            let curr_el = sol_vec.value_at_pos(det_idx);
            let ini_flag = curr_el.abs() > args.initiator;
            let el_sign = curr_el.signum();
            let curr_det: Vec<u8> = sol_vec.idx_at_pos(det_idx).to_vec();
            let occ: Vec<u8> = sol_vec.orbs_at_pos(det_idx).to_vec();

            if orb_indices2[weight_idx][0] == 0 {
                // Double excitation.
                let mut doub_orbs = [
                    orb_indices2[weight_idx][1],
                    orb_indices2[weight_idx][2],
                    orb_indices2[weight_idx][3],
                    0,
                ];
                let u2_symm = hf.symm[(doub_orbs[0] % n_orb as u8) as usize]
                    ^ hf.symm[(doub_orbs[1] % n_orb as u8) as usize]
                    ^ hf.symm[(doub_orbs[2] % n_orb as u8) as usize];
                doub_orbs[3] = symm_lookup[(u2_symm as usize, comp_idx[samp_idx].1 + 1)]
                    + n_orb as u8 * (doub_orbs[1] / n_orb as u8);
                // Chosen virtual already occupied: unsuccessful draw.
                if read_bit(&curr_det, doub_orbs[3]) || doub_orbs[2] == doub_orbs[3] {
                    continue;
                }
                if doub_orbs[2] > doub_orbs[3] {
                    doub_orbs.swap(2, 3);
                }
                if doub_orbs[0] > doub_orbs[1] {
                    doub_orbs.swap(0, 1);
                }
                let mut matr_el = doub_matr_el_nosgn(&doub_orbs, &hf);
                if matr_el.abs() > 1e-9 && comp_vec2[samp_idx].abs() > 1e-9 {
                    let tot_weight = if unnorm {
                        hb_probs.calc_unnorm_wt(&doub_orbs)
                    } else {
                        hb_probs.calc_norm_wt(&doub_orbs, &occ, &curr_det, &symm_lookup, &hf.symm)
                    };
                    let new_det =
                        &mut spawn_dets[num_added * det_size..(num_added + 1) * det_size];
                    new_det.copy_from_slice(&curr_det);
                    matr_el *= -eps / p_doub / tot_weight * el_sign * comp_vec2[samp_idx];
                    matr_el *= doub_det_parity(new_det, &doub_orbs) as f64;
                    spawn_vals[num_added] = matr_el;
                    spawn_ini[num_added] = ini_flag;
                    num_added += 1;
                }
            } else {
                // Single excitation.
                let o1_orb = orb_indices2[weight_idx][1];
                let u1_symm = hf.symm[(o1_orb % n_orb as u8) as usize] as usize;
                let row = symm_lookup.row(u1_symm);
                let Some(virt) = virt_from_idx(
                    &curr_det,
                    row.to_slice().expect("row-major lookup"),
                    n_orb as u8 * (o1_orb / n_orb as u8),
                    orb_indices2[weight_idx][2] as u32,
                ) else {
                    continue;
                };
                let sing_orbs = [o1_orb, virt];
                let mut matr_el = sing_matr_el_nosgn(&sing_orbs, &occ, &hf);
                if matr_el.abs() > 1e-9 && comp_vec2[samp_idx].abs() > 1e-9 {
                    let virt_counts = count_symm_virt(&occ, n_orb, &symm_lookup, &hf.symm);
                    let n_occ = count_sing_allowed(&occ, &hf.symm, n_orb, &virt_counts);
                    let new_det =
                        &mut spawn_dets[num_added * det_size..(num_added + 1) * det_size];
                    new_det.copy_from_slice(&curr_det);
                    matr_el *= -eps / (1.0 - p_doub)
                        * n_occ as f64
                        * orb_indices2[weight_idx][3] as f64
                        * el_sign
                        * comp_vec2[samp_idx]
                        * sing_det_parity(new_det, &sing_orbs) as f64;
                    spawn_vals[num_added] = matr_el;
                    spawn_ini[num_added] = ini_flag;
                    num_added += 1;
                }
            }
        }

        // Exact multiplication over the deterministic subspace.
        determ_ham.apply(&mut sol_vec);

        // Death/cloning on the diagonal; deletions wait for the
        // compression step.
        for det_idx in 0..sol_vec.curr_size() {
            let curr_el = sol_vec.value_at_pos(det_idx);
            if curr_el != 0.0 {
                if curr_el.abs() > args.initiator {
                    n_ini += 1;
                }
                let diag = sol_vec.diag_el_at_pos(det_idx, |occ| diag_matrel(occ, &hf) - hf.hf_en);
                sol_vec.set_value_at_pos(det_idx, curr_el * (1.0 - eps * (diag - en_shift)));
            }
        }

        // Distribute the spawned walkers, flushing as often as the staging
        // buffers require.
        let comp_total = num_added;
        let mut staged = determ_ham.len();
        let mut samp_idx = 0usize;
        loop {
            while samp_idx < comp_total && staged < adder_size {
                let det = &spawn_dets[samp_idx * det_size..(samp_idx + 1) * det_size];
                sol_vec.add(det, spawn_vals[samp_idx], spawn_ini[samp_idx]);
                staged += 1;
                samp_idx += 1;
            }
            sol_vec.perform_add(0, &comm);
            let glob_staged = comm.sum_i64(staged as i64);
            staged = 0;
            if glob_staged == 0 {
                break;
            }
        }

        let new_max_dets = sol_vec.max_size();
        if new_max_dets > max_n_dets {
            keep_exact.resize(new_max_dets, false);
            srt_arr = (0..new_max_dets).collect();
            max_n_dets = new_max_dets;
        }

        // Compress the iterate back down to the target support.
        let mut n_samp = args.vec_nonz;
        let count = sol_vec.curr_size() - n_determ;
        srt_arr[..count]
            .iter_mut()
            .enumerate()
            .for_each(|(idx, slot)| *slot = idx);
        let (loc_norm, stoch_norm) = find_preserve(
            sol_vec.values_mut(n_determ),
            &mut srt_arr[..count],
            &mut keep_exact[..count],
            &mut n_samp,
            &comm,
        );
        glob_norm = stoch_norm + sol_vec.dense_norm(&comm);
        if let Some(f) = nonz_file.as_mut() {
            writeln!(f, "{}", args.vec_nonz - n_samp)?;
        }

        if (iterat + 1) % shift_interval == 0 {
            adjust_shift(
                &mut en_shift,
                glob_norm,
                &mut last_norm,
                args.target_norm,
                shift_damping / shift_interval as f64 / eps,
            );
            if let Some(f) = shift_file.as_mut() {
                writeln!(f, "{}", en_shift)?;
            }
            if let Some(f) = norm_file.as_mut() {
                writeln!(f, "{}", glob_norm)?;
            }
        }

        // Projected energy estimate.
        let numer = sol_vec.dot(htrial_vec.indices(), htrial_vec.values(), &htrial_hashes);
        let denom = sol_vec.dot(trial_vec.indices(), trial_vec.values(), &trial_hashes);
        let glob_ini = comm.sum_i64(n_ini as i64);
        let mut recv_nums = vec![0.0f64; n_procs];
        let mut recv_dens = vec![0.0f64; n_procs];
        comm.gather_f64(numer, hf_proc, &mut recv_nums);
        comm.gather_f64(denom, hf_proc, &mut recv_dens);
        if proc_rank == hf_proc {
            let numer: f64 = recv_nums.iter().sum();
            let denom: f64 = recv_dens.iter().sum();
            if let Some(f) = num_file.as_mut() {
                writeln!(f, "{}", numer)?;
            }
            if let Some(f) = den_file.as_mut() {
                writeln!(f, "{}", denom)?;
            }
            println!(
                "{:6}, en est: {:.9}, shift: {:.6}, norm: {:.6}",
                iterat,
                numer / denom,
                en_shift,
                glob_norm
            );
            if let Some(f) = ini_file.as_mut() {
                writeln!(f, "{}", glob_ini)?;
            }
        }

        // Sign of the iterate against the fixed sign vector.
        let sgn = sol_vec.dot(sgnv_arr.view(), &sgnv_vals, &sgn_hashes);
        comm.gather_f64(sgn, hf_proc, &mut recv_nums);
        if proc_rank == hf_proc {
            if let Some(f) = sign_file.as_mut() {
                writeln!(f, "{}", recv_nums.iter().sum::<f64>())?;
            }
        }

        // Systematic resampling of the un-kept elements, then deletion of
        // the zeroed positions (the HF determinant is never deleted).
        rn_sys = if proc_rank == 0 { rng.gen_range(0.0..1.0) } else { 0.0 };
        comm.allgather_f64(loc_norm, &mut loc_norms);
        sys_comp(
            sol_vec.values_mut(n_determ),
            &mut loc_norms,
            n_samp,
            &mut keep_exact[..count],
            rn_sys,
            &comm,
        );
        for det_idx in 0..count {
            if keep_exact[det_idx] {
                if sol_vec.idx_at_pos(det_idx + n_determ) != &hf_det[..] {
                    sol_vec.del_at_pos(det_idx + n_determ);
                }
                keep_exact[det_idx] = false;
            }
        }

        if (iterat + 1) % save_interval == 0 {
            sol_vec.save(&args.result_dir, &comm)?;
            let sgn_coh = sol_vec.tot_sgn_coh(&comm);
            if proc_rank == hf_proc {
                log::info!(
                    "cumulative noninitiator additions onto occupied determinants: {}",
                    sgn_coh
                );
            }
            for f in [
                num_file.as_mut(),
                den_file.as_mut(),
                shift_file.as_mut(),
                norm_file.as_mut(),
                nonz_file.as_mut(),
                sign_file.as_mut(),
                ini_file.as_mut(),
            ]
            .into_iter()
            .flatten()
            {
                f.flush()?;
            }
        }
    }
    sol_vec.save(&args.result_dir, &comm)?;
    Ok(())
}
