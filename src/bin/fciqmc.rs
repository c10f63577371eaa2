// fciqmc.rs
//
// Integer-walker FCIQMC for a molecular Hamiltonian: walkers on each
// occupied determinant propose single and double excitations through the
// near-uniform or heat-bath factorization, spawned walkers are rounded
// binomially and annihilated on arrival, and the diagonal applies
// death/cloning. The shift tracks the total walker population once it
// exceeds the target.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use fri_rs::bits::{doub_det_parity, find_bits, gen_hf_bitstring, sing_det_parity};
use fri_rs::comm::{broadcast, Comm, MpiComm};
use fri_rs::compress::{adjust_shift, round_binomially};
use fri_rs::hamiltonian::{diag_matrel, doub_matr_el_nosgn, h_op, hf_doub_trial, sing_matr_el_nosgn};
use fri_rs::heat_bath::{self, HDist};
use fri_rs::io;
use fri_rs::near_uniform::{bin_sample, doub_multin, sing_multin};
use fri_rs::symm::{count_doub_nosymm, count_singex, count_symm_virt, doub_ex_symm, gen_symm_lookup};
use fri_rs::vector::DistVec;
use fri_rs::ceil_bytes;

/// FCIQMC calculation for a molecular system.
#[derive(Parser, Debug)]
#[command(name = "fciqmc")]
struct Args {
    /// Directory containing sys_params.txt, symm.txt, hcore.txt, eris.txt.
    #[arg(short = 'd', long)]
    hf_path: PathBuf,

    /// Directory in which to save output files.
    #[arg(short = 'y', long, default_value = "./")]
    result_dir: PathBuf,

    /// Target total walker population.
    #[arg(short = 't', long)]
    target_walkers: u32,

    /// Excitation proposal distribution: NU or HB.
    #[arg(short = 'q', long, default_value = "NU")]
    distribution: String,

    /// Maximum number of determinants on a single process.
    #[arg(short = 'p', long)]
    max_dets: usize,

    /// Walker population needed to make a determinant an initiator.
    #[arg(short = 'i', long, default_value_t = 0)]
    initiator: u32,

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
    if args.target_walkers == 0 {
        bail!("target number of walkers must not be zero");
    }
    if args.max_dets == 0 {
        bail!("maximum number of determinants per process must not be zero");
    }
    let qmc_dist: HDist = args.distribution.parse()?;
    if qmc_dist == HDist::HeatBathUnnorm {
        bail!("fciqmc supports the NU and HB distributions");
    }

    let universe = mpi::initialize().context("MPI initialization failed")?;
    let comm = MpiComm::new(universe.world());
    let n_procs = comm.n_procs();
    let proc_rank = comm.rank();

    let shift_damping = 0.05;
    let shift_interval = 10u32;
    let save_interval = 1000u32;
    let mut en_shift = 0.0;
    let mut last_norm = 0.0;
    let target_norm = args.target_walkers as f64;

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

    let spawn_length = (args.target_walkers as usize / n_procs / n_procs * 2).max(1000);

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

    let mut sol_vec = DistVec::<i32>::new(
        args.max_dets,
        spawn_length,
        hf.n_bits(),
        n_elec_unf,
        n_procs,
        1,
        proc_scrambler.clone(),
        vec_scrambler.clone(),
    );

    let symm_lookup = gen_symm_lookup(&hf.symm);

    let mut hf_det = vec![0u8; det_size];
    gen_hf_bitstring(n_orb, n_elec_unf, &mut hf_det);
    let hf_proc = sol_vec.idx_to_proc(&hf_det);
    let mut hf_occ = vec![0u8; n_elec_unf as usize];
    find_bits(&hf_det, &mut hf_occ);

    // Trial vector and H * trial vector.
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

    // Probability of proposing a double excitation.
    let mut doub_scratch = vec![[0u8; 4]; count_doub_nosymm(n_elec_unf, n_orb)];
    let n_hf_doub = doub_ex_symm(&hf_det, &hf_occ, n_orb, &mut doub_scratch, &hf.symm);
    let n_hf_sing = count_singex(&hf_det, &hf_occ, &hf.symm, n_orb, &symm_lookup);
    let p_doub = n_hf_doub as f64 / (n_hf_sing + n_hf_doub) as f64;

    // Starting population.
    if let Some(load_dir) = &args.load_dir {
        sol_vec.load(load_dir, &comm)?;
        en_shift = io::read_last_shift(load_dir)?;
    } else if let Some(ini_prefix) = &args.ini_vec {
        if proc_rank == 0 {
            let (ini_dets, ini_vals) = io::load_vec_txt(ini_prefix, det_size)?;
            for (det, &val) in ini_dets.chunks_exact(det_size).zip(ini_vals.iter()) {
                sol_vec.add(det, val as i32, true);
            }
        }
    } else if proc_rank == hf_proc {
        sol_vec.add(&hf_det, 100, true);
    }
    sol_vec.perform_add(0, &comm);
    let mut glob_norm = comm.sum_f64(sol_vec.local_norm());
    if args.load_dir.is_some() {
        last_norm = glob_norm;
    }

    let mut num_file = None;
    let mut den_file = None;
    let mut shift_file = None;
    let mut walk_file = None;
    let mut nonz_file = None;
    let mut sign_file = None;
    if proc_rank == hf_proc {
        num_file = Some(open_append(&args.result_dir.join("projnum.txt"))?);
        den_file = Some(open_append(&args.result_dir.join("projden.txt"))?);
        shift_file = Some(open_append(&args.result_dir.join("S.txt"))?);
        walk_file = Some(open_append(&args.result_dir.join("N.txt"))?);
        nonz_file = Some(open_append(&args.result_dir.join("nonz.txt"))?);
        sign_file = Some(open_append(&args.result_dir.join("sign.txt"))?);

        let mut param_f = File::create(args.result_dir.join("params.txt"))?;
        writeln!(
            param_f,
            "FCIQMC calculation\nHF path: {}\nepsilon (imaginary time step): {}\nTarget number of walkers: {}\nInitiator threshold: {}",
            args.hf_path.display(),
            eps,
            args.target_walkers,
            args.initiator
        )?;
        if let Some(load_dir) = &args.load_dir {
            writeln!(param_f, "Restarting calculation from {}", load_dir.display())?;
        } else if let Some(ini_prefix) = &args.ini_vec {
            writeln!(param_f, "Initializing calculation from vector files with prefix {}", ini_prefix)?;
        } else {
            writeln!(param_f, "Initializing calculation from HF unit vector")?;
        }
    }

    let hb_probs = (qmc_dist == HDist::HeatBath).then(|| heat_bath::set_up(&hf));

    let mut spawn_orbs: Vec<[u8; 4]> = Vec::new();
    let mut sing_orbs: Vec<[u8; 2]> = Vec::new();
    let mut spawn_probs: Vec<f64> = Vec::new();
    let mut new_det = vec![0u8; det_size];

    for iterat in 0..args.max_iter {
        let mut n_nonz = 0i64;
        for det_idx in 0..sol_vec.curr_size() {
            let curr_el = sol_vec.value_at_pos(det_idx);
            let n_walk = curr_el.unsigned_abs();
            if n_walk == 0 {
                continue;
            }
            n_nonz += 1;
            let ini_flag = n_walk > args.initiator;
            let walk_sign = curr_el.signum();
            let curr_det: Vec<u8> = sol_vec.idx_at_pos(det_idx).to_vec();
            let occ: Vec<u8> = sol_vec.orbs_at_pos(det_idx).to_vec();
            let virt_counts = count_symm_virt(&occ, n_orb, &symm_lookup, &hf.symm);

            // Split walkers between double and single proposals.
            let n_doub = bin_sample(n_walk, p_doub, &mut rng);
            let n_sing = n_walk - n_doub;
            if n_doub as usize > spawn_orbs.len() {
                spawn_orbs.resize(n_doub as usize, [0u8; 4]);
            }
            if n_sing as usize > sing_orbs.len() {
                sing_orbs.resize(n_sing as usize, [0u8; 2]);
            }
            let max_probs = spawn_orbs.len().max(sing_orbs.len());
            if spawn_probs.len() < max_probs {
                spawn_probs.resize(max_probs, 0.0);
            }

            let n_doub = match &hb_probs {
                Some(hb) => hb.hb_doub_multi(
                    &curr_det,
                    &occ,
                    &hf.symm,
                    &symm_lookup,
                    n_doub,
                    &mut rng,
                    &mut spawn_orbs,
                    &mut spawn_probs,
                ),
                None => doub_multin(
                    &curr_det,
                    &occ,
                    n_orb,
                    &symm_lookup,
                    &hf.symm,
                    &virt_counts,
                    n_doub,
                    &mut rng,
                    &mut spawn_orbs,
                    &mut spawn_probs,
                ),
            };
            for walker_idx in 0..n_doub {
                let matr_el = doub_matr_el_nosgn(&spawn_orbs[walker_idx], &hf) * eps
                    / spawn_probs[walker_idx]
                    / p_doub;
                let spawn_walker = round_binomially(matr_el, 1, &mut rng);
                if spawn_walker != 0 {
                    new_det.copy_from_slice(&curr_det);
                    let parity = doub_det_parity(&mut new_det, &spawn_orbs[walker_idx]);
                    sol_vec.add(&new_det, -spawn_walker * parity * walk_sign, ini_flag);
                }
            }

            let n_sing = sing_multin(
                &curr_det,
                &occ,
                n_orb,
                &symm_lookup,
                &hf.symm,
                &virt_counts,
                n_sing,
                &mut rng,
                &mut sing_orbs,
                &mut spawn_probs,
            );
            for walker_idx in 0..n_sing {
                let matr_el = sing_matr_el_nosgn(&sing_orbs[walker_idx], &occ, &hf) * eps
                    / spawn_probs[walker_idx]
                    / (1.0 - p_doub);
                let spawn_walker = round_binomially(matr_el, 1, &mut rng);
                if spawn_walker != 0 {
                    new_det.copy_from_slice(&curr_det);
                    let parity = sing_det_parity(&mut new_det, &sing_orbs[walker_idx]);
                    sol_vec.add(&new_det, -spawn_walker * parity * walk_sign, ini_flag);
                }
            }

            // Death/cloning on the diagonal.
            let diag = sol_vec.diag_el_at_pos(det_idx, |occ| diag_matrel(occ, &hf) - hf.hf_en);
            let death_el = (1.0 - eps * (diag - en_shift)) * walk_sign as f64;
            let new_val = round_binomially(death_el, n_walk, &mut rng);
            sol_vec.set_value_at_pos(det_idx, new_val);
            if new_val == 0 && sol_vec.idx_at_pos(det_idx) != &hf_det[..] {
                sol_vec.del_at_pos(det_idx);
            }
        }
        sol_vec.perform_add(0, &comm);

        if (iterat + 1) % shift_interval == 0 {
            glob_norm = comm.sum_f64(sol_vec.local_norm());
            adjust_shift(
                &mut en_shift,
                glob_norm,
                &mut last_norm,
                target_norm,
                shift_damping / eps / shift_interval as f64,
            );
            let glob_nnonz = comm.sum_i64(n_nonz);
            if proc_rank == hf_proc {
                if let Some(f) = walk_file.as_mut() {
                    writeln!(f, "{}", glob_norm as u64)?;
                }
                if let Some(f) = shift_file.as_mut() {
                    writeln!(f, "{}", en_shift)?;
                }
                if let Some(f) = nonz_file.as_mut() {
                    writeln!(f, "{}", glob_nnonz)?;
                }
            }
        }

        // Projected energy estimate.
        let numer = sol_vec.dot(htrial_vec.indices(), htrial_vec.values(), &htrial_hashes);
        let denom = sol_vec.dot(trial_vec.indices(), trial_vec.values(), &trial_hashes);
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
                "{:6}, n walk: {:7}, en est: {:.9}, shift: {:.6}",
                iterat,
                glob_norm as u64,
                numer / denom,
                en_shift
            );
        }

        let sgn = sol_vec.dot(sgnv_arr.view(), &sgnv_vals, &sgn_hashes);
        comm.gather_f64(sgn, hf_proc, &mut recv_nums);
        if proc_rank == hf_proc {
            if let Some(f) = sign_file.as_mut() {
                writeln!(f, "{}", recv_nums.iter().sum::<f64>())?;
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
                walk_file.as_mut(),
                nonz_file.as_mut(),
                sign_file.as_mut(),
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
