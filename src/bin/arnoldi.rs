// arnoldi.rs
//
// Randomized subspace (Arnoldi-like) iteration for excited states. All
// iterates share one index set: a single distributed vector stores
// 2 * n_trial value rows, a current half and a next half that swap roles
// every iteration. Each outer iteration normalises the iterates, records
// their overlaps with the trial vectors, compresses them, applies
// (I - eps * H), records the propagated overlaps, and periodically restarts
// by recombining the iterates through a generalised eigendecomposition or a
// matrix inverse.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use fri_rs::ceil_bytes;
use fri_rs::comm::{Comm, MpiComm};
use fri_rs::compress::{find_preserve, sys_comp};
use fri_rs::hamiltonian::{h_op_diag, h_op_offdiag};
use fri_rs::io;
use fri_rs::subspace::{restart_matrix, NormTechnique, RestartTechnique};
use fri_rs::vector::DistVec;

/// Randomized Arnoldi method for excited-state energies.
#[derive(Parser, Debug)]
#[command(name = "arnoldi")]
struct Args {
    /// Directory containing sys_params.txt, symm.txt, hcore.txt, eris.txt.
    #[arg(short = 'd', long)]
    hf_path: PathBuf,

    /// Directory in which to save output files.
    #[arg(short = 'y', long, default_value = "./")]
    result_dir: PathBuf,

    /// Target number of nonzero elements per iterate after compression.
    #[arg(short = 'm', long)]
    vec_nonz: u32,

    /// Maximum number of determinants on a single process.
    #[arg(short = 'p', long)]
    max_dets: usize,

    /// Prefix of the trial-vector files (<prefix><xx>dets, <prefix><xx>vals
    /// for xx in 00..n_trial - 1).
    #[arg(short = 'v', long)]
    trial_vecs: String,

    /// Prefix of the files initialising the iterates; defaults to the trial
    /// vectors.
    #[arg(short = 'n', long)]
    ini_vecs: Option<String>,

    /// Number of trial vectors and iterates.
    #[arg(short = 'k', long)]
    num_trial: usize,

    /// Number of outer iterations to run.
    #[arg(short = 'I', long, default_value_t = 1_000_000)]
    max_iter: u32,

    /// Number of iterations between restarts.
    #[arg(long, default_value_t = 10)]
    restart_int: u32,

    #[arg(long, value_enum, default_value = "eig")]
    restart_technique: RestartTechnique,

    #[arg(long, value_enum, default_value = "1-norm")]
    norm_technique: NormTechnique,
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
    if args.max_dets == 0 {
        bail!("maximum number of determinants per process must not be zero");
    }
    if args.num_trial < 2 {
        bail!("fewer than two trial vectors; use the power method (frisys) instead");
    }
    if args.restart_int == 0 {
        bail!("restart interval must not be zero");
    }
    let n_trial = args.num_trial;

    let universe = mpi::initialize().context("MPI initialization failed")?;
    let comm = MpiComm::new(universe.world());
    let n_procs = comm.n_procs();
    let proc_rank = comm.rank();

    let hf = io::parse_hf_input(&args.hf_path)?;
    let eps = hf.eps;
    let n_elec_unf = hf.n_elec_unf();
    let det_size = ceil_bytes(hf.n_bits());

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs();
    let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(proc_rank as u64));

    let mut proc_scrambler = vec![0u32; hf.n_bits() as usize];
    if proc_rank == 0 {
        rng.fill(&mut proc_scrambler[..]);
        io::save_proc_hash(&args.result_dir, &proc_scrambler)?;
    }
    comm.bcast_u32_slice(&mut proc_scrambler);
    let mut vec_scrambler = vec![0u32; hf.n_bits() as usize];
    rng.fill(&mut vec_scrambler[..]);

    // One vector with a current half and a next half of value rows.
    let adder_size = (args.max_dets / 2).max(1000);
    let mut sol_vec = DistVec::<f64>::new(
        args.max_dets,
        adder_size,
        hf.n_bits(),
        n_elec_unf,
        n_procs,
        2 * n_trial,
        proc_scrambler.clone(),
        vec_scrambler.clone(),
    );

    // Trial vectors, replicated everywhere, with precomputed hashes against
    // the iterate's table.
    let mut trial_vecs = Vec::with_capacity(n_trial);
    let mut trial_hashes = Vec::with_capacity(n_trial);
    let mut tmp_occ = vec![0u8; n_elec_unf as usize];
    for trial_idx in 0..n_trial {
        let prefix = format!("{}{:02}", args.trial_vecs, trial_idx);
        let (dets, vals) = if proc_rank == 0 {
            io::load_vec_txt(&prefix, det_size)?
        } else {
            (Vec::new(), Vec::new())
        };
        let mut trial = DistVec::<f64>::new(
            vals.len().max(1),
            vals.len().max(1),
            hf.n_bits(),
            n_elec_unf,
            n_procs,
            1,
            proc_scrambler.clone(),
            vec_scrambler.clone(),
        );
        for (det, &val) in dets.chunks_exact(det_size).zip(vals.iter()) {
            trial.add(det, val, true);
        }
        trial.perform_add(0, &comm);
        trial.collect_procs(&comm);
        let hashes: Vec<u64> = (0..trial.curr_size())
            .map(|idx| sol_vec.idx_to_hash(trial.idx_at_pos(idx), &mut tmp_occ))
            .collect();
        trial_vecs.push(trial);
        trial_hashes.push(hashes);
    }

    // Initialise the iterates in the first half.
    let ini_prefix = args.ini_vecs.as_ref().unwrap_or(&args.trial_vecs);
    for vec_idx in 0..n_trial {
        let prefix = format!("{}{:02}", ini_prefix, vec_idx);
        let (dets, vals) = if proc_rank == 0 {
            io::load_vec_txt(&prefix, det_size)?
        } else {
            (Vec::new(), Vec::new())
        };
        sol_vec.set_curr_vec_idx(vec_idx)?;
        for (det, &val) in dets.chunks_exact(det_size).zip(vals.iter()) {
            sol_vec.add(det, val, true);
        }
        sol_vec.perform_add(vec_idx, &comm);
    }

    let mut bmat_file = None;
    let mut dmat_file = None;
    if proc_rank == 0 {
        bmat_file = Some(open_append(&args.result_dir.join("b_matrix.txt"))?);
        dmat_file = Some(open_append(&args.result_dir.join("d_matrix.txt"))?);

        let mut param_f = File::create(args.result_dir.join("params.txt"))?;
        writeln!(
            param_f,
            "Arnoldi calculation\nHF path: {}\nepsilon (imaginary time step): {}\nVector nonzero: {}\nTrial vectors: {}\nRestart interval: {}",
            args.hf_path.display(),
            eps,
            args.vec_nonz,
            n_trial,
            args.restart_int
        )?;
    }

    let mut max_n_dets = sol_vec.max_size();
    let mut srt_arr: Vec<usize> = (0..max_n_dets).collect();
    let mut keep_exact = vec![false; max_n_dets];
    let mut loc_norms = vec![0.0f64; n_procs];

    let mut cur_base = 0usize;
    for iteration in 0..args.max_iter {
        let next_base = if cur_base == 0 { n_trial } else { 0 };

        // Normalise the iterates.
        match args.norm_technique {
            NormTechnique::None => {}
            NormTechnique::OneNorm => {
                for vec_idx in 0..n_trial {
                    sol_vec.set_curr_vec_idx(cur_base + vec_idx)?;
                    let norm = comm.sum_f64(sol_vec.local_norm());
                    if norm > 0.0 {
                        sol_vec.scale_vec(cur_base + vec_idx, 1.0 / norm);
                    }
                }
            }
            NormTechnique::MaxOneNorm => {
                let mut max_norm: f64 = 0.0;
                for vec_idx in 0..n_trial {
                    sol_vec.set_curr_vec_idx(cur_base + vec_idx)?;
                    max_norm = max_norm.max(comm.sum_f64(sol_vec.local_norm()));
                }
                if max_norm > 0.0 {
                    for vec_idx in 0..n_trial {
                        sol_vec.scale_vec(cur_base + vec_idx, 1.0 / max_norm);
                    }
                }
            }
        }

        // Overlap matrix D with the trial vectors.
        let mut d_mat = Array2::<f64>::zeros((n_trial, n_trial));
        for trial_idx in 0..n_trial {
            for vec_idx in 0..n_trial {
                sol_vec.set_curr_vec_idx(cur_base + vec_idx)?;
                let local = sol_vec.dot(
                    trial_vecs[trial_idx].indices(),
                    trial_vecs[trial_idx].values(),
                    &trial_hashes[trial_idx],
                );
                d_mat[(trial_idx, vec_idx)] = comm.sum_f64(local);
            }
        }
        if let Some(f) = dmat_file.as_mut() {
            let row: Vec<String> = d_mat.iter().map(|v| format!("{}", v)).collect();
            writeln!(f, "{}", row.join(","))?;
            f.flush()?;
        }

        // Compress each iterate to the target support size.
        for vec_idx in 0..n_trial {
            sol_vec.set_curr_vec_idx(cur_base + vec_idx)?;
            let count = sol_vec.curr_size();
            srt_arr[..count]
                .iter_mut()
                .enumerate()
                .for_each(|(idx, slot)| *slot = idx);
            let mut n_samp = args.vec_nonz;
            let (loc_norm, _) = find_preserve(
                sol_vec.values_mut(0),
                &mut srt_arr[..count],
                &mut keep_exact[..count],
                &mut n_samp,
                &comm,
            );
            let rn_sys = if proc_rank == 0 { rng.gen_range(0.0..1.0) } else { 0.0 };
            comm.allgather_f64(loc_norm, &mut loc_norms);
            sys_comp(
                sol_vec.values_mut(0),
                &mut loc_norms,
                n_samp,
                &mut keep_exact[..count],
                rn_sys,
                &comm,
            );
            for det_idx in 0..count {
                if keep_exact[det_idx] {
                    sol_vec.del_at_pos(det_idx);
                    keep_exact[det_idx] = false;
                }
            }
        }

        // next <- (I - eps * H) * current.
        for vec_idx in 0..n_trial {
            sol_vec.set_curr_vec_idx(next_base + vec_idx)?;
            sol_vec.zero_vec();
            h_op_offdiag(
                &mut sol_vec,
                &hf,
                cur_base + vec_idx,
                next_base + vec_idx,
                -eps,
                &comm,
            )?;
            h_op_diag(&mut sol_vec, &hf, cur_base + vec_idx, next_base + vec_idx, 1.0, -eps);
        }

        // Projection matrix B from the propagated iterates.
        let mut b_mat = Array2::<f64>::zeros((n_trial, n_trial));
        for trial_idx in 0..n_trial {
            for vec_idx in 0..n_trial {
                sol_vec.set_curr_vec_idx(next_base + vec_idx)?;
                let local = sol_vec.dot(
                    trial_vecs[trial_idx].indices(),
                    trial_vecs[trial_idx].values(),
                    &trial_hashes[trial_idx],
                );
                b_mat[(trial_idx, vec_idx)] = comm.sum_f64(local);
            }
        }
        if let Some(f) = bmat_file.as_mut() {
            let row: Vec<String> = b_mat.iter().map(|v| format!("{}", v)).collect();
            writeln!(f, "{}", row.join(","))?;
            f.flush()?;
        }

        let new_max_dets = sol_vec.max_size();
        if new_max_dets > max_n_dets {
            keep_exact.resize(new_max_dets, false);
            srt_arr = (0..new_max_dets).collect();
            max_n_dets = new_max_dets;
        }

        // Periodic restart: recombine the propagated iterates and land the
        // result in the (now stale) other half.
        if (iteration + 1) % args.restart_int == 0 {
            let coeffs = restart_matrix(args.restart_technique, &b_mat, &d_mat)?;
            for new_idx in 0..n_trial {
                sol_vec.set_curr_vec_idx(cur_base + new_idx)?;
                sol_vec.zero_vec();
                for old_idx in 0..n_trial {
                    sol_vec.add_vecs(
                        cur_base + new_idx,
                        next_base + old_idx,
                        coeffs[(old_idx, new_idx)],
                    );
                }
            }
            // Recombined iterates already occupy cur_base; no swap.
        } else {
            cur_base = next_base;
        }
    }

    Ok(())
}
