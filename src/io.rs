// io.rs
//
// Readers and writers for the on-disk interfaces: Hartree-Fock output files
// defining the Hamiltonian, text-format sparse vectors, the process-hash
// scrambler, and the per-rank deterministic-subspace lengths.

use std::fs;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use ndarray::{Array2, Array4};

use crate::error::{FriError, Result};
use crate::HfData;

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| FriError::io(path.display().to_string(), e))
}

/// Parse all comma- or whitespace-separated numbers in a file.
fn read_doub_csv(path: &Path, expected: usize) -> Result<Vec<f64>> {
    let text = read_to_string(path)?;
    let vals: Vec<f64> = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|tok| !tok.is_empty())
        .map_while(|tok| tok.parse::<f64>().ok())
        .collect();
    if vals.len() < expected {
        return Err(FriError::ShortFile {
            path: path.display().to_string(),
            found: vals.len(),
            expected,
        });
    }
    Ok(vals)
}

/// Read the Hartree-Fock output files in `hf_dir`: `sys_params.txt`,
/// `symm.txt`, `hcore.txt`, and `eris.txt`. The irreps of frozen orbitals
/// are dropped, so `symm` indexes active spatial orbitals only; the
/// integral tensors keep the frozen shell.
pub fn parse_hf_input(hf_dir: &Path) -> Result<HfData> {
    let params_path = hf_dir.join("sys_params.txt");
    let text = read_to_string(&params_path)?;
    let mut lines = text.lines().map(str::trim);
    let mut labelled = |name: &'static str| -> Result<f64> {
        loop {
            match lines.next() {
                Some(line) if line == name => break,
                Some(_) => continue,
                None => return Err(FriError::MissingParam { name }),
            }
        }
        lines
            .next()
            .and_then(|line| line.parse::<f64>().ok())
            .ok_or(FriError::MissingParam { name })
    };
    let n_elec = labelled("n_elec")? as u32;
    let n_frz = labelled("n_frozen")? as u32;
    let n_orb = labelled("n_orb")? as u32;
    let eps = labelled("eps")?;
    let hf_en = labelled("hf_energy")?;

    let tot_orb = (n_orb + n_frz / 2) as usize;

    let symm_path = hf_dir.join("symm.txt");
    let symm_text = read_to_string(&symm_path)?;
    let all_symm: Vec<u8> = symm_text
        .split_whitespace()
        .map_while(|tok| tok.parse::<u8>().ok())
        .collect();
    if all_symm.len() < tot_orb {
        return Err(FriError::ShortFile {
            path: symm_path.display().to_string(),
            found: all_symm.len(),
            expected: tot_orb,
        });
    }
    let symm = all_symm[(n_frz / 2) as usize..tot_orb].to_vec();

    let hcore_vals = read_doub_csv(&hf_dir.join("hcore.txt"), tot_orb * tot_orb)?;
    let h_core = Array2::from_shape_vec((tot_orb, tot_orb), hcore_vals[..tot_orb * tot_orb].to_vec())
        .expect("dimensions checked above");

    let n_eris = tot_orb * tot_orb * tot_orb * tot_orb;
    let eris_vals = read_doub_csv(&hf_dir.join("eris.txt"), n_eris)?;
    let eris = Array4::from_shape_vec(
        (tot_orb, tot_orb, tot_orb, tot_orb),
        eris_vals[..n_eris].to_vec(),
    )
    .expect("dimensions checked above");

    Ok(HfData {
        n_elec,
        n_frz,
        n_orb,
        eps,
        hf_en,
        symm,
        h_core,
        eris,
    })
}

/// Pack a decimal determinant (at most 64 bits) into little-endian bytes.
fn pack_det(mut value: u64, det: &mut [u8]) {
    for byte in det.iter_mut() {
        *byte = (value & 0xff) as u8;
        value >>= 8;
    }
}

/// Read a sparse vector from the parallel text files `<prefix>dets` and
/// `<prefix>vals`. Returns the determinants as a flat byte buffer of
/// `n_bytes`-wide rows alongside the values.
pub fn load_vec_txt(prefix: &str, n_bytes: usize) -> Result<(Vec<u8>, Vec<f64>)> {
    let dets_path = format!("{}dets", prefix);
    let vals_path = format!("{}vals", prefix);
    let dets_text = read_to_string(Path::new(&dets_path))?;
    let vals_text = read_to_string(Path::new(&vals_path))?;

    let mut dets = Vec::new();
    let mut vals = Vec::new();
    let mut det_row = vec![0u8; n_bytes];
    for (det_tok, val_tok) in dets_text
        .split_whitespace()
        .zip(vals_text.split_whitespace())
    {
        let (Ok(det), Ok(val)) = (det_tok.parse::<u64>(), val_tok.parse::<f64>()) else {
            break;
        };
        pack_det(det, &mut det_row);
        dets.extend_from_slice(&det_row);
        vals.push(val);
    }
    Ok((dets, vals))
}

/// Read a plain text list of decimal determinants into a flat byte buffer.
pub fn read_dets(path: &str, n_bytes: usize) -> Result<Vec<u8>> {
    let text = read_to_string(Path::new(path))?;
    let mut dets = Vec::new();
    let mut det_row = vec![0u8; n_bytes];
    for tok in text.split_whitespace() {
        let Ok(det) = tok.parse::<u64>() else { break };
        pack_det(det, &mut det_row);
        dets.extend_from_slice(&det_row);
    }
    Ok(dets)
}

/// Write the process-assignment scrambler to `<dir>/hash.dat` as
/// little-endian 32-bit words. Called on rank 0 only.
pub fn save_proc_hash(dir: &Path, proc_hash: &[u32]) -> Result<()> {
    let path = dir.join("hash.dat");
    let mut bytes = Vec::with_capacity(proc_hash.len() * 4);
    for &word in proc_hash {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    File::create(&path)
        .and_then(|mut f| f.write_all(&bytes))
        .map_err(|e| FriError::io(path.display().to_string(), e))
}

/// Read exactly `n_hash` scrambler words from `<dir>/hash.dat`. A shorter
/// file is treated as corrupt.
pub fn load_proc_hash(dir: &Path, n_hash: usize) -> Result<Vec<u32>> {
    let path = dir.join("hash.dat");
    let mut bytes = Vec::new();
    File::open(&path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| FriError::io(path.display().to_string(), e))?;
    if bytes.len() < n_hash * 4 {
        return Err(FriError::ShortFile {
            path: path.display().to_string(),
            found: bytes.len() / 4,
            expected: n_hash,
        });
    }
    Ok(bytes[..n_hash * 4]
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("4-byte chunks")))
        .collect())
}

/// Write the per-rank deterministic-subspace lengths to `<dir>/dense.txt`.
pub fn write_dense_sizes(dir: &Path, sizes: &[i32]) -> Result<()> {
    let path = dir.join("dense.txt");
    let line = sizes
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",");
    File::create(&path)
        .and_then(|mut f| writeln!(f, "{}", line))
        .map_err(|e| FriError::io(path.display().to_string(), e))
}

pub fn read_dense_sizes(dir: &Path) -> Result<Vec<i32>> {
    let path = dir.join("dense.txt");
    let text = read_to_string(&path)?;
    Ok(text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|tok| !tok.is_empty())
        .map_while(|tok| tok.parse::<i32>().ok())
        .collect())
}

/// Last recorded energy shift in `<dir>/S.txt`, for restarting.
pub fn read_last_shift(dir: &Path) -> Result<f64> {
    let path = dir.join("S.txt");
    let text = read_to_string(&path)?;
    text.lines()
        .rev()
        .find_map(|line| line.trim().parse::<f64>().ok())
        .ok_or(FriError::MissingParam { name: "S.txt" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn hf_input_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "sys_params.txt",
            "n_elec\n4\nn_frozen\n2\nn_orb\n2\neps\n0.05\nhf_energy\n-1.25\n",
        );
        // tot_orb = 3; frozen irreps are dropped.
        write_file(dir.path(), "symm.txt", "0 1 2\n");
        let hcore: Vec<String> = (0..9).map(|i| format!("{}.5", i)).collect();
        write_file(dir.path(), "hcore.txt", &hcore.join(","));
        let eris: Vec<String> = (0..81).map(|i| format!("{}", i)).collect();
        write_file(dir.path(), "eris.txt", &eris.join(","));

        let hf = parse_hf_input(dir.path()).unwrap();
        assert_eq!(hf.n_elec, 4);
        assert_eq!(hf.n_frz, 2);
        assert_eq!(hf.n_orb, 2);
        assert_eq!(hf.tot_orb(), 3);
        assert!((hf.eps - 0.05).abs() < 1e-12);
        assert!((hf.hf_en - -1.25).abs() < 1e-12);
        assert_eq!(hf.symm, vec![1, 2]);
        assert!((hf.h_core[(1, 2)] - 5.5).abs() < 1e-12);
        assert!((hf.eris[(2, 2, 2, 2)] - 80.0).abs() < 1e-12);
    }

    #[test]
    fn missing_parameter_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "sys_params.txt", "n_elec\n4\nn_orb\n2\n");
        let err = parse_hf_input(dir.path()).unwrap_err();
        assert!(err.to_string().contains("n_frozen"));
    }

    #[test]
    fn text_vector_packs_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("trial_").display().to_string();
        write_file(dir.path(), "trial_dets", "3\n260\n");
        write_file(dir.path(), "trial_vals", "1.5\n-0.25\n");
        let (dets, vals) = load_vec_txt(&prefix, 2).unwrap();
        assert_eq!(dets, vec![3, 0, 4, 1]);
        assert_eq!(vals, vec![1.5, -0.25]);
    }

    #[test]
    fn scrambler_round_trip_and_short_file_detection() {
        let dir = tempfile::tempdir().unwrap();
        let words: Vec<u32> = (0..12u32).map(|i| i.wrapping_mul(0x0061_c886)).collect();
        save_proc_hash(dir.path(), &words).unwrap();
        assert_eq!(load_proc_hash(dir.path(), 12).unwrap(), words);
        // Requesting more words than stored is corruption, not padding.
        assert!(load_proc_hash(dir.path(), 13).is_err());
    }

    #[test]
    fn dense_sizes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_dense_sizes(dir.path(), &[5, 0, 3]).unwrap();
        assert_eq!(read_dense_sizes(dir.path()).unwrap(), vec![5, 0, 3]);
    }

    #[test]
    fn last_shift_comes_from_final_line() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "S.txt", "-0.1\n-0.2\n-0.35\n");
        assert!((read_last_shift(dir.path()).unwrap() - -0.35).abs() < 1e-12);
    }
}
