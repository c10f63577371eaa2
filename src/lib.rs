pub mod bits;
pub mod comm;
pub mod compress;
pub mod dethash;
pub mod error;
pub mod hamiltonian;
pub mod heat_bath;
pub mod io;
pub mod near_uniform;
pub mod subspace;
pub mod symm;
pub mod vector;

use ndarray::{Array2, Array4};

pub use error::{FriError, Result};

/// Number of irreps in the supported Abelian point groups. The group law is
/// XOR on the irrep labels.
pub const N_IRREPS: usize = 8;

/// Number of bytes needed to store `n_bits` bits.
pub fn ceil_bytes(n_bits: u32) -> usize {
    ((n_bits + 7) / 8) as usize
}

// Struct for storing the Hartree-Fock output that defines the Hamiltonian.
pub struct HfData {
    pub n_elec: u32,         // Total number of electrons, including frozen ones
    pub n_frz: u32,          // Number of frozen (core) electrons
    pub n_orb: u32,          // Number of unfrozen spatial orbitals
    pub eps: f64,            // Imaginary time step
    pub hf_en: f64,          // Hartree-Fock energy, subtracted from the diagonal
    pub symm: Vec<u8>,       // Irrep label of each unfrozen spatial orbital
    pub h_core: Array2<f64>, // One-electron integrals (tot_orb x tot_orb)
    pub eris: Array4<f64>,   // Two-electron integrals in chemists' notation (ij|kl)
}

impl HfData {
    /// Total number of spatial orbitals including frozen ones; the integral
    /// tensors are indexed over this range.
    pub fn tot_orb(&self) -> u32 {
        self.n_orb + self.n_frz / 2
    }

    /// Number of electrons outside the frozen core. Every stored determinant
    /// must have exactly this many bits set.
    pub fn n_elec_unf(&self) -> u32 {
        self.n_elec - self.n_frz
    }

    /// Number of bits in a determinant index.
    pub fn n_bits(&self) -> u32 {
        2 * self.n_orb
    }
}
