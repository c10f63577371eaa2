//! Error types for the FRI engine.
//!
//! Configuration problems (missing input files, unsupported factorization
//! names, zero compression targets) are recoverable up to the point where a
//! binary reports them and exits. Capacity violations inside the iteration
//! (a staging buffer overrun, a determinant with the wrong electron count)
//! abort the collective instead and are raised as panics at the point of
//! detection rather than through this enum.
use thiserror::Error;

/// All recoverable error conditions in the FRI library.
#[derive(Error, Debug)]
pub enum FriError {
    /// A required input file could not be opened or read.
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A labelled parameter was missing or unparseable in `sys_params.txt`.
    #[error("could not find parameter {name} in sys_params.txt")]
    MissingParam { name: &'static str },

    /// A numeric file held fewer entries than the dimensions require.
    #[error("{path} holds {found} values but {expected} were expected")]
    ShortFile {
        path: String,
        found: usize,
        expected: usize,
    },

    /// An internal vector row index was out of range.
    #[error("vector row index {idx} is out of bounds ({n_vecs} rows stored)")]
    VecIdxOutOfBounds { idx: usize, n_vecs: usize },

    /// The requested Hamiltonian factorization name is not supported.
    #[error("unsupported Hamiltonian factorization: {0}")]
    UnknownDistribution(String),

    /// A dense factorization or eigendecomposition failed during a subspace
    /// restart.
    #[error("linear algebra failure during restart: {0}")]
    Linalg(String),
}

impl FriError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        FriError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, FriError>;
