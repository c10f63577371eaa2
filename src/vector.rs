// vector.rs
//
// The distributed hashed sparse vector at the heart of the FRI engine.
// Element values live in an n_vecs x capacity matrix sharing one column of
// determinant indices; a position (storage row) never moves once assigned,
// deleted positions are recycled through a LIFO free stack, and a hash table
// keyed on the occupied-orbital list gives random access. Every index is
// owned by exactly one process, decided by a scrambler that is identical on
// all processes; cross-process additions are staged in the Adder and
// exchanged with one all-to-all per flush.

use std::fs::File;
use std::io::{Read, Write};
use std::mem;
use std::path::Path;

use log::{info, warn};
use ndarray::{Array2, ArrayView2};
use num_traits::Signed;

use crate::bits::{find_bits, print_str, read_bit, set_bit, zero_bit};
use crate::comm::{broadcast, Comm};
use crate::dethash::{hash_fxn, HashTable};
use crate::error::{FriError, Result};
use crate::{ceil_bytes, io};

/// Value types storable in a DistVec: integer walker counts for FCIQMC and
/// real amplitudes for FRI. The trait carries the collective exchanges and
/// the binary checkpoint encoding for the concrete type.
pub trait Element: Copy + Default + PartialOrd + Signed + 'static {
    const BYTES: usize;

    fn to_f64(self) -> f64;
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;

    fn alltoallv(
        comm: &dyn Comm,
        send: &[Self],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [Self],
        recv_cts: &[i32],
        recv_disp: &[i32],
    );
    fn allgatherv(comm: &dyn Comm, local: &[Self], recv: &mut [Self], counts: &[i32], disps: &[i32]);
}

impl Element for f64 {
    const BYTES: usize = 8;

    fn to_f64(self) -> f64 {
        self
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        f64::from_le_bytes(bytes[..8].try_into().expect("8-byte f64 slot"))
    }

    fn alltoallv(
        comm: &dyn Comm,
        send: &[Self],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [Self],
        recv_cts: &[i32],
        recv_disp: &[i32],
    ) {
        comm.alltoallv_f64(send, send_cts, send_disp, recv, recv_cts, recv_disp);
    }

    fn allgatherv(comm: &dyn Comm, local: &[Self], recv: &mut [Self], counts: &[i32], disps: &[i32]) {
        comm.allgatherv_f64(local, recv, counts, disps);
    }
}

impl Element for i32 {
    const BYTES: usize = 4;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        i32::from_le_bytes(bytes[..4].try_into().expect("4-byte i32 slot"))
    }

    fn alltoallv(
        comm: &dyn Comm,
        send: &[Self],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [Self],
        recv_cts: &[i32],
        recv_disp: &[i32],
    ) {
        comm.alltoallv_i32(send, send_cts, send_disp, recv, recv_cts, recv_disp);
    }

    fn allgatherv(comm: &dyn Comm, local: &[Self], recv: &mut [Self], counts: &[i32], disps: &[i32]) {
        // i32 payloads only occur in FCIQMC walker exchanges; gather through
        // the f64 path to keep the Comm trait surface small.
        let local_f: Vec<f64> = local.iter().map(|&v| v as f64).collect();
        let mut recv_f = vec![0.0f64; recv.len()];
        comm.allgatherv_f64(&local_f, &mut recv_f, counts, disps);
        for (dst, src) in recv.iter_mut().zip(recv_f.iter()) {
            *dst = *src as i32;
        }
    }
}

/// Staging buffers for cross-process additions. Each destination process
/// owns one fixed-capacity row in the send and receive matrices; the last
/// byte of every staged index carries the initiator flag in bit `n_bits`.
pub struct Adder<T: Element> {
    send_idx: Vec<u8>,
    send_vals: Vec<T>,
    recv_idx: Vec<u8>,
    recv_vals: Vec<T>,
    /// Per-element success flags from the last flush, indexed like the send
    /// buffers. Used for perturbative bookkeeping on the origin process.
    send_success: Vec<u8>,
    recv_success: Vec<u8>,
    send_cts: Vec<i32>,
    recv_cts: Vec<i32>,
    n_bytes: usize,
    n_bits: u32,
    capacity: usize,
    n_procs: usize,
}

impl<T: Element> Adder<T> {
    /// # Arguments:
    ///     `capacity`: maximum number of staged elements per destination.
    ///     `n_procs`: number of processes.
    ///     `n_bits`: number of bits in a determinant index; buffers reserve
    ///     one extra bit for the initiator flag.
    pub fn new(capacity: usize, n_procs: usize, n_bits: u32) -> Self {
        let n_bytes = ceil_bytes(n_bits + 1);
        Self {
            send_idx: vec![0u8; n_procs * capacity * n_bytes],
            send_vals: vec![T::default(); n_procs * capacity],
            recv_idx: vec![0u8; n_procs * capacity * n_bytes],
            recv_vals: vec![T::default(); n_procs * capacity],
            send_success: vec![0u8; n_procs * capacity],
            recv_success: vec![0u8; n_procs * capacity],
            send_cts: vec![0; n_procs],
            recv_cts: vec![0; n_procs],
            n_bytes,
            n_bits,
            capacity,
            n_procs,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stage one element for the given destination process. Returns false
    /// once the destination row is full, in which case the caller must flush
    /// before staging anything else for that process.
    fn add(&mut self, idx: &[u8], val: T, proc_idx: usize, ini_flag: bool) -> bool {
        let count = self.send_cts[proc_idx] as usize;
        if count >= self.capacity {
            panic!("too many elements staged in Adder; perform_add() must be called more frequently");
        }
        let start = (proc_idx * self.capacity + count) * self.n_bytes;
        let slot = &mut self.send_idx[start..start + self.n_bytes];
        slot.fill(0);
        slot[..idx.len()].copy_from_slice(idx);
        if ini_flag {
            set_bit(slot, self.n_bits as u8);
        }
        self.send_vals[proc_idx * self.capacity + count] = val;
        self.send_cts[proc_idx] = (count + 1) as i32;
        count + 1 < self.capacity
    }

    /// Exchange counts and payloads. After this call the receive buffers
    /// hold the elements destined for this process.
    fn exchange(&mut self, comm: &dyn Comm) {
        comm.alltoall_i32(&self.send_cts, &mut self.recv_cts);

        let val_disp: Vec<i32> = (0..self.n_procs).map(|p| (p * self.capacity) as i32).collect();
        let idx_disp: Vec<i32> = (0..self.n_procs)
            .map(|p| (p * self.capacity * self.n_bytes) as i32)
            .collect();
        let send_idx_cts: Vec<i32> = self.send_cts.iter().map(|&c| c * self.n_bytes as i32).collect();
        let recv_idx_cts: Vec<i32> = self.recv_cts.iter().map(|&c| c * self.n_bytes as i32).collect();

        comm.alltoallv_u8(
            &self.send_idx,
            &send_idx_cts,
            &idx_disp,
            &mut self.recv_idx,
            &recv_idx_cts,
            &idx_disp,
        );
        T::alltoallv(
            comm,
            &self.send_vals,
            &self.send_cts,
            &val_disp,
            &mut self.recv_vals,
            &self.recv_cts,
            &val_disp,
        );
    }

    /// Ship one success byte per committed element back to its origin and
    /// reset the send counts for the next round of staging.
    fn return_leg(&mut self, comm: &dyn Comm) {
        let disp: Vec<i32> = (0..self.n_procs).map(|p| (p * self.capacity) as i32).collect();
        comm.alltoallv_u8(
            &self.recv_success,
            &self.recv_cts,
            &disp,
            &mut self.send_success,
            &self.send_cts,
            &disp,
        );
        self.send_cts.iter_mut().for_each(|c| *c = 0);
    }

    /// Success flag of the idx-th element staged for `proc_idx` in the most
    /// recent flush.
    pub fn add_result(&self, proc_idx: usize, idx: usize) -> bool {
        self.send_success[proc_idx * self.capacity + idx] != 0
    }
}

/// Distributed sparse vector over bit-string determinant indices. Supports
/// several co-located value rows sharing one sparsity pattern; `curr_vec_idx`
/// selects the row targeted by scalar operations and buffered additions.
pub struct DistVec<T: Element> {
    values: Array2<T>,
    curr_vec_idx: usize,
    n_dense: usize,
    free_stack: Vec<usize>,
    n_nonz: usize,
    adder: Adder<T>,
    min_del_idx: usize,
    indices: Array2<u8>,
    max_size: usize,
    curr_size: usize,
    occ_orbs: Array2<u8>,
    n_bits: u32,
    vec_hash: HashTable,
    proc_scrambler: Vec<u32>,
    vec_scrambler: Vec<u32>,
    nonini_occ_add: u64,
    diag_el: Vec<f64>,
    active_pos: Vec<bool>,
    n_procs: usize,
}

impl<T: Element> DistVec<T> {
    /// # Arguments:
    ///     `size`: initial capacity (grows by doubling).
    ///     `add_size`: staging capacity per destination process.
    ///     `n_bits`: bits per determinant index (2 * n_orb).
    ///     `n_elec`: electrons per determinant outside the frozen core.
    ///     `n_procs`: number of processes the vector is distributed over.
    ///     `n_vecs`: number of co-located value rows.
    ///     `rns_common`: process-assignment scrambler, identical everywhere.
    ///     `rns_distinct`: local-table scrambler, private to this process.
    pub fn new(
        size: usize,
        add_size: usize,
        n_bits: u32,
        n_elec: u32,
        n_procs: usize,
        n_vecs: usize,
        rns_common: Vec<u32>,
        rns_distinct: Vec<u32>,
    ) -> Self {
        assert_eq!(rns_common.len(), n_bits as usize, "one scrambler word per spin orbital");
        assert_eq!(rns_distinct.len(), n_bits as usize);
        Self {
            values: Array2::default((n_vecs, size)),
            curr_vec_idx: 0,
            n_dense: 0,
            free_stack: Vec::new(),
            n_nonz: 0,
            adder: Adder::new(add_size, n_procs, n_bits),
            min_del_idx: 0,
            indices: Array2::zeros((size, ceil_bytes(n_bits))),
            max_size: size,
            curr_size: 0,
            occ_orbs: Array2::zeros((size, n_elec as usize)),
            n_bits,
            vec_hash: HashTable::new(size),
            proc_scrambler: rns_common,
            vec_scrambler: rns_distinct,
            nonini_occ_add: 0,
            diag_el: vec![f64::NAN; size],
            active_pos: vec![false; size],
            n_procs,
        }
    }

    pub fn n_bits(&self) -> u32 {
        self.n_bits
    }

    pub fn n_elec(&self) -> usize {
        self.occ_orbs.ncols()
    }

    pub fn curr_size(&self) -> usize {
        self.curr_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn n_nonz(&self) -> usize {
        self.n_nonz
    }

    pub fn n_dense(&self) -> usize {
        self.n_dense
    }

    pub fn num_vecs(&self) -> usize {
        self.values.nrows()
    }

    pub fn adder_size(&self) -> usize {
        self.adder.capacity()
    }

    pub fn adder(&self) -> &Adder<T> {
        &self.adder
    }

    pub fn curr_vec_idx(&self) -> usize {
        self.curr_vec_idx
    }

    /// Select the value row targeted by subsequent scalar operations.
    pub fn set_curr_vec_idx(&mut self, new_idx: usize) -> Result<()> {
        if new_idx < self.values.nrows() {
            self.curr_vec_idx = new_idx;
            Ok(())
        } else {
            Err(FriError::VecIdxOutOfBounds {
                idx: new_idx,
                n_vecs: self.values.nrows(),
            })
        }
    }

    /// Positions below this watermark are never deleted.
    pub fn fix_min_del_idx(&mut self) {
        self.min_del_idx = self.curr_size;
    }

    pub fn set_min_del_idx(&mut self, idx: usize) {
        self.min_del_idx = idx;
    }

    /// Fill `occ` with the set-bit positions of `det` and return how many
    /// there were.
    pub fn gen_orb_list(&self, det: &[u8], occ: &mut [u8]) -> usize {
        find_bits(&det[..self.indices.ncols()], occ)
    }

    /// Which process owns this index. Every process computes the same answer
    /// because the process scrambler is broadcast from rank 0 at startup.
    pub fn idx_to_proc(&self, det: &[u8]) -> usize {
        let mut occ = vec![0u8; self.occ_orbs.ncols()];
        self.gen_orb_list(det, &mut occ);
        self.idx_to_proc_with_orbs(&occ)
    }

    pub fn idx_to_proc_with_orbs(&self, occ: &[u8]) -> usize {
        (hash_fxn(occ, &self.proc_scrambler) % self.n_procs as u64) as usize
    }

    /// Hash an index for the local table, filling `occ` with its occupied
    /// orbitals. A determinant with the wrong electron count is a capacity
    /// error and aborts the run.
    pub fn idx_to_hash(&self, det: &[u8], occ: &mut [u8]) -> u64 {
        if self.gen_orb_list(det, occ) != self.occ_orbs.ncols() {
            panic!(
                "determinant {} created with an incorrect number of electrons",
                print_str(&det[..self.indices.ncols()])
            );
        }
        hash_fxn(occ, &self.vec_scrambler)
    }

    /// Stage an element for later addition. Zero values are dropped
    /// immediately. Returns false when the destination buffer row is now
    /// full and a flush is required.
    pub fn add(&mut self, idx: &[u8], val: T, ini_flag: bool) -> bool {
        if val.is_zero() {
            return true;
        }
        let proc = self.idx_to_proc(idx);
        self.adder.add(idx, val, proc, ini_flag)
    }

    /// Flush the staging buffers: exchange counts and payloads, commit the
    /// received elements locally, and return the per-element success flags
    /// to their origins.
    /// # Arguments:
    ///     `origin`: value row consulted when deciding whether a
    ///     noninitiator contribution may land on an existing position.
    ///     `comm`: collective interface.
    pub fn perform_add(&mut self, origin: usize, comm: &dyn Comm) {
        self.adder.exchange(comm);

        // Detach the receive buffers so the commit loop can borrow the rest
        // of the vector mutably; they are restored before the return leg.
        let recv_idx = mem::take(&mut self.adder.recv_idx);
        let recv_vals = mem::take(&mut self.adder.recv_vals);
        let mut recv_success = mem::take(&mut self.adder.recv_success);
        let n_bytes = self.adder.n_bytes;
        let capacity = self.adder.capacity;

        for proc_idx in 0..self.n_procs {
            let count = self.adder.recv_cts[proc_idx] as usize;
            let idx_start = proc_idx * capacity * n_bytes;
            let val_start = proc_idx * capacity;
            self.add_elements(
                &recv_idx[idx_start..idx_start + count * n_bytes],
                &recv_vals[val_start..val_start + count],
                n_bytes,
                origin,
                &mut recv_success[val_start..val_start + count],
            );
        }

        self.adder.recv_idx = recv_idx;
        self.adder.recv_vals = recv_vals;
        self.adder.recv_success = recv_success;
        self.adder.return_leg(comm);
    }

    /// Commit a batch of incoming elements to this process' storage. This is
    /// the single place where positions are created.
    fn add_elements(
        &mut self,
        indices: &[u8],
        vals: &[T],
        add_n_bytes: usize,
        origin: usize,
        success: &mut [u8],
    ) {
        let vec_n_bytes = self.indices.ncols();
        let mut det = vec![0u8; add_n_bytes];
        let mut occ = vec![0u8; self.occ_orbs.ncols()];
        for (el_idx, &val) in vals.iter().enumerate() {
            det.copy_from_slice(&indices[el_idx * add_n_bytes..(el_idx + 1) * add_n_bytes]);
            let ini_flag = read_bit(&det, self.n_bits as u8);
            if ini_flag {
                zero_bit(&mut det, self.n_bits as u8);
            }
            let hash_val = self.idx_to_hash(&det, &mut occ);
            // The hash table only allocates a slot for initiators; a
            // noninitiator landing on an absent index evaporates here.
            let stored = self
                .vec_hash
                .read(&det[..vec_n_bytes], hash_val, ini_flag)
                .map(|slot| *slot);
            let pos = match stored {
                None => {
                    success[el_idx] = 0;
                    continue;
                }
                Some(-1) => {
                    // Reserved but unused: assign a storage position now.
                    let pos = match self.free_stack.pop() {
                        Some(pos) => pos,
                        None => {
                            if self.curr_size >= self.max_size {
                                self.expand();
                            }
                            let pos = self.curr_size;
                            self.curr_size += 1;
                            pos
                        }
                    };
                    *self
                        .vec_hash
                        .read(&det[..vec_n_bytes], hash_val, false)
                        .expect("slot was just created") = pos as i64;
                    self.indices
                        .row_mut(pos)
                        .as_slice_mut()
                        .expect("row-major index storage")
                        .copy_from_slice(&det[..vec_n_bytes]);
                    self.initialize_at_pos(pos, &occ);
                    self.n_nonz += 1;
                    pos
                }
                Some(pos) => pos as usize,
            };

            let occupied = !self.values[(origin, pos)].is_zero();
            let should_add = ini_flag || occupied;
            if !ini_flag && occupied {
                self.nonini_occ_add += 1;
            }
            if should_add {
                let row = self.curr_vec_idx;
                self.values[(row, pos)] = self.values[(row, pos)] + val;
                success[el_idx] = 1;
            } else {
                success[el_idx] = 0;
            }
        }
    }

    fn initialize_at_pos(&mut self, pos: usize, occ: &[u8]) {
        for vec_idx in 0..self.values.nrows() {
            self.values[(vec_idx, pos)] = T::zero();
        }
        self.diag_el[pos] = f64::NAN;
        self.active_pos[pos] = true;
        self.occ_orbs
            .row_mut(pos)
            .as_slice_mut()
            .expect("row-major occupied-orbital storage")
            .copy_from_slice(occ);
    }

    /// Double the storage capacity; positions never move.
    fn expand(&mut self) {
        let new_max = self.max_size * 2;
        info!("increasing vector storage capacity to {}", new_max);
        let mut values = Array2::<T>::default((self.values.nrows(), new_max));
        values
            .slice_mut(ndarray::s![.., ..self.max_size])
            .assign(&self.values);
        self.values = values;

        let mut indices = Array2::<u8>::zeros((new_max, self.indices.ncols()));
        indices
            .slice_mut(ndarray::s![..self.max_size, ..])
            .assign(&self.indices);
        self.indices = indices;

        let mut occ = Array2::<u8>::zeros((new_max, self.occ_orbs.ncols()));
        occ.slice_mut(ndarray::s![..self.max_size, ..])
            .assign(&self.occ_orbs);
        self.occ_orbs = occ;

        self.diag_el.resize(new_max, f64::NAN);
        self.active_pos.resize(new_max, false);
        self.max_size = new_max;
    }

    /// Delete the element at a position if every value row is zero there and
    /// the position is above the never-delete watermark and outside the
    /// deterministic subspace. Silent no-op otherwise.
    pub fn del_at_pos(&mut self, pos: usize) {
        if !self.active_pos[pos] || pos < self.min_del_idx || pos < self.n_dense {
            return;
        }
        let all_zero = (0..self.values.nrows()).all(|row| self.values[(row, pos)].is_zero());
        if !all_zero {
            return;
        }
        let det: Vec<u8> = self.indices.row(pos).to_vec();
        let hash_val = hash_fxn(
            self.occ_orbs.row(pos).as_slice().expect("row-major"),
            &self.vec_scrambler,
        );
        self.vec_hash.del_entry(&det, hash_val);
        self.free_stack.push(pos);
        self.n_nonz -= 1;
        self.active_pos[pos] = false;
    }

    /// Bit-string index stored at a position.
    pub fn idx_at_pos(&self, pos: usize) -> &[u8] {
        let n_bytes = self.indices.ncols();
        &self.indices.as_slice().expect("row-major")[pos * n_bytes..(pos + 1) * n_bytes]
    }

    /// Occupied-orbital list stored at a position.
    pub fn orbs_at_pos(&self, pos: usize) -> &[u8] {
        let n_elec = self.occ_orbs.ncols();
        &self.occ_orbs.as_slice().expect("row-major")[pos * n_elec..(pos + 1) * n_elec]
    }

    pub fn indices(&self) -> ArrayView2<u8> {
        self.indices.slice(ndarray::s![..self.curr_size, ..])
    }

    /// Value at a position in the current row.
    pub fn value_at_pos(&self, pos: usize) -> T {
        self.values[(self.curr_vec_idx, pos)]
    }

    pub fn set_value_at_pos(&mut self, pos: usize, val: T) {
        self.values[(self.curr_vec_idx, pos)] = val;
    }

    /// Value at a position in an explicit row.
    pub fn value_at(&self, vec_idx: usize, pos: usize) -> T {
        self.values[(vec_idx, pos)]
    }

    pub fn set_value_at(&mut self, vec_idx: usize, pos: usize, val: T) {
        self.values[(vec_idx, pos)] = val;
    }

    /// The current value row as a slice of length `curr_size`.
    pub fn values(&self) -> &[T] {
        &self.values.as_slice().expect("row-major")
            [self.curr_vec_idx * self.max_size..self.curr_vec_idx * self.max_size + self.curr_size]
    }

    /// Mutable access to a contiguous span of the current value row,
    /// starting at `start` and running to `curr_size`. The span borrows only
    /// the value matrix, so index and orbital storage stay readable.
    pub fn values_mut(&mut self, start: usize) -> &mut [T] {
        let row_start = self.curr_vec_idx * self.max_size;
        &mut self.values.as_slice_mut().expect("row-major")
            [row_start + start..row_start + self.curr_size]
    }

    /// Diagonal Hamiltonian element at a position, computed through `calc`
    /// on first demand and cached until the position is recycled.
    pub fn diag_el_at_pos(&mut self, pos: usize, calc: impl FnOnce(&[u8]) -> f64) -> f64 {
        if self.diag_el[pos].is_nan() {
            let n_elec = self.occ_orbs.ncols();
            let occ =
                &self.occ_orbs.as_slice().expect("row-major")[pos * n_elec..(pos + 1) * n_elec];
            self.diag_el[pos] = calc(occ);
        }
        self.diag_el[pos]
    }

    /// Local partial of the dot product with a sparse operand whose hashes
    /// against this vector's table were precomputed.
    /// # Arguments:
    ///     `idx2`: operand indices, one row per element.
    ///     `vals2`: operand values.
    ///     `hashes2`: operand hashes under this vector's local scrambler.
    pub fn dot(&mut self, idx2: ArrayView2<u8>, vals2: &[f64], hashes2: &[u64]) -> f64 {
        let n_bytes = self.indices.ncols();
        let mut numer = 0.0;
        for (el_idx, &val) in vals2.iter().enumerate() {
            let det = &idx2.row(el_idx).to_slice().expect("row-major")[..n_bytes];
            if let Some(&mut pos) = self.vec_hash.read(det, hashes2[el_idx], false) {
                if pos >= 0 {
                    numer += val * self.values[(self.curr_vec_idx, pos as usize)].to_f64();
                }
            }
        }
        numer
    }

    /// Dot product of two of the internally stored value rows.
    pub fn internal_dot(&self, idx1: usize, idx2: usize) -> f64 {
        (0..self.curr_size)
            .map(|pos| self.values[(idx1, pos)].to_f64() * self.values[(idx2, pos)].to_f64())
            .sum()
    }

    /// values(dst) += values(src) * factor, elementwise over stored rows.
    pub fn add_vecs(&mut self, dst: usize, src: usize, factor: T) {
        for pos in 0..self.curr_size {
            let inc = self.values[(src, pos)] * factor;
            self.values[(dst, pos)] = self.values[(dst, pos)] + inc;
        }
    }

    pub fn copy_vec(&mut self, src: usize, dst: usize) {
        for pos in 0..self.curr_size {
            self.values[(dst, pos)] = self.values[(src, pos)];
        }
    }

    /// Multiply every element of a value row by a constant.
    pub fn scale_vec(&mut self, row: usize, factor: T) {
        for pos in 0..self.curr_size {
            self.values[(row, pos)] = self.values[(row, pos)] * factor;
        }
    }

    /// Zero the current value row without touching the hash table.
    pub fn zero_vec(&mut self) {
        for pos in 0..self.curr_size {
            self.values[(self.curr_vec_idx, pos)] = T::zero();
        }
    }

    /// One-norm of the current row on this process.
    pub fn local_norm(&self) -> f64 {
        (0..self.curr_size)
            .map(|pos| self.values[(self.curr_vec_idx, pos)].to_f64().abs())
            .sum()
    }

    /// Global one-norm of the deterministic subspace.
    pub fn dense_norm(&self, comm: &dyn Comm) -> f64 {
        let local: f64 = (0..self.n_dense)
            .map(|pos| self.values[(self.curr_vec_idx, pos)].to_f64().abs())
            .sum();
        comm.sum_f64(local)
    }

    /// Cumulative count of noninitiator additions that landed on occupied
    /// determinants, summed over processes. A sign-coherence diagnostic.
    pub fn tot_sgn_coh(&self, comm: &dyn Comm) -> i64 {
        comm.sum_i64(self.nonini_occ_add as i64)
    }

    /// Replace this process' storage with the concatenation of every
    /// process' elements. Used for trial vectors, which each process must
    /// hold in full. The hash table is not rebuilt; collected vectors serve
    /// as dot-product operands only.
    pub fn collect_procs(&mut self, comm: &dyn Comm) {
        let n_procs = comm.n_procs();
        let n_bytes = self.indices.ncols();
        let mut vec_sizes = vec![0i32; n_procs];
        comm.allgather_i32(self.curr_size as i32, &mut vec_sizes);

        let mut disps = vec![0i32; n_procs];
        let mut idx_counts = vec![0i32; n_procs];
        let mut idx_disps = vec![0i32; n_procs];
        let mut tot_size = 0i32;
        for proc_idx in 0..n_procs {
            disps[proc_idx] = tot_size;
            idx_disps[proc_idx] = tot_size * n_bytes as i32;
            idx_counts[proc_idx] = vec_sizes[proc_idx] * n_bytes as i32;
            tot_size += vec_sizes[proc_idx];
        }
        let tot_size = tot_size as usize;
        while tot_size > self.max_size {
            self.expand();
        }

        let local_idx: Vec<u8> =
            self.indices.as_slice().expect("row-major")[..self.curr_size * n_bytes].to_vec();
        let mut all_idx = vec![0u8; tot_size * n_bytes];
        comm.allgatherv_u8(&local_idx, &mut all_idx, &idx_counts, &idx_disps);
        self.indices.as_slice_mut().expect("row-major")[..tot_size * n_bytes]
            .copy_from_slice(&all_idx);

        for vec_idx in 0..self.values.nrows() {
            let row_start = vec_idx * self.max_size;
            let flat = self.values.as_slice_mut().expect("row-major");
            let local: Vec<T> = flat[row_start..row_start + self.curr_size].to_vec();
            let mut gathered = vec![T::default(); tot_size];
            T::allgatherv(comm, &local, &mut gathered, &vec_sizes, &disps);
            flat[row_start..row_start + tot_size].copy_from_slice(&gathered);
        }
        self.curr_size = tot_size;
    }

    /// Write this process' indices and value rows to
    /// `<path>/dets<rank>.dat` and `<path>/vals<rank>.dat`, and the per-rank
    /// deterministic-subspace lengths to `<path>/dense.txt` (rank 0 only).
    pub fn save(&self, path: &Path, comm: &dyn Comm) -> Result<()> {
        let rank = comm.rank();
        let n_bytes = self.indices.ncols();

        let dets_path = path.join(format!("dets{}.dat", rank));
        let mut file = File::create(&dets_path)
            .map_err(|e| FriError::io(dets_path.display().to_string(), e))?;
        file.write_all(&self.indices.as_slice().expect("row-major")[..self.curr_size * n_bytes])
            .map_err(|e| FriError::io(dets_path.display().to_string(), e))?;

        let vals_path = path.join(format!("vals{}.dat", rank));
        let mut buf = Vec::with_capacity(self.values.nrows() * self.curr_size * T::BYTES);
        for vec_idx in 0..self.values.nrows() {
            for pos in 0..self.curr_size {
                self.values[(vec_idx, pos)].write_le(&mut buf);
            }
        }
        let mut file = File::create(&vals_path)
            .map_err(|e| FriError::io(vals_path.display().to_string(), e))?;
        file.write_all(&buf)
            .map_err(|e| FriError::io(vals_path.display().to_string(), e))?;

        let mut dense_sizes = vec![0i32; comm.n_procs()];
        comm.allgather_i32(self.n_dense as i32, &mut dense_sizes);
        if rank == 0 {
            io::write_dense_sizes(path, &dense_sizes)?;
        }
        Ok(())
    }

    /// Restore a vector saved with `save`. Rebuilds the hash table, drops
    /// rows that are zero in every value row (outside the deterministic
    /// subspace and the never-delete watermark) and compacts the remainder.
    /// Returns the size of the deterministic subspace on this process.
    pub fn load(&mut self, path: &Path, comm: &dyn Comm) -> Result<usize> {
        let rank = comm.rank();
        let n_bytes = self.indices.ncols();
        let n_vecs = self.values.nrows();

        let mut dense_sizes: Vec<i32> = if rank == 0 {
            io::read_dense_sizes(path)?
        } else {
            Vec::new()
        };
        broadcast(comm, &mut dense_sizes);
        self.n_dense = dense_sizes.get(rank).copied().unwrap_or(0) as usize;

        let dets_path = path.join(format!("dets{}.dat", rank));
        let mut det_bytes = Vec::new();
        File::open(&dets_path)
            .and_then(|mut f| f.read_to_end(&mut det_bytes))
            .map_err(|e| FriError::io(dets_path.display().to_string(), e))?;
        let n_dets = det_bytes.len() / n_bytes;
        while n_dets > self.max_size {
            self.expand();
        }
        self.indices.as_slice_mut().expect("row-major")[..n_dets * n_bytes]
            .copy_from_slice(&det_bytes[..n_dets * n_bytes]);

        let vals_path = path.join(format!("vals{}.dat", rank));
        let mut val_bytes = Vec::new();
        File::open(&vals_path)
            .and_then(|mut f| f.read_to_end(&mut val_bytes))
            .map_err(|e| FriError::io(vals_path.display().to_string(), e))?;
        let expected = n_vecs * n_dets * T::BYTES;
        if val_bytes.len() < expected {
            return Err(FriError::ShortFile {
                path: vals_path.display().to_string(),
                found: val_bytes.len(),
                expected,
            });
        }
        for vec_idx in 0..n_vecs {
            for pos in 0..n_dets {
                let offset = (vec_idx * n_dets + pos) * T::BYTES;
                self.values[(vec_idx, pos)] = T::read_le(&val_bytes[offset..]);
            }
        }

        // Compact: re-insert surviving rows in order, recomputing occupied
        // lists and clearing the diagonal cache.
        self.n_nonz = 0;
        self.vec_hash = HashTable::new(self.max_size);
        self.free_stack.clear();
        let mut occ = vec![0u8; self.occ_orbs.ncols()];
        let mut tmp_vals = vec![T::zero(); n_vecs];
        for det_idx in 0..n_dets {
            let keep = det_idx < self.n_dense
                || det_idx < self.min_del_idx
                || (0..n_vecs).any(|v| self.values[(v, det_idx)].to_f64().abs() > 1e-9);
            if !keep {
                continue;
            }
            let det: Vec<u8> = self
                .indices
                .row(det_idx)
                .to_slice()
                .expect("row-major")
                .to_vec();
            let hash_val = self.idx_to_hash(&det, &mut occ);
            let new_pos = self.n_nonz;
            *self
                .vec_hash
                .read(&det, hash_val, true)
                .expect("created slot") = new_pos as i64;
            for v in 0..n_vecs {
                tmp_vals[v] = self.values[(v, det_idx)];
            }
            self.indices
                .row_mut(new_pos)
                .as_slice_mut()
                .expect("row-major")
                .copy_from_slice(&det);
            self.initialize_at_pos(new_pos, &occ);
            for v in 0..n_vecs {
                self.values[(v, new_pos)] = tmp_vals[v];
            }
            self.n_nonz += 1;
        }
        self.curr_size = self.n_nonz;
        Ok(self.n_dense)
    }

    /// Build the deterministic subspace from a text determinant list. The
    /// listed determinants become the first positions of the vector with
    /// zero values, and the per-rank subspace lengths go to
    /// `<save_dir>/dense.txt`. Must be called on an empty vector.
    pub fn init_dense(&mut self, read_path: &str, save_dir: &Path, comm: &dyn Comm) -> Result<usize> {
        let n_bytes = self.indices.ncols();
        let dets = if comm.rank() == 0 {
            io::read_dets(read_path, n_bytes)?
        } else {
            Vec::new()
        };
        for det in dets.chunks_exact(n_bytes) {
            self.add(det, T::one(), true);
        }
        self.perform_add(0, comm);

        self.n_dense = self.curr_size;
        for vec_idx in 0..self.values.nrows() {
            for pos in 0..self.n_dense {
                self.values[(vec_idx, pos)] = T::zero();
            }
        }

        let mut dense_sizes = vec![0i32; comm.n_procs()];
        comm.allgather_i32(self.n_dense as i32, &mut dense_sizes);
        if comm.rank() == 0 {
            io::write_dense_sizes(save_dir, &dense_sizes)?;
        }
        if self.n_dense == 0 && comm.rank() == 0 {
            warn!("deterministic subspace from {} is empty", read_path);
        }
        Ok(self.n_dense)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;

    fn scramblers(n_bits: u32) -> (Vec<u32>, Vec<u32>) {
        let common: Vec<u32> = (0..n_bits).map(|i| 0x9e37_79b9u32.wrapping_mul(i + 1)).collect();
        let distinct: Vec<u32> = (0..n_bits).map(|i| 0x85eb_ca6bu32.wrapping_mul(i + 3)).collect();
        (common, distinct)
    }

    fn det_from_orbs(orbs: &[u8], n_bytes: usize) -> Vec<u8> {
        let mut det = vec![0u8; n_bytes];
        for &orb in orbs {
            set_bit(&mut det, orb);
        }
        det
    }

    #[test]
    fn add_and_flush_accumulates_values() {
        let comm = SerialComm;
        let (common, distinct) = scramblers(12);
        let mut vec = DistVec::<f64>::new(8, 16, 12, 4, 1, 1, common, distinct);
        let det_a = det_from_orbs(&[0, 1, 6, 7], 2);
        let det_b = det_from_orbs(&[0, 2, 6, 8], 2);

        vec.add(&det_a, 1.5, true);
        vec.add(&det_b, -0.5, true);
        vec.add(&det_a, 0.25, true);
        vec.perform_add(0, &comm);

        assert_eq!(vec.curr_size(), 2);
        assert_eq!(vec.n_nonz(), 2);
        let mut occ = [0u8; 4];
        let hash_a = vec.idx_to_hash(&det_a, &mut occ);
        let idx2 = ndarray::Array2::from_shape_vec((1, 2), det_a.clone()).unwrap();
        let dot = vec.dot(idx2.view(), &[1.0], &[hash_a]);
        assert!((dot - 1.75).abs() < 1e-12);
    }

    #[test]
    fn noninitiator_cannot_create_position() {
        let comm = SerialComm;
        let (common, distinct) = scramblers(12);
        let mut vec = DistVec::<f64>::new(8, 16, 12, 4, 1, 1, common, distinct);
        let det_a = det_from_orbs(&[0, 1, 6, 7], 2);
        let det_b = det_from_orbs(&[0, 2, 6, 8], 2);

        vec.add(&det_a, 1.0, false);
        vec.perform_add(0, &comm);
        assert_eq!(vec.curr_size(), 0);
        assert!(!vec.adder().add_result(0, 0));

        // An initiator creates the position; afterwards noninitiators land.
        vec.add(&det_a, 1.0, true);
        vec.perform_add(0, &comm);
        vec.add(&det_a, 0.5, false);
        vec.add(&det_b, 0.5, false);
        vec.perform_add(0, &comm);
        assert_eq!(vec.curr_size(), 1);
        assert!((vec.value_at_pos(0) - 1.5).abs() < 1e-12);
        assert_eq!(vec.tot_sgn_coh(&comm), 1);
    }

    #[test]
    fn delete_recycles_position_through_free_stack() {
        let comm = SerialComm;
        let (common, distinct) = scramblers(12);
        let mut vec = DistVec::<f64>::new(8, 16, 12, 4, 1, 1, common, distinct);
        let det_a = det_from_orbs(&[0, 1, 6, 7], 2);
        let det_b = det_from_orbs(&[0, 2, 6, 8], 2);
        let det_c = det_from_orbs(&[1, 2, 7, 8], 2);

        vec.add(&det_a, 1.0, true);
        vec.add(&det_b, 2.0, true);
        vec.perform_add(0, &comm);
        assert_eq!(vec.curr_size(), 2);

        // Zero out det_a and delete it; its position must be reused.
        vec.set_value_at_pos(0, 0.0);
        vec.del_at_pos(0);
        assert_eq!(vec.n_nonz(), 1);
        vec.add(&det_c, 3.0, true);
        vec.perform_add(0, &comm);
        assert_eq!(vec.curr_size(), 2, "freed position should be reused");
        assert!((vec.value_at_pos(0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn watermark_blocks_deletion() {
        let comm = SerialComm;
        let (common, distinct) = scramblers(12);
        let mut vec = DistVec::<f64>::new(8, 16, 12, 4, 1, 1, common, distinct);
        let det_a = det_from_orbs(&[0, 1, 6, 7], 2);
        vec.add(&det_a, 1.0, true);
        vec.perform_add(0, &comm);
        vec.fix_min_del_idx();

        vec.set_value_at_pos(0, 0.0);
        vec.del_at_pos(0);
        assert_eq!(vec.n_nonz(), 1, "position below watermark must survive");
    }

    #[test]
    fn capacity_doubles_when_full() {
        let comm = SerialComm;
        let (common, distinct) = scramblers(12);
        let mut vec = DistVec::<f64>::new(2, 32, 12, 4, 1, 1, common, distinct);
        let dets: Vec<Vec<u8>> = (0..5)
            .map(|k| det_from_orbs(&[k, 5, 6 + k, 11], 2))
            .collect();
        for det in &dets {
            vec.add(det, 1.0, true);
        }
        vec.perform_add(0, &comm);
        assert_eq!(vec.curr_size(), 5);
        assert!(vec.max_size() >= 5);
        // Values survived the reallocation.
        for pos in 0..5 {
            assert!((vec.value_at_pos(pos) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn row_operations_share_one_sparsity_pattern() {
        let comm = SerialComm;
        let (common, distinct) = scramblers(12);
        let mut vec = DistVec::<f64>::new(8, 16, 12, 4, 1, 2, common, distinct);
        let det_a = det_from_orbs(&[0, 1, 6, 7], 2);
        let det_b = det_from_orbs(&[0, 2, 6, 8], 2);
        vec.add(&det_a, 2.0, true);
        vec.add(&det_b, -1.0, true);
        vec.perform_add(0, &comm);

        // Row 1 starts empty; copy row 0 over, scale, and accumulate.
        vec.copy_vec(0, 1);
        vec.scale_vec(1, 0.5);
        assert!((vec.value_at(1, 0) - 1.0).abs() < 1e-12);
        assert!((vec.value_at(1, 1) - -0.5).abs() < 1e-12);

        vec.add_vecs(1, 0, 2.0);
        assert!((vec.value_at(1, 0) - 5.0).abs() < 1e-12);
        // <row0 | row1> = 2 * 5 + (-1) * (-2.5).
        assert!((vec.internal_dot(0, 1) - 12.5).abs() < 1e-12);
        assert!((vec.local_norm() - 3.0).abs() < 1e-12);

        vec.set_curr_vec_idx(1).unwrap();
        vec.zero_vec();
        assert_eq!(vec.internal_dot(1, 1), 0.0);
    }

    #[test]
    #[should_panic(expected = "incorrect number of electrons")]
    fn wrong_electron_count_is_fatal() {
        let (common, distinct) = scramblers(12);
        let vec = DistVec::<f64>::new(8, 16, 12, 4, 1, 1, common, distinct);
        let bad_det = det_from_orbs(&[0, 1, 6], 2);
        let mut occ = [0u8; 4];
        vec.idx_to_hash(&bad_det, &mut occ);
    }
}
