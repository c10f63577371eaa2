// comm.rs
//
// The collective-communication interface used by the whole engine. The core
// only ever needs an MPI-shaped set of collectives (all-to-all counts,
// all-to-all-v payloads, all-gathers, broadcasts from rank 0), so those are
// gathered behind the `Comm` trait. `MpiComm` supplies them from the `mpi`
// crate for production runs; `SerialComm` supplies the single-process
// versions so the engine and its tests run without an MPI launcher.

use mpi::datatype::{Partition, PartitionMut};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use serde::{de::DeserializeOwned, Serialize};

pub trait Comm {
    fn rank(&self) -> usize;
    fn n_procs(&self) -> usize;

    /// Sum a scalar across all processes; every process receives the total.
    fn sum_f64(&self, local: f64) -> f64;
    fn sum_i64(&self, local: i64) -> i64;

    /// Broadcast from rank 0.
    fn bcast_f64(&self, val: &mut f64);
    fn bcast_u64(&self, val: &mut u64);
    fn bcast_u32_slice(&self, vals: &mut [u32]);
    fn bcast_u8_slice(&self, vals: &mut [u8]);

    /// All-gather one scalar per process into `out` (length `n_procs`).
    fn allgather_f64(&self, local: f64, out: &mut [f64]);
    fn allgather_i32(&self, local: i32, out: &mut [i32]);

    /// Gather one scalar per process onto `root`; `out` is only written on
    /// the root process.
    fn gather_f64(&self, local: f64, root: usize, out: &mut [f64]);

    /// One count per destination process exchanged for one count per source.
    fn alltoall_i32(&self, send: &[i32], recv: &mut [i32]);

    /// Variable-count payload exchanges with caller-supplied displacements.
    fn alltoallv_u8(
        &self,
        send: &[u8],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [u8],
        recv_cts: &[i32],
        recv_disp: &[i32],
    );
    fn alltoallv_f64(
        &self,
        send: &[f64],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [f64],
        recv_cts: &[i32],
        recv_disp: &[i32],
    );
    fn alltoallv_i32(
        &self,
        send: &[i32],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [i32],
        recv_cts: &[i32],
        recv_disp: &[i32],
    );

    /// Concatenate per-process slices onto every process.
    fn allgatherv_u8(&self, local: &[u8], recv: &mut [u8], counts: &[i32], disps: &[i32]);
    fn allgatherv_f64(&self, local: &[f64], recv: &mut [f64], counts: &[i32], disps: &[i32]);
}

/// Broadcast a serialisable value of arbitrary type from rank 0 to all
/// processes. On rank 0 `value` is the value to broadcast; on every other
/// rank it is overwritten.
/// # Arguments:
///     `comm`: collective interface.
///     `value`: value to broadcast / receive buffer.
pub fn broadcast<T>(comm: &dyn Comm, value: &mut T)
where
    T: Serialize + DeserializeOwned,
{
    // On rank 0 convert the value into binary; elsewhere start empty.
    let mut bytes: Vec<u8> = if comm.rank() == 0 {
        bincode::serialize(value).expect("value must serialize for broadcast")
    } else {
        Vec::new()
    };

    // Ship the length first so receivers can size their buffers.
    let mut len = bytes.len() as u64;
    comm.bcast_u64(&mut len);
    if comm.rank() != 0 {
        bytes.resize(len as usize, 0u8);
    }
    comm.bcast_u8_slice(&mut bytes);

    if comm.rank() != 0 {
        *value = bincode::deserialize(&bytes).expect("broadcast payload must deserialize");
    }
}

/// Collective interface backed by an MPI communicator.
pub struct MpiComm {
    world: SimpleCommunicator,
}

impl MpiComm {
    pub fn new(world: SimpleCommunicator) -> Self {
        Self { world }
    }
}

impl Comm for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn n_procs(&self) -> usize {
        self.world.size() as usize
    }

    fn sum_f64(&self, local: f64) -> f64 {
        // Gather every process' partial and sum locally; this keeps the
        // result bitwise identical on all ranks regardless of the reduction
        // tree the MPI library would otherwise pick.
        let mut parts = vec![0.0f64; self.n_procs()];
        self.world.all_gather_into(&local, &mut parts[..]);
        parts.iter().sum()
    }

    fn sum_i64(&self, local: i64) -> i64 {
        let mut parts = vec![0i64; self.n_procs()];
        self.world.all_gather_into(&local, &mut parts[..]);
        parts.iter().sum()
    }

    fn bcast_f64(&self, val: &mut f64) {
        self.world.process_at_rank(0).broadcast_into(val);
    }

    fn bcast_u64(&self, val: &mut u64) {
        self.world.process_at_rank(0).broadcast_into(val);
    }

    fn bcast_u32_slice(&self, vals: &mut [u32]) {
        self.world.process_at_rank(0).broadcast_into(vals);
    }

    fn bcast_u8_slice(&self, vals: &mut [u8]) {
        self.world.process_at_rank(0).broadcast_into(vals);
    }

    fn allgather_f64(&self, local: f64, out: &mut [f64]) {
        self.world.all_gather_into(&local, out);
    }

    fn allgather_i32(&self, local: i32, out: &mut [i32]) {
        self.world.all_gather_into(&local, out);
    }

    fn gather_f64(&self, local: f64, root: usize, out: &mut [f64]) {
        let root_proc = self.world.process_at_rank(root as i32);
        if self.rank() == root {
            root_proc.gather_into_root(&local, out);
        } else {
            root_proc.gather_into(&local);
        }
    }

    fn alltoall_i32(&self, send: &[i32], recv: &mut [i32]) {
        self.world.all_to_all_into(send, recv);
    }

    fn alltoallv_u8(
        &self,
        send: &[u8],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [u8],
        recv_cts: &[i32],
        recv_disp: &[i32],
    ) {
        let send_part = Partition::new(send, send_cts, send_disp);
        let mut recv_part = PartitionMut::new(recv, recv_cts, recv_disp);
        self.world.all_to_all_varcount_into(&send_part, &mut recv_part);
    }

    fn alltoallv_f64(
        &self,
        send: &[f64],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [f64],
        recv_cts: &[i32],
        recv_disp: &[i32],
    ) {
        let send_part = Partition::new(send, send_cts, send_disp);
        let mut recv_part = PartitionMut::new(recv, recv_cts, recv_disp);
        self.world.all_to_all_varcount_into(&send_part, &mut recv_part);
    }

    fn alltoallv_i32(
        &self,
        send: &[i32],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [i32],
        recv_cts: &[i32],
        recv_disp: &[i32],
    ) {
        let send_part = Partition::new(send, send_cts, send_disp);
        let mut recv_part = PartitionMut::new(recv, recv_cts, recv_disp);
        self.world.all_to_all_varcount_into(&send_part, &mut recv_part);
    }

    fn allgatherv_u8(&self, local: &[u8], recv: &mut [u8], counts: &[i32], disps: &[i32]) {
        let mut recv_part = PartitionMut::new(recv, counts, disps);
        self.world.all_gather_varcount_into(local, &mut recv_part);
    }

    fn allgatherv_f64(&self, local: &[f64], recv: &mut [f64], counts: &[i32], disps: &[i32]) {
        let mut recv_part = PartitionMut::new(recv, counts, disps);
        self.world.all_gather_varcount_into(local, &mut recv_part);
    }
}

/// Single-process implementation of the collective interface. Every
/// collective degenerates to a local copy, which is exactly what a one-rank
/// MPI job would do.
#[derive(Default)]
pub struct SerialComm;

impl Comm for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn n_procs(&self) -> usize {
        1
    }

    fn sum_f64(&self, local: f64) -> f64 {
        local
    }

    fn sum_i64(&self, local: i64) -> i64 {
        local
    }

    fn bcast_f64(&self, _val: &mut f64) {}
    fn bcast_u64(&self, _val: &mut u64) {}
    fn bcast_u32_slice(&self, _vals: &mut [u32]) {}
    fn bcast_u8_slice(&self, _vals: &mut [u8]) {}

    fn allgather_f64(&self, local: f64, out: &mut [f64]) {
        out[0] = local;
    }

    fn allgather_i32(&self, local: i32, out: &mut [i32]) {
        out[0] = local;
    }

    fn gather_f64(&self, local: f64, _root: usize, out: &mut [f64]) {
        out[0] = local;
    }

    fn alltoall_i32(&self, send: &[i32], recv: &mut [i32]) {
        recv[0] = send[0];
    }

    fn alltoallv_u8(
        &self,
        send: &[u8],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [u8],
        _recv_cts: &[i32],
        recv_disp: &[i32],
    ) {
        let n = send_cts[0] as usize;
        let src = send_disp[0] as usize;
        let dst = recv_disp[0] as usize;
        recv[dst..dst + n].copy_from_slice(&send[src..src + n]);
    }

    fn alltoallv_f64(
        &self,
        send: &[f64],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [f64],
        _recv_cts: &[i32],
        recv_disp: &[i32],
    ) {
        let n = send_cts[0] as usize;
        let src = send_disp[0] as usize;
        let dst = recv_disp[0] as usize;
        recv[dst..dst + n].copy_from_slice(&send[src..src + n]);
    }

    fn alltoallv_i32(
        &self,
        send: &[i32],
        send_cts: &[i32],
        send_disp: &[i32],
        recv: &mut [i32],
        _recv_cts: &[i32],
        recv_disp: &[i32],
    ) {
        let n = send_cts[0] as usize;
        let src = send_disp[0] as usize;
        let dst = recv_disp[0] as usize;
        recv[dst..dst + n].copy_from_slice(&send[src..src + n]);
    }

    fn allgatherv_u8(&self, local: &[u8], recv: &mut [u8], counts: &[i32], disps: &[i32]) {
        let n = counts[0] as usize;
        let dst = disps[0] as usize;
        recv[dst..dst + n].copy_from_slice(&local[..n]);
    }

    fn allgatherv_f64(&self, local: &[f64], recv: &mut [f64], counts: &[i32], disps: &[i32]) {
        let n = counts[0] as usize;
        let dst = disps[0] as usize;
        recv[dst..dst + n].copy_from_slice(&local[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_collectives_are_local_copies() {
        let comm = SerialComm;
        assert_eq!(comm.sum_f64(2.5), 2.5);
        assert_eq!(comm.sum_i64(-4), -4);

        let mut out = [0.0];
        comm.allgather_f64(1.5, &mut out);
        assert_eq!(out, [1.5]);

        let send = [7i32];
        let mut recv = [0i32];
        comm.alltoall_i32(&send, &mut recv);
        assert_eq!(recv, [7]);

        let send = [1.0, 2.0, 3.0];
        let mut recv = [0.0; 3];
        comm.alltoallv_f64(&send, &[3], &[0], &mut recv, &[3], &[0]);
        assert_eq!(recv, send);
    }

    #[test]
    fn serde_broadcast_is_identity_on_one_rank() {
        let comm = SerialComm;
        let mut value = vec![3u32, 1, 4, 1, 5];
        broadcast(&comm, &mut value);
        assert_eq!(value, vec![3, 1, 4, 1, 5]);
    }
}
