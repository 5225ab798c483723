//! MPI communication backend.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! Implements [`Communicator`] on top of an mpi `SimpleCommunicator`.
//!
//! # Usage
//!
//! The caller initializes MPI and hands the universe over so that a send
//! buffer sized for the domain can be attached:
//!
//! ```ignore
//! let mut universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::world(&mut universe, 1024, 8);
//! ```
//!
//! # Sends
//!
//! Object migration posts all of its sends before receiving. Those go
//! through `MPI_Bsend` into the attached buffer, see
//! [`migration_bytes`](super::balancer::migration_bytes). Broadcast,
//! gather, reduction and the halo scatterv use the native collectives.

use bytemuck::Pod;
use mpi::collective::{CommunicatorCollectives, Root, SystemOperation};
use mpi::datatype::{Partition, PartitionMut};
use mpi::environment::Universe;
use mpi::point_to_point::{Destination, Source};
use mpi::topology::{Color, Communicator as MpiCommunicator, SimpleCommunicator};
use mpi::Count;

use super::balancer::migration_bytes;
use super::comm::{Communicator, Scatter, Tag};
use crate::error::Result;
use crate::protocol_error;

/// MPI-based communicator.
pub struct MpiComm {
    comm: SimpleCommunicator,
}

impl MpiComm {
    /// World communicator with a send buffer attached that holds one
    /// worker's share of a migration over an `edge`² domain of
    /// `object_size`² objects.
    pub fn world(universe: &mut Universe, edge: usize, object_size: usize) -> Self {
        let comm = universe.world();
        let workers = MpiCommunicator::size(&comm) as usize;
        let bytes = migration_bytes(edge, object_size, workers);
        tracing::debug!(workers, bytes, "attaching MPI send buffer");
        universe.set_buffer_size(bytes);
        Self { comm }
    }

    fn check_root(&self, call: &'static str, root: usize) -> Result<()> {
        if root >= self.size() {
            return Err(protocol_error!(
                call,
                "root {} outside communicator of {}",
                root,
                self.size()
            ));
        }
        Ok(())
    }
}

/// `values` element counts as MPI byte counts.
fn byte_counts<T>(values: &[usize]) -> Result<Vec<Count>> {
    let width = std::mem::size_of::<T>();
    values
        .iter()
        .map(|&v| {
            Count::try_from(v * width)
                .map_err(|_| protocol_error!("MPI_Scatterv", "{} values exceed an MPI count", v))
        })
        .collect()
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        MpiCommunicator::rank(&self.comm) as usize
    }

    fn size(&self) -> usize {
        MpiCommunicator::size(&self.comm) as usize
    }

    fn processor_name(&self) -> String {
        mpi::environment::processor_name()
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        if dest >= self.size() {
            return Err(protocol_error!(
                "MPI_Bsend",
                "destination {} outside communicator of {}",
                dest,
                self.size()
            ));
        }
        self.comm
            .process_at_rank(dest as i32)
            .buffered_send_with_tag(payload, tag as i32);
        Ok(())
    }

    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        if source >= self.size() {
            return Err(protocol_error!(
                "MPI_Recv",
                "source {} outside communicator of {}",
                source,
                self.size()
            ));
        }
        let (payload, _status) = self
            .comm
            .process_at_rank(source as i32)
            .receive_vec_with_tag::<u8>(tag as i32);
        Ok(payload)
    }

    fn split(&self, color: Option<usize>, key: usize) -> Result<Option<Self>> {
        let color = match color {
            Some(c) => Color::with_value(c as i32),
            None => Color::undefined(),
        };
        Ok(self
            .comm
            .split_by_color_with_key(color, key as i32)
            .map(|comm| MpiComm { comm }))
    }

    fn barrier(&self) -> Result<()> {
        self.comm.barrier();
        Ok(())
    }

    fn broadcast_bytes(&self, root: usize, payload: &[u8]) -> Result<Vec<u8>> {
        self.check_root("MPI_Bcast", root)?;
        let process = self.comm.process_at_rank(root as i32);
        let mut len = payload.len() as u64;
        process.broadcast_into(&mut len);
        let mut buf = if self.rank() == root {
            payload.to_vec()
        } else {
            vec![0u8; len as usize]
        };
        process.broadcast_into(&mut buf[..]);
        Ok(buf)
    }

    fn gather_bytes(&self, root: usize, payload: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        self.check_root("MPI_Gatherv", root)?;
        let process = self.comm.process_at_rank(root as i32);
        let len = Count::try_from(payload.len())
            .map_err(|_| protocol_error!("MPI_Gatherv", "{} bytes exceed an MPI count", payload.len()))?;
        if self.rank() != root {
            process.gather_into(&len);
            process.gather_varcount_into(payload);
            return Ok(None);
        }

        let mut counts = vec![0 as Count; self.size()];
        process.gather_into_root(&len, &mut counts[..]);
        let displs: Vec<Count> = counts
            .iter()
            .scan(0, |acc, &c| {
                let d = *acc;
                *acc += c;
                Some(d)
            })
            .collect();
        let total = counts.iter().map(|&c| c as usize).sum();
        let mut buf = vec![0u8; total];
        {
            let mut partition = PartitionMut::new(&mut buf[..], &counts[..], &displs[..]);
            process.gather_varcount_into_root(payload, &mut partition);
        }
        Ok(Some(
            counts
                .iter()
                .zip(&displs)
                .map(|(&c, &d)| buf[d as usize..(d + c) as usize].to_vec())
                .collect(),
        ))
    }

    fn reduce_sum_f32(&self, root: usize, value: f32) -> Result<Option<f32>> {
        self.check_root("MPI_Reduce", root)?;
        let process = self.comm.process_at_rank(root as i32);
        if self.rank() == root {
            let mut sum = 0.0f32;
            process.reduce_into_root(&value, &mut sum, SystemOperation::sum());
            Ok(Some(sum))
        } else {
            process.reduce_into(&value, SystemOperation::sum());
            Ok(None)
        }
    }

    /// `MPI_Iscatterv` over bytes; the request stays outstanding while
    /// `work` runs and is waited on before returning, whatever `work`
    /// returned.
    fn scatterv_overlap<T: Pod, R>(
        &self,
        root: usize,
        _tag: Tag,
        send: Option<Scatter<'_, T>>,
        recv: &mut [T],
        work: &mut dyn FnMut() -> Result<R>,
    ) -> Result<R> {
        self.check_root("MPI_Iscatterv", root)?;
        let process = self.comm.process_at_rank(root as i32);
        let recv_bytes: &mut [u8] = bytemuck::cast_slice_mut(recv);

        if self.rank() != root {
            return mpi::request::scope(|scope| {
                let request = process.immediate_scatter_varcount_into(scope, recv_bytes);
                let out = work();
                request.wait();
                out
            });
        }

        let scatter =
            send.ok_or_else(|| protocol_error!("MPI_Iscatterv", "root {} has nothing to send", root))?;
        scatter.check(self.size())?;
        for r in 0..self.size() {
            scatter.segment(r)?;
        }
        let counts = byte_counts::<T>(scatter.counts)?;
        let displs = byte_counts::<T>(scatter.displs)?;
        let buffer: &[u8] = bytemuck::cast_slice(scatter.buffer);
        let partition = Partition::new(buffer, &counts[..], &displs[..]);
        mpi::request::scope(|scope| {
            let request = process.immediate_scatter_varcount_into_root(scope, &partition, recv_bytes);
            let out = work();
            request.wait();
            out
        })
    }
}
