//! Communication abstraction for the load-balancing engine.
//!
//! Workers run the same control flow in lockstep and talk only through a
//! [`Communicator`]. Backends supply point-to-point messaging and group
//! splitting; the collectives the engine needs (broadcast, gather,
//! scatterv, sum reduction) are provided as default methods on top and
//! may be overridden with native ones.
//!
//! Implementations: `LocalComm` (threads of one process), `MpiComm`
//! (via the mpi crate, `distributed` feature).

use bytemuck::Pod;

use crate::error::Result;
use crate::protocol_error;

/// Message tag. Messages between a pair of ranks with equal tags are
/// delivered in send order.
pub type Tag = u32;

/// Tags reserved by the engine.
pub mod tags {
    use super::Tag;

    pub const BARRIER: Tag = 1;
    pub const BROADCAST: Tag = 2;
    pub const GATHER: Tag = 3;
    pub const REDUCE: Tag = 4;
    pub const SPLIT: Tag = 5;
    pub const MIGRATE: Tag = 10;
    pub const HALO_TEMP: Tag = 20;
    pub const HALO_PARAMS: Tag = 21;
    pub const HALO_MAP: Tag = 22;
}

/// Abstraction over inter-worker communication inside one group.
///
/// Ranks are local to the group: `0..size()`.
pub trait Communicator: Sized {
    /// This worker's rank inside the group.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn size(&self) -> usize;

    /// Hand `payload` to the transport for delivery to `dest`.
    ///
    /// Must return without waiting for the matching receive, so that all
    /// workers may post their sends before any of them receives.
    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()>;

    /// Block until the next message from `source` with `tag` arrives.
    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>>;

    /// Collective: partition the group by `color`, ordering each new group
    /// by `(key, rank)`. Workers passing `None` take part in the call but
    /// receive no communicator.
    fn split(&self, color: Option<usize>, key: usize) -> Result<Option<Self>>;

    /// Name of the host this worker runs on, `"unknown"` if it cannot be
    /// read. Workers of one process share the kernel's host name.
    fn processor_name(&self) -> String {
        ["/proc/sys/kernel/hostname", "/etc/hostname"]
            .iter()
            .filter_map(|path| std::fs::read_to_string(path).ok())
            .map(|name| name.trim().to_string())
            .find(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Synchronisation barrier over the group.
    fn barrier(&self) -> Result<()> {
        let root = 0;
        if self.rank() == root {
            for r in 1..self.size() {
                self.recv(r, tags::BARRIER)?;
            }
            for r in 1..self.size() {
                self.send(r, tags::BARRIER, &[])?;
            }
        } else {
            self.send(root, tags::BARRIER, &[])?;
            self.recv(root, tags::BARRIER)?;
        }
        Ok(())
    }

    /// Broadcast raw bytes from `root`; non-root callers pass an empty
    /// slice and receive the root's payload.
    fn broadcast_bytes(&self, root: usize, payload: &[u8]) -> Result<Vec<u8>> {
        if self.rank() == root {
            for r in (0..self.size()).filter(|&r| r != root) {
                self.send(r, tags::BROADCAST, payload)?;
            }
            Ok(payload.to_vec())
        } else {
            self.recv(root, tags::BROADCAST)
        }
    }

    /// Gather one raw payload per rank at `root`, in rank order.
    fn gather_bytes(&self, root: usize, payload: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        if self.rank() == root {
            let mut all = Vec::with_capacity(self.size());
            for r in 0..self.size() {
                if r == root {
                    all.push(payload.to_vec());
                } else {
                    all.push(self.recv(r, tags::GATHER)?);
                }
            }
            Ok(Some(all))
        } else {
            self.send(root, tags::GATHER, payload)?;
            Ok(None)
        }
    }

    /// Typed broadcast of a slice of plain-old-data values.
    fn broadcast<T: Pod>(&self, root: usize, values: &[T]) -> Result<Vec<T>> {
        let bytes = self.broadcast_bytes(root, &encode(values))?;
        decode(&bytes)
    }

    /// Typed gather of one value per rank.
    fn gather<T: Pod>(&self, root: usize, value: T) -> Result<Option<Vec<T>>> {
        match self.gather_bytes(root, bytemuck::bytes_of(&value))? {
            Some(parts) => {
                let mut out = Vec::with_capacity(parts.len());
                for part in parts {
                    let mut decoded = decode::<T>(&part)?;
                    if decoded.len() != 1 {
                        return Err(protocol_error!(
                            "gather",
                            "expected one value per rank, got {}",
                            decoded.len()
                        ));
                    }
                    out.push(decoded.remove(0));
                }
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }

    /// Collective scatterv over the group, overlapped with `work`.
    ///
    /// The root passes `send`; every rank, the root included, receives its
    /// segment into `recv`, whose length must match its count. The transfer
    /// is outstanding while `work` runs and complete once this returns.
    fn scatterv_overlap<T: Pod, R>(
        &self,
        root: usize,
        tag: Tag,
        send: Option<Scatter<'_, T>>,
        recv: &mut [T],
        work: &mut dyn FnMut() -> Result<R>,
    ) -> Result<R> {
        if self.rank() != root {
            let out = work()?;
            let values = decode::<T>(&self.recv(root, tag)?)?;
            if values.len() != recv.len() {
                return Err(protocol_error!(
                    "scatterv",
                    "expected {} values from rank {}, received {}",
                    recv.len(),
                    root,
                    values.len()
                ));
            }
            recv.copy_from_slice(&values);
            return Ok(out);
        }
        let scatter =
            send.ok_or_else(|| protocol_error!("scatterv", "root {} has nothing to send", root))?;
        scatter.check(self.size())?;
        for r in 0..self.size() {
            let segment = scatter.segment(r)?;
            if r == root {
                if segment.len() != recv.len() {
                    return Err(protocol_error!(
                        "scatterv",
                        "root keeps {} values into a slot of {}",
                        segment.len(),
                        recv.len()
                    ));
                }
                recv.copy_from_slice(segment);
            } else {
                self.send(r, tag, bytemuck::cast_slice(segment))?;
            }
        }
        work()
    }

    /// Sum one value per rank; the result is returned at `root` only.
    fn reduce_sum_f32(&self, root: usize, value: f32) -> Result<Option<f32>> {
        if self.rank() == root {
            let mut sum = 0.0f32;
            for r in 0..self.size() {
                if r == root {
                    sum += value;
                } else {
                    let v = decode::<f32>(&self.recv(r, tags::REDUCE)?)?;
                    sum += v.first().copied().ok_or_else(|| {
                        protocol_error!("reduce_sum", "empty contribution from rank {}", r)
                    })?;
                }
            }
            Ok(Some(sum))
        } else {
            self.send(root, tags::REDUCE, bytemuck::bytes_of(&value))?;
            Ok(None)
        }
    }
}

/// Root's side of a scatterv: rank `r` gets
/// `buffer[displs[r]..displs[r] + counts[r]]`.
#[derive(Debug, Clone, Copy)]
pub struct Scatter<'a, T> {
    pub buffer: &'a [T],
    pub counts: &'a [usize],
    pub displs: &'a [usize],
}

impl<T> Scatter<'_, T> {
    /// Fail unless counts and displacements cover a group of `size`.
    pub fn check(&self, size: usize) -> Result<()> {
        if self.counts.len() != size || self.displs.len() != size {
            return Err(protocol_error!(
                "scatterv",
                "counts/displacements cover {}/{} ranks, group has {}",
                self.counts.len(),
                self.displs.len(),
                size
            ));
        }
        Ok(())
    }

    /// Segment destined for `rank`.
    pub fn segment(&self, rank: usize) -> Result<&[T]> {
        let start = self.displs[rank];
        let end = start + self.counts[rank];
        self.buffer.get(start..end).ok_or_else(|| {
            protocol_error!(
                "scatterv",
                "segment {}..{} for rank {} exceeds buffer of {}",
                start,
                end,
                rank,
                self.buffer.len()
            )
        })
    }
}

/// Serialise plain-old-data values to bytes.
pub fn encode<T: Pod>(values: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

/// Deserialise bytes produced by [`encode`]. Does not require the input to
/// be aligned for `T`.
pub fn decode<T: Pod>(bytes: &[u8]) -> Result<Vec<T>> {
    let width = std::mem::size_of::<T>();
    if width == 0 || bytes.len() % width != 0 {
        return Err(protocol_error!(
            "decode",
            "{} bytes is not a whole number of {}-byte values",
            bytes.len(),
            width
        ));
    }
    Ok(bytes
        .chunks_exact(width)
        .map(bytemuck::pod_read_unaligned::<T>)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DlbError;

    #[test]
    fn encode_decode_values() {
        let values = [1.5f32, -2.0, 3.25];
        let bytes = encode(&values);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode::<f32>(&bytes).unwrap(), values.to_vec());
    }

    #[test]
    fn decode_reads_unaligned_input() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&encode(&[7i32, -9]));
        assert_eq!(decode::<i32>(&bytes[1..]).unwrap(), vec![7, -9]);
    }

    #[test]
    fn scatter_segments_follow_displacements() {
        let buffer = [0.0f32, 1.0, 2.0, 3.0, 4.0];
        let scatter = Scatter {
            buffer: &buffer,
            counts: &[2, 0, 3],
            displs: &[3, 0, 0],
        };
        scatter.check(3).unwrap();
        assert_eq!(scatter.segment(0).unwrap(), &[3.0, 4.0]);
        assert!(scatter.segment(1).unwrap().is_empty());
        assert_eq!(scatter.segment(2).unwrap(), &[0.0, 1.0, 2.0]);
    }

    #[test]
    fn scatter_rejects_bad_tables() {
        let buffer = [0i32; 4];
        let scatter = Scatter {
            buffer: &buffer,
            counts: &[2, 3],
            displs: &[0, 2],
        };
        assert!(matches!(scatter.check(3), Err(DlbError::Protocol { call: "scatterv", .. })));
        assert!(scatter.segment(1).is_err());
    }

    #[test]
    fn decode_rejects_partial_values() {
        let err = decode::<f32>(&[0u8; 6]).unwrap_err();
        assert!(matches!(err, DlbError::Protocol { call: "decode", .. }));
    }
}
