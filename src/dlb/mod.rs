//! Dynamic load balancing engine: partitions, topology, halo exchange and
//! object migration.

pub mod balancer;
pub mod block;
pub mod comm;
pub mod comm_local;
#[cfg(feature = "distributed")]
pub mod comm_mpi;
pub mod descriptor;
pub mod dims;
pub mod halo;
pub mod mesh;
pub mod oracle;
pub mod perf;
pub mod tile;
pub mod topology;
