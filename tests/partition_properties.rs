//! Property tests for partition geometry and migration bookkeeping.

use std::collections::BTreeSet;

use heat_dlb::config::PartitionStrategy;
use heat_dlb::dlb::balancer::{split_by_performance, LoadBalancer};
use heat_dlb::dlb::descriptor::resolve_migration;
use heat_dlb::dlb::dims::Dims;
use heat_dlb::dlb::mesh::ObjectMesh;
use heat_dlb::dlb::tile::{Tile, HALO_SIZE};
use proptest::prelude::*;

const EDGE: usize = 64;
const OBJECT: usize = 8;

fn mesh() -> ObjectMesh {
    ObjectMesh::new(EDGE, Dims::square(OBJECT)).unwrap()
}

fn strategy_of(bisection: bool) -> PartitionStrategy {
    if bisection {
        PartitionStrategy::Bisection
    } else {
        PartitionStrategy::RowSplit
    }
}

/// Regular partition when `times` is `None`, a weighted one otherwise.
fn partition(workers: usize, times: Option<&[f64]>, bisection: bool) -> Vec<Tile> {
    let balancer = LoadBalancer::new(mesh(), workers, 1.5, strategy_of(bisection)).unwrap();
    let regular = balancer.regular_partition();
    match times {
        Some(times) => balancer.get_partition(&times[..workers], &regular).unwrap(),
        None => regular,
    }
}

fn workers() -> impl Strategy<Value = usize> {
    (0u32..4).prop_map(|e| 1usize << e)
}

fn times() -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(0.001f64..1.0, 8)
}

/// Every point covered exactly once.
fn assert_exact_cover(tiles: &[Tile]) -> Result<(), TestCaseError> {
    let mut hits = vec![0u8; EDGE * EDGE];
    for t in tiles {
        for y in t.position.y..t.position.y + t.size.y {
            for x in t.position.x..t.position.x + t.size.x {
                hits[y * EDGE + x] += 1;
            }
        }
    }
    prop_assert!(hits.iter().all(|&h| h == 1));
    Ok(())
}

// ── Tile geometry ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn shared_edges_are_mirrored(w in workers(), t in times(), weighted: bool, bisection: bool) {
        let tiles = partition(w, weighted.then_some(t.as_slice()), bisection);
        for a in &tiles {
            for b in &tiles {
                if a.rank == b.rank {
                    continue;
                }
                prop_assert_eq!(a.is_neighbor(b), b.is_neighbor(a));
                if let Some(edge) = a.shared_edge(b) {
                    prop_assert_eq!(b.shared_edge(a), Some(edge.opposite()));
                }
            }
        }
    }

    #[test]
    fn overlap_stays_inside_perimeter(w in workers(), t in times(), bisection: bool) {
        let tiles = partition(w, Some(t.as_slice()), bisection);
        for a in &tiles {
            for b in tiles.iter().filter(|b| b.rank != a.rank && a.is_neighbor(b)) {
                let (offset, count) = a.overlap_offset(b).unwrap();
                prop_assert!(count > 0);
                prop_assert!(offset + count <= a.halo_len());
            }
        }
    }

    #[test]
    fn partitions_cover_the_domain(w in workers(), t in times(), weighted: bool, bisection: bool) {
        let tiles = partition(w, weighted.then_some(t.as_slice()), bisection);
        prop_assert_eq!(tiles.len(), w);
        let area: usize = tiles.iter().map(|t| t.area()).sum();
        prop_assert_eq!(area, EDGE * EDGE);
        assert_exact_cover(&tiles)?;
        for (rank, tile) in tiles.iter().enumerate() {
            prop_assert_eq!(tile.rank, rank);
            prop_assert!(tile.size.x >= 2 * HALO_SIZE && tile.size.y >= 2 * HALO_SIZE);
            prop_assert_eq!(tile.size.x % OBJECT, 0);
            prop_assert_eq!(tile.size.y % OBJECT, 0);
        }
    }
}

// ── Column split ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn split_sums_to_columns(t in proptest::collection::vec(0.0001f64..10.0, 1..8), extra in 0usize..24) {
        let total = t.len() + extra;
        let columns = split_by_performance(&t, total).unwrap();
        prop_assert_eq!(columns.len(), t.len());
        prop_assert_eq!(columns.iter().sum::<usize>(), total);
        prop_assert!(columns.iter().all(|&c| c >= 1));
    }

    #[test]
    fn equal_times_split_evenly(n in 1usize..8, per in 1usize..6, time in 0.001f64..1.0) {
        let columns = split_by_performance(&vec![time; n], n * per).unwrap();
        prop_assert!(columns.iter().all(|&c| c == per));
    }

    #[test]
    fn slow_worker_never_gains(n in 2usize..6, slowdown in 2.0f64..1000.0) {
        let mut t = vec![1.0; n];
        t[0] = slowdown;
        let total = 4 * n;
        let columns = split_by_performance(&t, total).unwrap();
        prop_assert!(columns[0] >= 1);
        prop_assert!(columns[0] <= columns[1]);
    }
}

// ── Object mesh ────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn gid_coordinates_round_trip(object_exp in 2u32..5, gid_seed in 0usize..10_000) {
        let object = 1usize << object_exp;
        let mesh = ObjectMesh::new(EDGE, Dims::square(object)).unwrap();
        let gid = gid_seed % mesh.total_objects();
        prop_assert_eq!(mesh.gid_of(mesh.coords_of(gid)), gid);
        let inner = mesh.coords_of(gid) + Dims::square(object - 1);
        prop_assert_eq!(mesh.gid_of(inner), gid);
    }
}

// ── Migration sets ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn migration_sets_conserve_objects(
        w in workers(),
        old_t in times(),
        new_t in times(),
        old_weighted: bool,
        new_weighted: bool,
        bisection: bool,
    ) {
        let mesh = mesh();
        let old = partition(w, old_weighted.then_some(old_t.as_slice()), bisection);
        let new = partition(w, new_weighted.then_some(new_t.as_slice()), bisection);
        let old_assigned = mesh.assignment(&old);
        let new_assigned = mesh.assignment(&new);

        let mut all_imports = BTreeSet::new();
        let mut all_exports = BTreeSet::new();
        for rank in 0..w {
            let sets = resolve_migration(&mesh, &old, &new, rank).unwrap();
            let persist: BTreeSet<_> = sets.persist.iter().copied().collect();
            let import: BTreeSet<_> = sets.import_gids().into_iter().collect();
            let export: BTreeSet<_> = sets.export_gids().into_iter().collect();

            prop_assert!(persist.is_disjoint(&import));
            prop_assert!(persist.is_disjoint(&export));
            prop_assert!(import.is_disjoint(&export));

            let now: BTreeSet<_> = persist.union(&import).copied().collect();
            let before: BTreeSet<_> = persist.union(&export).copied().collect();
            prop_assert_eq!(now, new_assigned[rank].iter().copied().collect::<BTreeSet<_>>());
            prop_assert_eq!(before, old_assigned[rank].iter().copied().collect::<BTreeSet<_>>());

            for &(gid, source) in &sets.imports {
                prop_assert!(old_assigned[source].contains(&gid));
                prop_assert!(all_imports.insert(gid));
            }
            for &(gid, dest) in &sets.exports {
                prop_assert!(new_assigned[dest].contains(&gid));
                prop_assert!(all_exports.insert(gid));
            }
        }
        prop_assert_eq!(all_imports, all_exports);
    }
}
