//! Cartesian process topologies.
//!
//! Coordinates are assigned row-major: the last dimension varies fastest,
//! so in a `[2, 3]` grid rank 4 sits at `[1, 1]`. Shift queries are purely
//! local.

use crate::comm::{split_group, CommKind, CommRecord, CommView, Communicator};
use crate::error::{Error, Result};
use crate::{PROC_NULL, UNDEFINED};

/// A Cartesian grid attached to a communicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CartTopology {
    pub(crate) dims: Vec<i32>,
    pub(crate) periods: Vec<bool>,
}

impl CartTopology {
    pub(crate) fn new(dims: &[i32], periods: &[bool]) -> Result<Self> {
        if dims.len() != periods.len() {
            return Err(Error::InvalidArg(format!(
                "{} dimensions but {} periodicity flags",
                dims.len(),
                periods.len()
            )));
        }
        if let Some(&bad) = dims.iter().find(|&&d| d <= 0) {
            return Err(Error::InvalidTopology(format!(
                "dimension extent {bad} is not positive"
            )));
        }
        Ok(CartTopology {
            dims: dims.to_vec(),
            periods: periods.to_vec(),
        })
    }

    pub(crate) fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Number of grid positions.
    pub(crate) fn volume(&self) -> i64 {
        self.dims.iter().map(|&d| i64::from(d)).product()
    }

    pub(crate) fn coords_of(&self, rank: i32) -> Vec<i32> {
        let mut coords = vec![0; self.dims.len()];
        let mut rest = rank;
        for (coord, &extent) in coords.iter_mut().zip(&self.dims).rev() {
            *coord = rest % extent;
            rest /= extent;
        }
        coords
    }

    /// Rank at `coords`, wrapping periodic dimensions. `None` if a
    /// non-periodic coordinate is out of range.
    pub(crate) fn rank_at(&self, coords: &[i32]) -> Option<i32> {
        let mut rank = 0;
        for ((&coord, &extent), &periodic) in coords.iter().zip(&self.dims).zip(&self.periods) {
            let coord = if periodic {
                coord.rem_euclid(extent)
            } else if (0..extent).contains(&coord) {
                coord
            } else {
                return None;
            };
            rank = rank * extent + coord;
        }
        Some(rank)
    }

    /// `(source, dest)` for a shift of `displacement` along `direction`.
    pub(crate) fn shift(&self, rank: i32, direction: usize, displacement: i32) -> (i32, i32) {
        if displacement == 0 {
            return (rank, rank);
        }
        let coords = self.coords_of(rank);
        let extent = i64::from(self.dims[direction]);
        let neighbour = |delta: i64| {
            let target = i64::from(coords[direction]) + delta;
            let target = if self.periods[direction] {
                target.rem_euclid(extent)
            } else if (0..extent).contains(&target) {
                target
            } else {
                return PROC_NULL;
            };
            let mut moved = coords.clone();
            // Within 0..extent, so it fits.
            moved[direction] = target as i32;
            self.rank_at(&moved).unwrap_or(PROC_NULL)
        };
        let displacement = i64::from(displacement);
        (neighbour(-displacement), neighbour(displacement))
    }

    /// Row-major index of `coords` restricted to the dimensions selected by
    /// `keep`.
    fn index_over(&self, coords: &[i32], keep: impl Fn(usize) -> bool) -> i32 {
        let mut index = 0;
        for (d, (&coord, &extent)) in coords.iter().zip(&self.dims).enumerate() {
            if keep(d) {
                index = index * extent + coord;
            }
        }
        index
    }

    fn project(&self, remain: &[bool]) -> CartTopology {
        let (dims, periods) = self
            .dims
            .iter()
            .zip(&self.periods)
            .zip(remain)
            .filter(|(_, &keep)| keep)
            .map(|((&d, &p), _)| (d, p))
            .unzip();
        CartTopology { dims, periods }
    }
}

/// Shape of a Cartesian communicator and the caller's place in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartesianLayout {
    /// Extent of each dimension.
    pub dims: Vec<i32>,
    /// Whether each dimension wraps around.
    pub periods: Vec<bool>,
    /// Coordinates of the calling process.
    pub coords: Vec<i32>,
}

/// Topology attached to a communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    /// No topology.
    Undefined,
    /// A Cartesian grid.
    Cartesian,
}

fn cart_of(view: &CommView) -> Result<&CartTopology> {
    view.topology
        .as_ref()
        .ok_or_else(|| Error::InvalidTopology("communicator has no Cartesian topology".into()))
}

/// Fill the zero entries of `dims` with a balanced factorisation of
/// `nnodes`, in non-increasing order. Non-zero entries are kept.
///
/// ```
/// let mut dims = [0, 0];
/// mpirt::dims_create(12, &mut dims).unwrap();
/// assert_eq!(dims, [4, 3]);
///
/// let mut dims = [0, 3, 0];
/// mpirt::dims_create(24, &mut dims).unwrap();
/// assert_eq!(dims, [4, 3, 2]);
/// ```
pub fn dims_create(nnodes: i32, dims: &mut [i32]) -> Result<()> {
    if nnodes <= 0 {
        return Err(Error::InvalidArg(format!("node count {nnodes} is not positive")));
    }
    if let Some(&bad) = dims.iter().find(|&&d| d < 0) {
        return Err(Error::InvalidArg(format!("dimension {bad} is negative")));
    }
    let fixed = dims
        .iter()
        .filter(|&&d| d > 0)
        .try_fold(1i32, |acc, &d| acc.checked_mul(d))
        .filter(|&f| f <= nnodes);
    let free = dims.iter().filter(|&&d| d == 0).count();
    let fixed = match fixed {
        Some(f) if nnodes % f == 0 && (free > 0 || f == nnodes) => f,
        _ => {
            return Err(Error::InvalidArg(format!(
                "{nnodes} nodes do not fit the fixed dimensions"
            )))
        }
    };

    let mut factors = Vec::new();
    let mut rest = nnodes / fixed;
    let mut p = 2;
    while p <= rest / p {
        while rest % p == 0 {
            factors.push(p);
            rest /= p;
        }
        p += 1;
    }
    if rest > 1 {
        factors.push(rest);
    }
    factors.sort_unstable_by(|a, b| b.cmp(a));

    let mut extents = vec![1; free];
    for factor in factors {
        if let Some(smallest) = extents.iter_mut().min() {
            *smallest *= factor;
        }
    }
    extents.sort_unstable_by(|a, b| b.cmp(a));
    for (slot, extent) in dims.iter_mut().filter(|d| **d == 0).zip(extents) {
        *slot = extent;
    }
    Ok(())
}

impl Communicator {
    // ========================================================================
    // Cartesian topology
    // ========================================================================

    /// Create a communicator with a Cartesian topology. Collective.
    ///
    /// Ranks `0..∏dims` of this communicator form the grid in row-major
    /// order; the remaining ranks get `None`. `reorder` is accepted and the
    /// identity mapping is always used.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTopology`] if the grid has more positions than the
    /// communicator has processes or an extent is not positive.
    pub fn cart_create(&self, dims: &[i32], periods: &[bool], reorder: bool) -> Result<Option<Self>> {
        self.guard(|state, view| {
            view.require_intra("cart_create")?;
            let topology = CartTopology::new(dims, periods)?;
            if topology.volume() > i64::from(view.size()) {
                return Err(Error::InvalidTopology(format!(
                    "grid of {} positions on {} processes",
                    topology.volume(),
                    view.size()
                )));
            }
            let color = if i64::from(view.rank) < topology.volume() {
                0
            } else {
                UNDEFINED
            };
            tracing::trace!(?dims, ?periods, reorder, "cart_create");
            let part = split_group(state, view, color, view.rank)?;
            Ok(part.map(|(group, context)| {
                Communicator::adopt(
                    state,
                    CommRecord::new(
                        group,
                        None,
                        context,
                        state.pid,
                        CommKind::User,
                        format!("MPI COMMUNICATOR {} CREATE FROM {}", context.0, view.context.0),
                        view.errors,
                    )
                    .with_topology(Some(topology)),
                )
            }))
        })
    }

    /// Source and destination ranks for a shift along `direction`.
    ///
    /// Periodic dimensions wrap; in a non-periodic dimension a side that
    /// falls off the grid is [`PROC_NULL`]. A zero displacement yields
    /// `(rank, rank)`. No communication takes place.
    pub fn cart_shift(&self, direction: i32, displacement: i32) -> Result<(i32, i32)> {
        self.guard(|_, view| {
            let cart = cart_of(view)?;
            let direction = usize::try_from(direction)
                .ok()
                .filter(|&d| d < cart.ndims())
                .ok_or_else(|| Error::InvalidArg(format!("direction {direction} out of range")))?;
            Ok(cart.shift(view.rank, direction, displacement))
        })
    }

    /// Split the grid into lower-dimensional sub-grids. Collective.
    ///
    /// Processes that agree on every dimension with `remain_dims[d] == false`
    /// share a sub-grid, which keeps the retained dimensions. With no
    /// dimension retained each process gets a communicator of its own.
    pub fn cart_sub(&self, remain_dims: &[bool]) -> Result<Self> {
        self.guard(|state, view| {
            let cart = cart_of(view)?;
            if remain_dims.len() != cart.ndims() {
                return Err(Error::InvalidArg(format!(
                    "{} flags for a {}-dimensional grid",
                    remain_dims.len(),
                    cart.ndims()
                )));
            }
            let coords = cart.coords_of(view.rank);
            let color = cart.index_over(&coords, |d| !remain_dims[d]);
            let key = cart.index_over(&coords, |d| remain_dims[d]);
            let (group, context) = split_group(state, view, color, key)?
                .ok_or_else(|| Error::Internal("cart_sub left a process without a grid".into()))?;
            Ok(Communicator::adopt(
                state,
                CommRecord::new(
                    group,
                    None,
                    context,
                    state.pid,
                    CommKind::User,
                    format!("MPI COMMUNICATOR {} SPLIT FROM {}", context.0, view.context.0),
                    view.errors,
                )
                .with_topology(Some(cart.project(remain_dims))),
            ))
        })
    }

    /// Number of grid dimensions.
    pub fn cartdim_get(&self) -> Result<i32> {
        self.guard(|_, view| Ok(cart_of(view)?.ndims() as i32))
    }

    /// Grid shape and the caller's coordinates.
    pub fn cart_get(&self) -> Result<CartesianLayout> {
        self.guard(|_, view| {
            let cart = cart_of(view)?;
            Ok(CartesianLayout {
                dims: cart.dims.clone(),
                periods: cart.periods.clone(),
                coords: cart.coords_of(view.rank),
            })
        })
    }

    /// Coordinates of `rank` in the grid.
    pub fn cart_coords(&self, rank: i32) -> Result<Vec<i32>> {
        self.guard(|_, view| {
            let cart = cart_of(view)?;
            if rank < 0 || rank >= view.size() {
                return Err(Error::InvalidRank(rank));
            }
            Ok(cart.coords_of(rank))
        })
    }

    /// Rank at `coords`; periodic dimensions wrap.
    pub fn cart_rank(&self, coords: &[i32]) -> Result<i32> {
        self.guard(|_, view| {
            let cart = cart_of(view)?;
            if coords.len() != cart.ndims() {
                return Err(Error::InvalidArg(format!(
                    "{} coordinates for a {}-dimensional grid",
                    coords.len(),
                    cart.ndims()
                )));
            }
            cart.rank_at(coords)
                .ok_or_else(|| Error::InvalidArg(format!("coordinates {coords:?} are off the grid")))
        })
    }

    /// Which topology, if any, is attached.
    pub fn topology(&self) -> Result<TopologyKind> {
        self.guard(|_, view| {
            Ok(match view.topology {
                Some(_) => TopologyKind::Cartesian,
                None => TopologyKind::Undefined,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommunicatorRelation, Config, ErrorMode, Universe};

    fn returning() -> Universe {
        Universe::new(Config::default().with_errors(ErrorMode::Return))
    }

    #[test]
    fn coordinates_round_trip() {
        let cart = CartTopology::new(&[2, 3, 4], &[false; 3]).unwrap();
        assert_eq!(cart.coords_of(0), vec![0, 0, 0]);
        assert_eq!(cart.coords_of(5), vec![0, 1, 1]);
        assert_eq!(cart.coords_of(23), vec![1, 2, 3]);
        for rank in 0..24 {
            assert_eq!(cart.rank_at(&cart.coords_of(rank)), Some(rank));
        }
        assert_eq!(cart.rank_at(&[2, 0, 0]), None);
    }

    #[test]
    fn shift_periodic_and_not() {
        let ring = CartTopology::new(&[5], &[true]).unwrap();
        let line = CartTopology::new(&[5], &[false]).unwrap();
        for rank in 0..5 {
            assert_eq!(ring.shift(rank, 0, 1), ((rank + 4) % 5, (rank + 1) % 5));
            assert_eq!(ring.shift(rank, 0, -1), ((rank + 1) % 5, (rank + 4) % 5));
            assert_eq!(ring.shift(rank, 0, 0), (rank, rank));
            assert_eq!(line.shift(rank, 0, 0), (rank, rank));
        }
        assert_eq!(line.shift(0, 0, 1), (PROC_NULL, 1));
        assert_eq!(line.shift(4, 0, 1), (3, PROC_NULL));
        assert_eq!(line.shift(2, 0, 1), (1, 3));
        assert_eq!(line.shift(2, 0, 3), (PROC_NULL, PROC_NULL));
    }

    #[test]
    fn shift_by_extreme_displacements() {
        let ring = CartTopology::new(&[5], &[true]).unwrap();
        let line = CartTopology::new(&[5], &[false]).unwrap();
        for rank in 0..5 {
            // i32::MAX is 2 mod 5, i32::MIN is 2 mod 5 as well.
            assert_eq!(ring.shift(rank, 0, i32::MAX), ((rank + 3) % 5, (rank + 2) % 5));
            assert_eq!(ring.shift(rank, 0, i32::MIN), ((rank + 3) % 5, (rank + 2) % 5));
            assert_eq!(line.shift(rank, 0, i32::MAX), (PROC_NULL, PROC_NULL));
            assert_eq!(line.shift(rank, 0, i32::MIN), (PROC_NULL, PROC_NULL));
        }
    }

    #[test]
    fn dims_create_balances() {
        let mut dims = [0, 0, 0];
        dims_create(16, &mut dims).unwrap();
        assert_eq!(dims, [4, 2, 2]);
        let mut dims = [0];
        dims_create(7, &mut dims).unwrap();
        assert_eq!(dims, [7]);
        let mut dims = [0, 5];
        assert!(dims_create(12, &mut dims).is_err());
        let mut dims = [2, 3];
        dims_create(6, &mut dims).unwrap();
        assert!(dims_create(7, &mut [2, 3]).is_err());
    }

    #[test]
    fn dims_create_large_inputs() {
        let mut dims = [0, 0];
        dims_create(i32::MAX, &mut dims).unwrap();
        assert_eq!(dims, [i32::MAX, 1]);
        let mut dims = [0, 0];
        dims_create(1 << 30, &mut dims).unwrap();
        assert_eq!(dims, [1 << 15, 1 << 15]);
        assert!(dims_create(4, &mut [65536, 65536, 0]).is_err());
    }

    #[test]
    fn cart_shift_on_communicator() {
        returning()
            .run(4, |mpi| {
                let world = mpi.world();
                let rank = world.rank();
                let ring = world.cart_create(&[4], &[true], false)?.unwrap();
                assert_eq!(ring.cart_shift(0, 1)?, ((rank + 3) % 4, (rank + 1) % 4));
                assert_eq!(ring.cart_shift(0, 0)?, (rank, rank));
                assert_eq!(ring.cart_shift(0, i32::MAX)?, ((rank + 1) % 4, (rank + 3) % 4));
                let line = world.cart_create(&[4], &[false], false)?.unwrap();
                let (source, dest) = line.cart_shift(0, 1)?;
                assert_eq!(source, if rank == 0 { PROC_NULL } else { rank - 1 });
                assert_eq!(dest, if rank == 3 { PROC_NULL } else { rank + 1 });
                assert!(matches!(line.cart_shift(1, 1).unwrap_err(), Error::InvalidArg(_)));
                assert!(matches!(
                    world.cart_shift(0, 1).unwrap_err(),
                    Error::InvalidTopology(_)
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn cart_create_bounds() {
        returning()
            .run(5, |mpi| {
                let world = mpi.world();
                let grid = world.cart_create(&[2, 2], &[false, true], true)?;
                if world.rank() < 4 {
                    let grid = grid.unwrap();
                    assert_eq!(grid.topology()?, TopologyKind::Cartesian);
                    let layout = grid.cart_get()?;
                    assert_eq!(layout.dims, vec![2, 2]);
                    assert_eq!(layout.periods, vec![false, true]);
                    assert_eq!(layout.coords, vec![world.rank() / 2, world.rank() % 2]);
                    assert_eq!(grid.cart_rank(&[1, -1])?, 3);
                    assert!(grid.cart_rank(&[2, 0]).is_err());
                    assert_eq!(grid.cart_coords(2)?, vec![1, 0]);
                    assert_eq!(grid.cartdim_get()?, 2);
                } else {
                    assert!(grid.is_none());
                }
                assert!(matches!(
                    world.cart_create(&[3, 2], &[false, false], false).unwrap_err(),
                    Error::InvalidTopology(_)
                ));
                assert_eq!(world.topology()?, TopologyKind::Undefined);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn cart_sub_rows_and_columns() {
        returning()
            .run(6, |mpi| {
                let world = mpi.world();
                let grid = world.cart_create(&[2, 3], &[false, false], false)?.unwrap();
                let rank = world.rank();
                let row = grid.cart_sub(&[false, true])?;
                assert_eq!(row.size(), 3);
                assert_eq!(row.rank(), rank % 3);
                assert_eq!(row.cart_get()?.dims, vec![3]);
                let col = grid.cart_sub(&[true, false])?;
                assert_eq!(col.size(), 2);
                assert_eq!(col.rank(), rank / 3);
                let mut sum = [0i32];
                row.allreduce(&[rank], &mut sum, crate::ReduceOp::Sum)?;
                assert_eq!(sum[0], if rank < 3 { 3 } else { 12 });
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn cart_sub_with_no_dims_is_congruent_to_self() {
        returning()
            .run(4, |mpi| {
                let world = mpi.world();
                let line = world.cart_create(&[4], &[false], false)?.unwrap();
                let alone = line.cart_sub(&[false])?;
                assert_eq!(alone.size(), 1);
                assert_eq!(alone.cartdim_get()?, 0);
                assert_eq!(
                    alone.compare(&mpi.self_comm())?,
                    CommunicatorRelation::Congruent
                );
                Ok(())
            })
            .unwrap();
    }
}
