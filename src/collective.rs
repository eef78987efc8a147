//! Collective operations.
//!
//! All collectives run over a communicator's collective context, so they
//! never match point-to-point traffic. Every process of the group must call
//! the same collectives in the same order with consistent arguments. Local
//! argument errors are reported before anything is sent.
//!
//! | Operation | Algorithm |
//! |-----------|-----------|
//! | barrier | dissemination, `ceil(log2 n)` rounds |
//! | broadcast | binomial tree rooted at `root` |
//! | gather, gatherv, scatter | linear through the root |
//! | allgather, allgatherv | ring, `n - 1` steps |
//! | reduce | binomial tree (commutative) or rank-ordered fold at the root |
//! | allreduce | reduce to rank 0, then broadcast |

use crate::comm::{CommView, Communicator};
use crate::datatype::{from_bytes, to_bytes, MpiDatatype};
use crate::error::{Error, Result};
use crate::op::{Op, OpEntry};
use crate::process::ProcessState;

const TAG_BARRIER: i32 = 1;
const TAG_BCAST: i32 = 2;
const TAG_GATHER: i32 = 3;
const TAG_SCATTER: i32 = 4;
const TAG_ALLGATHER: i32 = 5;
const TAG_REDUCE: i32 = 6;

// ============================================================================
// Byte-level algorithms
// ============================================================================

pub(crate) fn barrier(state: &ProcessState, view: &CommView) -> Result<()> {
    let (n, rank) = (view.size(), view.rank);
    let context = view.context.collective();
    let mut distance = 1;
    while distance < n {
        state.send_to(
            view.member((rank + distance) % n)?,
            context,
            TAG_BARRIER,
            Vec::new(),
        )?;
        state.recv_from(
            Some(view.member((rank - distance + n) % n)?),
            context,
            Some(TAG_BARRIER),
        )?;
        distance <<= 1;
    }
    Ok(())
}

/// Binomial-tree broadcast of `data` from `root`. Returns root's bytes on
/// every process.
pub(crate) fn bcast_bytes(
    state: &ProcessState,
    view: &CommView,
    mut data: Vec<u8>,
    root: i32,
) -> Result<Vec<u8>> {
    let n = view.size();
    let relative = (view.rank - root + n) % n;
    let context = view.context.collective();

    let mut mask = 1;
    while mask < n {
        if relative & mask != 0 {
            let source = (relative - mask + root) % n;
            data = state
                .recv_from(Some(view.member(source)?), context, Some(TAG_BCAST))?
                .payload;
            break;
        }
        mask <<= 1;
    }
    mask >>= 1;
    while mask > 0 {
        if relative + mask < n {
            let dest = (relative + mask + root) % n;
            state.send_to(view.member(dest)?, context, TAG_BCAST, data.clone())?;
        }
        mask >>= 1;
    }
    Ok(data)
}

/// Every process's block, indexed by rank, on every process (ring).
pub(crate) fn allgather_bytes(
    state: &ProcessState,
    view: &CommView,
    own: Vec<u8>,
) -> Result<Vec<Vec<u8>>> {
    let (n, rank) = (view.size(), view.rank);
    let context = view.context.collective();
    let right = view.member((rank + 1) % n)?;
    let left = view.member((rank - 1 + n) % n)?;

    let mut blocks = vec![Vec::new(); n as usize];
    blocks[rank as usize] = own;
    for step in 0..n - 1 {
        let outgoing = ((rank - step + n) % n) as usize;
        let incoming = ((rank - step - 1 + n) % n) as usize;
        state.send_to(right, context, TAG_ALLGATHER, blocks[outgoing].clone())?;
        blocks[incoming] = state
            .recv_from(Some(left), context, Some(TAG_ALLGATHER))?
            .payload;
    }
    Ok(blocks)
}

/// Every process's block at the root (indexed by rank), `None` elsewhere.
fn gather_bytes(
    state: &ProcessState,
    view: &CommView,
    own: Vec<u8>,
    root: i32,
) -> Result<Option<Vec<Vec<u8>>>> {
    let context = view.context.collective();
    if view.rank != root {
        state.send_to(view.member(root)?, context, TAG_GATHER, own)?;
        return Ok(None);
    }
    let mut own = Some(own);
    let mut blocks = Vec::with_capacity(view.size() as usize);
    for rank in 0..view.size() {
        if rank == root {
            blocks.push(own.take().unwrap_or_default());
        } else {
            let envelope =
                state.recv_from(Some(view.member(rank)?), context, Some(TAG_GATHER))?;
            blocks.push(envelope.payload);
        }
    }
    Ok(Some(blocks))
}

// ============================================================================
// Reduction
// ============================================================================

fn reduce_values<T: MpiDatatype>(
    state: &ProcessState,
    view: &CommView,
    send: &[T],
    op: &OpEntry,
    root: i32,
) -> Result<Option<Vec<T>>> {
    if op.commutative {
        reduce_binomial(state, view, send, op, root)
    } else {
        reduce_ordered(state, view, send, op, root)
    }
}

fn reduce_binomial<T: MpiDatatype>(
    state: &ProcessState,
    view: &CommView,
    send: &[T],
    op: &OpEntry,
    root: i32,
) -> Result<Option<Vec<T>>> {
    let n = view.size();
    let relative = (view.rank - root + n) % n;
    let context = view.context.collective();
    let mut acc = send.to_vec();

    let mut mask = 1;
    while mask < n {
        if relative & mask == 0 {
            let child = relative | mask;
            if child < n {
                let source = view.member((child + root) % n)?;
                let envelope = state.recv_from(Some(source), context, Some(TAG_REDUCE))?;
                op.apply(&from_bytes::<T>(&envelope.payload), &mut acc)?;
            }
        } else {
            let parent = view.member(((relative & !mask) + root) % n)?;
            state.send_to(parent, context, TAG_REDUCE, to_bytes(&acc))?;
            return Ok(None);
        }
        mask <<= 1;
    }
    Ok(Some(acc))
}

/// Combine at the root in rank order: `v0 ∘ (v1 ∘ (… ∘ v(n-1)))`.
fn reduce_ordered<T: MpiDatatype>(
    state: &ProcessState,
    view: &CommView,
    send: &[T],
    op: &OpEntry,
    root: i32,
) -> Result<Option<Vec<T>>> {
    let Some(blocks) = gather_bytes(state, view, to_bytes(send), root)? else {
        return Ok(None);
    };
    let mut values: Vec<Vec<T>> = blocks.iter().map(|b| from_bytes(b)).collect();
    let mut acc = values.pop().unwrap_or_default();
    for value in values.iter().rev() {
        op.apply(value, &mut acc)?;
    }
    Ok(Some(acc))
}

// ============================================================================
// Argument checks
// ============================================================================

fn check_layout(view: &CommView, counts: &[i32], displs: &[i32], len: usize) -> Result<()> {
    let n = view.size() as usize;
    if counts.len() != n || displs.len() != n {
        return Err(Error::InvalidArg(format!(
            "expected {n} counts and displacements, got {} and {}",
            counts.len(),
            displs.len()
        )));
    }
    for (&count, &displ) in counts.iter().zip(displs) {
        if count < 0 {
            return Err(Error::InvalidCount(count.into()));
        }
        if displ < 0 {
            return Err(Error::InvalidArg(format!("negative displacement {displ}")));
        }
        if displ as usize + count as usize > len {
            return Err(Error::InvalidBuffer(format!(
                "block at {displ} of {count} elements exceeds receive buffer of {len}"
            )));
        }
    }
    Ok(())
}

fn check_capacity(what: &str, have: usize, need: usize) -> Result<()> {
    if have < need {
        return Err(Error::InvalidBuffer(format!(
            "{what} holds {have} elements, needs {need}"
        )));
    }
    Ok(())
}

fn place<T: MpiDatatype>(recv: &mut [T], block: &[u8], displ: i32, count: i32) {
    let start = displ as usize;
    T::decode(block, &mut recv[start..start + count as usize]);
}

/// Resolve `op` and check it combines `T` before any message moves.
fn lookup_op<T: MpiDatatype>(state: &ProcessState, op: Op) -> Result<std::rc::Rc<OpEntry>> {
    let entry = state.ops.borrow().get(op)?;
    entry.check_element::<T>()?;
    Ok(entry)
}

// ============================================================================
// Typed collectives
// ============================================================================

impl Communicator {
    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Barrier synchronization.
    ///
    /// All processes in the communicator must call this function. No process
    /// will return until all processes have entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        self.guard(|state, view| {
            view.require_intra("barrier")?;
            barrier(state, view)
        })
    }

    // ========================================================================
    // Data movement
    // ========================================================================

    /// Broadcast `data` from `root` to all processes.
    ///
    /// Afterwards every process's `data` equals root's `data` from before the
    /// call.
    pub fn broadcast<T: MpiDatatype>(&self, data: &mut [T], root: i32) -> Result<()> {
        self.guard(|state, view| {
            view.require_intra("broadcast")?;
            view.check_root(root)?;
            let payload = if view.rank == root {
                to_bytes(data)
            } else {
                Vec::new()
            };
            let bytes = bcast_bytes(state, view, payload, root)?;
            if view.rank != root {
                T::decode(&bytes, data);
            }
            Ok(())
        })
    }

    /// Gather equal-sized blocks to `root`, in rank order.
    ///
    /// At the root `recv` must hold `size * send.len()` elements; elsewhere
    /// it is ignored.
    pub fn gather<T: MpiDatatype>(&self, send: &[T], recv: &mut [T], root: i32) -> Result<()> {
        self.guard(|state, view| {
            view.require_intra("gather")?;
            view.check_root(root)?;
            let block = send.len();
            if view.rank == root {
                check_capacity("gather receive buffer", recv.len(), block * view.size() as usize)?;
            }
            if let Some(blocks) = gather_bytes(state, view, to_bytes(send), root)? {
                for (rank, bytes) in blocks.iter().enumerate() {
                    T::decode(bytes, &mut recv[rank * block..(rank + 1) * block]);
                }
            }
            Ok(())
        })
    }

    /// Gather variable-sized blocks to `root`; rank `j`'s block lands at
    /// `recv[displs[j]..displs[j] + recvcounts[j]]`.
    pub fn gatherv<T: MpiDatatype>(
        &self,
        send: &[T],
        recv: &mut [T],
        recvcounts: &[i32],
        displs: &[i32],
        root: i32,
    ) -> Result<()> {
        self.guard(|state, view| {
            view.require_intra("gatherv")?;
            view.check_root(root)?;
            if view.rank == root {
                check_layout(view, recvcounts, displs, recv.len())?;
            }
            if let Some(blocks) = gather_bytes(state, view, to_bytes(send), root)? {
                for (rank, bytes) in blocks.iter().enumerate() {
                    place(recv, bytes, displs[rank], recvcounts[rank]);
                }
            }
            Ok(())
        })
    }

    /// Scatter equal-sized blocks of `send` from `root`; rank `j` receives
    /// `send[j * recv.len()..(j + 1) * recv.len()]`.
    pub fn scatter<T: MpiDatatype>(&self, send: &[T], recv: &mut [T], root: i32) -> Result<()> {
        self.guard(|state, view| {
            view.require_intra("scatter")?;
            view.check_root(root)?;
            let block = recv.len();
            let context = view.context.collective();
            if view.rank != root {
                let envelope =
                    state.recv_from(Some(view.member(root)?), context, Some(TAG_SCATTER))?;
                T::decode(&envelope.payload, recv);
                return Ok(());
            }
            check_capacity("scatter send buffer", send.len(), block * view.size() as usize)?;
            for rank in 0..view.size() {
                let chunk = &send[rank as usize * block..(rank as usize + 1) * block];
                if rank == root {
                    recv.copy_from_slice(chunk);
                } else {
                    state.send_to(view.member(rank)?, context, TAG_SCATTER, to_bytes(chunk))?;
                }
            }
            Ok(())
        })
    }

    /// Gather equal-sized blocks from every process to every process.
    pub fn allgather<T: MpiDatatype>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        self.guard(|state, view| {
            view.require_intra("allgather")?;
            let block = send.len();
            check_capacity("allgather receive buffer", recv.len(), block * view.size() as usize)?;
            let blocks = allgather_bytes(state, view, to_bytes(send))?;
            for (rank, bytes) in blocks.iter().enumerate() {
                T::decode(bytes, &mut recv[rank * block..(rank + 1) * block]);
            }
            Ok(())
        })
    }

    /// Gather variable-sized blocks from every process to every process.
    ///
    /// Rank `j`'s block lands at `recv[displs[j]..displs[j] + recvcounts[j]]`
    /// on every process. Elements outside those blocks are left untouched.
    pub fn allgatherv<T: MpiDatatype>(
        &self,
        send: &[T],
        recv: &mut [T],
        recvcounts: &[i32],
        displs: &[i32],
    ) -> Result<()> {
        self.guard(|state, view| {
            view.require_intra("allgatherv")?;
            check_layout(view, recvcounts, displs, recv.len())?;
            let blocks = allgather_bytes(state, view, to_bytes(send))?;
            for (rank, bytes) in blocks.iter().enumerate() {
                place(recv, bytes, displs[rank], recvcounts[rank]);
            }
            Ok(())
        })
    }

    /// In-place [`allgatherv`](Self::allgatherv): the caller's own block is
    /// read from `recv[displs[rank]..]` and left as is.
    pub fn allgatherv_in_place<T: MpiDatatype>(
        &self,
        recv: &mut [T],
        recvcounts: &[i32],
        displs: &[i32],
    ) -> Result<()> {
        self.guard(|state, view| {
            view.require_intra("allgatherv")?;
            check_layout(view, recvcounts, displs, recv.len())?;
            let me = view.rank as usize;
            let start = displs[me] as usize;
            let own = to_bytes(&recv[start..start + recvcounts[me] as usize]);
            let blocks = allgather_bytes(state, view, own)?;
            for (rank, bytes) in blocks.iter().enumerate() {
                if rank != me {
                    place(recv, bytes, displs[rank], recvcounts[rank]);
                }
            }
            Ok(())
        })
    }

    // ========================================================================
    // Reductions
    // ========================================================================

    /// Reduce `send` from every process into `recv` at `root`.
    ///
    /// `op` is a built-in [`ReduceOp`](crate::ReduceOp) or an [`Op`] from
    /// [`Mpi::op_create`](crate::Mpi::op_create). At the root `recv` must hold
    /// at least `send.len()` elements; elsewhere it is ignored.
    pub fn reduce<T: MpiDatatype>(
        &self,
        send: &[T],
        recv: &mut [T],
        op: impl Into<Op>,
        root: i32,
    ) -> Result<()> {
        let op = op.into();
        self.guard(|state, view| {
            view.require_intra("reduce")?;
            view.check_root(root)?;
            if view.rank == root {
                check_capacity("reduce receive buffer", recv.len(), send.len())?;
            }
            let entry = lookup_op::<T>(state, op)?;
            if let Some(result) = reduce_values(state, view, send, &entry, root)? {
                let len = result.len().min(recv.len());
                recv[..len].copy_from_slice(&result[..len]);
            }
            Ok(())
        })
    }

    /// Reduce `send` from every process into `recv` on every process.
    pub fn allreduce<T: MpiDatatype>(
        &self,
        send: &[T],
        recv: &mut [T],
        op: impl Into<Op>,
    ) -> Result<()> {
        let op = op.into();
        self.guard(|state, view| {
            view.require_intra("allreduce")?;
            check_capacity("allreduce receive buffer", recv.len(), send.len())?;
            let entry = lookup_op::<T>(state, op)?;
            let reduced = reduce_values(state, view, send, &entry, 0)?;
            let payload = reduced.map(|r| to_bytes(&r)).unwrap_or_default();
            let bytes = bcast_bytes(state, view, payload, 0)?;
            T::decode(&bytes, &mut recv[..send.len()]);
            Ok(())
        })
    }

    /// In-place [`allreduce`](Self::allreduce): `data` is both input and
    /// result.
    pub fn allreduce_in_place<T: MpiDatatype>(&self, data: &mut [T], op: impl Into<Op>) -> Result<()> {
        let send = data.to_vec();
        self.allreduce(&send, data, op)
    }

    /// Reduce a single value across all processes.
    pub fn allreduce_scalar<T: MpiDatatype>(&self, value: T, op: impl Into<Op>) -> Result<T> {
        let mut result = [T::default()];
        self.allreduce(&[value], &mut result, op)?;
        Ok(result[0])
    }
}
