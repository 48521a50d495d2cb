//! Block-distributed dense tensors and the process group that owns them.
//!
//! Every process runs the same control flow. Collective calls (`barrier`, `max_element`, `fetch`,
//! `get_fiber`, `gather`) must be issued by all ranks in the same order.

use crate::prelude::*;
use std::collections::BTreeMap;

/* #region process group */

/// SPMD process group.
pub trait ProcGroup {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn barrier(&self);

    /// Global maximum of `(value, loc)` pairs; equal values resolve to the smallest `loc`.
    fn all_reduce_max_loc(&self, value: f64, loc: usize) -> (f64, usize);

    /// Overwrite `buf` on every rank with the contents it has on `root`.
    fn broadcast(&self, buf: &mut [f64], root: usize);
}

/// Combine two `(value, loc)` candidates of a max-loc reduction.
pub(crate) fn max_loc(a: (f64, usize), b: (f64, usize)) -> (f64, usize) {
    if b.0 > a.0 || (b.0 == a.0 && b.1 < a.1) { b } else { a }
}

/// Single-process group; rank 0 of 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialGroup;

impl ProcGroup for SerialGroup {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_reduce_max_loc(&self, value: f64, loc: usize) -> (f64, usize) {
        (value, loc)
    }

    fn broadcast(&self, _buf: &mut [f64], _root: usize) {}
}

/// Process group over an MPI communicator.
#[cfg(feature = "mpi")]
pub struct MpiGroup {
    world: mpi::topology::SimpleCommunicator,
}

#[cfg(feature = "mpi")]
impl MpiGroup {
    pub fn new(world: mpi::topology::SimpleCommunicator) -> Self {
        Self { world }
    }
}

#[cfg(feature = "mpi")]
impl ProcGroup for MpiGroup {
    fn rank(&self) -> usize {
        use mpi::traits::*;
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        use mpi::traits::*;
        self.world.size() as usize
    }

    fn barrier(&self) {
        use mpi::traits::*;
        self.world.barrier();
    }

    fn all_reduce_max_loc(&self, value: f64, loc: usize) -> (f64, usize) {
        use mpi::traits::*;
        let nranks = self.size();
        let mut values = vec![0.0; nranks];
        let mut locs = vec![0_u64; nranks];
        self.world.all_gather_into(&value, &mut values[..]);
        self.world.all_gather_into(&(loc as u64), &mut locs[..]);
        values.into_iter().zip(locs).map(|(v, l)| (v, l as usize)).fold((f64::NEG_INFINITY, usize::MAX), max_loc)
    }

    fn broadcast(&self, buf: &mut [f64], root: usize) {
        use mpi::traits::*;
        // MPI counts are i32
        const CHUNK: usize = 1 << 27;
        let root = self.world.process_at_rank(root as i32);
        for chunk in buf.chunks_mut(CHUNK) {
            root.broadcast_into(chunk);
        }
    }
}

/* #endregion */

/* #region block tensor */

/// Dense tensor split into blocks along per-mode tile lists.
///
/// Block `id` (row-major over the block grid) is owned by rank `id % nranks`. Each block is stored
/// row-major with the dimensions of its tiles. Only owned blocks are allocated.
#[derive(Debug, Clone)]
pub struct BlockTensor {
    tiles: Vec<Vec<usize>>,
    tile_offsets: Vec<Vec<usize>>,
    rank: usize,
    nranks: usize,
    blocks: BTreeMap<usize, Vec<f64>>,
}

impl BlockTensor {
    /// Zero-initialized tensor with the given tiles along each mode.
    pub fn new(tiles: Vec<Vec<usize>>, group: &dyn ProcGroup) -> Result<Self> {
        ensure!(tiles.len() >= 2, "block tensors need at least two modes");
        ensure!(tiles.iter().flatten().all(|&t| t > 0), "tile sizes must be positive");

        let tile_offsets = tiles
            .iter()
            .map(|mode| {
                std::iter::once(0)
                    .chain(mode.iter().scan(0, |acc, &n| {
                        *acc += n;
                        Some(*acc)
                    }))
                    .collect()
            })
            .collect();

        let (rank, nranks) = (group.rank(), group.size());
        let mut tsr = Self { tiles, tile_offsets, rank, nranks, blocks: BTreeMap::new() };
        for id in (0..tsr.nblocks()).filter(|&id| id % nranks == rank) {
            tsr.blocks.insert(id, vec![0.0; tsr.block_size(id)]);
        }
        Ok(tsr)
    }

    pub fn num_modes(&self) -> usize {
        self.tiles.len()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.tiles.iter().map(|m| m.iter().sum()).collect()
    }

    pub fn tiles(&self, mode: usize) -> &[usize] {
        &self.tiles[mode]
    }

    pub fn nblocks(&self) -> usize {
        self.tiles.iter().map(|m| m.len()).product()
    }

    /// Flat id of the block at tile coordinates `bidx`.
    pub fn block_id(&self, bidx: &[usize]) -> usize {
        bidx.iter().zip(&self.tiles).fold(0, |acc, (&b, m)| acc * m.len() + b)
    }

    /// Tile coordinates of block `id`.
    pub fn block_index(&self, id: usize) -> Vec<usize> {
        let mut bidx = vec![0; self.num_modes()];
        let mut rem = id;
        for (b, m) in bidx.iter_mut().zip(&self.tiles).rev() {
            *b = rem % m.len();
            rem /= m.len();
        }
        bidx
    }

    pub fn block_dims(&self, id: usize) -> Vec<usize> {
        self.block_index(id).iter().zip(&self.tiles).map(|(&b, m)| m[b]).collect()
    }

    pub fn block_offsets(&self, id: usize) -> Vec<usize> {
        self.block_index(id).iter().zip(&self.tile_offsets).map(|(&b, o)| o[b]).collect()
    }

    pub fn block_size(&self, id: usize) -> usize {
        self.block_dims(id).iter().product()
    }

    pub fn owner(&self, id: usize) -> usize {
        id % self.nranks
    }

    pub fn is_local(&self, id: usize) -> bool {
        self.blocks.contains_key(&id)
    }

    /// Ids of the blocks owned by this rank, ascending.
    pub fn local_blocks(&self) -> Vec<usize> {
        self.blocks.keys().copied().collect()
    }

    /// Copy of an owned block. Remote blocks are read with [`BlockTensor::fetch`].
    pub fn get(&self, id: usize) -> Result<Vec<f64>> {
        Ok(self.local_block(id)?.to_vec())
    }

    /// Copy of block `id` on every rank, sent by its owner. Collective.
    pub fn fetch(&self, id: usize, group: &dyn ProcGroup) -> Result<Vec<f64>> {
        ensure!(id < self.nblocks(), "block {id} is out of range ({} blocks)", self.nblocks());
        let mut block = match self.blocks.get(&id) {
            Some(block) => block.clone(),
            None => vec![0.0; self.block_size(id)],
        };
        group.broadcast(&mut block, self.owner(id));
        Ok(block)
    }

    /// Overwrite an owned block.
    pub fn put(&mut self, id: usize, data: &[f64]) -> Result<()> {
        let block = self.local_block_mut(id)?;
        ensure!(block.len() == data.len(), "block {id} holds {} values, got {}", block.len(), data.len());
        block.copy_from_slice(data);
        Ok(())
    }

    pub fn local_block(&self, id: usize) -> Result<&[f64]> {
        match self.blocks.get(&id) {
            Some(block) => Ok(block),
            None => bail!("block {id} is owned by rank {}, not rank {}", self.owner(id), self.rank),
        }
    }

    pub fn local_block_mut(&mut self, id: usize) -> Result<&mut [f64]> {
        let (owner, rank) = (self.owner(id), self.rank);
        match self.blocks.get_mut(&id) {
            Some(block) => Ok(block),
            None => bail!("block {id} is owned by rank {owner}, not rank {rank}"),
        }
    }

    pub fn zero(&mut self) {
        self.blocks.values_mut().for_each(|b| b.fill(0.0));
    }

    /// Block id and in-block offset of the element at `index`.
    fn locate(&self, index: &[usize]) -> Result<(usize, usize)> {
        ensure!(index.len() == self.num_modes(), "index {index:?} has the wrong number of modes");
        let mut bidx = Vec::with_capacity(index.len());
        let mut local = Vec::with_capacity(index.len());
        for (&i, offsets) in index.iter().zip(&self.tile_offsets) {
            ensure!(i < offsets[offsets.len() - 1], "index {index:?} is out of bounds");
            let b = offsets.partition_point(|&o| o <= i) - 1;
            bidx.push(b);
            local.push(i - offsets[b]);
        }
        let id = self.block_id(&bidx);
        let pos = local.iter().zip(self.block_dims(id)).fold(0, |acc, (&l, d)| acc * d + l);
        Ok((id, pos))
    }

    /// Value at `index`, read from its owner. Collective.
    pub fn get_element(&self, index: &[usize], group: &dyn ProcGroup) -> Result<f64> {
        let (id, pos) = self.locate(index)?;
        let mut buf = [0.0];
        if let Some(block) = self.blocks.get(&id) {
            buf[0] = block[pos];
        }
        group.broadcast(&mut buf, self.owner(id));
        Ok(buf[0])
    }

    /// The first `len` elements along the last mode at the leading coordinates `lead`. Collective.
    pub fn get_fiber(&self, lead: &[usize], len: usize, group: &dyn ProcGroup) -> Result<Vec<f64>> {
        let nlast = self.num_modes() - 1;
        ensure!(lead.len() == nlast, "fiber prefix {lead:?} has the wrong number of modes");
        ensure!(len <= self.shape()[nlast], "fiber length {len} exceeds the last mode");

        let mut fiber = vec![0.0; len];
        let offsets = &self.tile_offsets[nlast];
        for (t, &tsize) in self.tiles[nlast].iter().enumerate() {
            let start = offsets[t];
            if start >= len {
                break;
            }
            let end = (start + tsize).min(len);
            let mut index = lead.to_vec();
            index.push(start);
            let (id, pos) = self.locate(&index)?;
            if let Some(block) = self.blocks.get(&id) {
                fiber[start..end].copy_from_slice(&block[pos..pos + end - start]);
            }
            group.broadcast(&mut fiber[start..end], self.owner(id));
        }
        Ok(fiber)
    }

    /// Global maximum element and its index. Collective.
    ///
    /// NaN entries are skipped; among equal maxima the one with the lowest row-major index wins.
    pub fn max_element(&self, group: &dyn ProcGroup) -> Result<(f64, Vec<usize>)> {
        let shape = self.shape();
        let mut best = (f64::NEG_INFINITY, usize::MAX);
        for (&id, block) in &self.blocks {
            let dims = self.block_dims(id);
            let offsets = self.block_offsets(id);
            for (pos, &x) in block.iter().enumerate() {
                if x.is_nan() || x < best.0 {
                    continue;
                }
                let flat = global_flat(pos, &dims, &offsets, &shape);
                if x > best.0 || flat < best.1 {
                    best = (x, flat);
                }
            }
        }
        let (value, flat) = group.all_reduce_max_loc(best.0, best.1);
        ensure!(flat != usize::MAX, "maximum of an empty or all-NaN tensor");
        Ok((value, unravel(flat, &shape)))
    }

    /// Row-major dense copy, keeping the first `last_extent` entries of the last mode. Collective.
    pub fn gather(&self, last_extent: usize, group: &dyn ProcGroup) -> Result<Vec<f64>> {
        let mut dense_shape = self.shape();
        let nlast = dense_shape.len() - 1;
        ensure!(last_extent <= dense_shape[nlast], "cannot gather {last_extent} entries of a mode of {}", dense_shape[nlast]);
        dense_shape[nlast] = last_extent;

        let mut dense = vec![0.0; dense_shape.iter().product()];
        for id in 0..self.nblocks() {
            let block = self.fetch(id, group)?;
            self.copy_block(id, &dense_shape, |d, b| dense[d].copy_from_slice(&block[b]));
        }
        Ok(dense)
    }

    /// Fill owned blocks from a row-major dense array whose last mode holds `last_extent` entries.
    ///
    /// Entries beyond `last_extent` are zeroed.
    pub fn scatter(&mut self, dense: &[f64], last_extent: usize) -> Result<()> {
        let mut dense_shape = self.shape();
        let nlast = dense_shape.len() - 1;
        ensure!(last_extent <= dense_shape[nlast], "cannot scatter {last_extent} entries into a mode of {}", dense_shape[nlast]);
        dense_shape[nlast] = last_extent;
        ensure!(
            dense.len() == dense_shape.iter().product::<usize>(),
            "dense array holds {} values, expected shape {dense_shape:?}",
            dense.len()
        );

        let ids = self.local_blocks();
        for id in ids {
            let mut block = vec![0.0; self.block_size(id)];
            self.copy_block(id, &dense_shape, |d, b| block[b].copy_from_slice(&dense[d]));
            self.put(id, &block)?;
        }
        Ok(())
    }

    /// Walk the rows (runs along the last mode) that block `id` shares with a dense array,
    /// passing the dense range and the block range of each run.
    fn copy_block(&self, id: usize, dense_shape: &[usize], mut f: impl FnMut(std::ops::Range<usize>, std::ops::Range<usize>)) {
        let dims = self.block_dims(id);
        let offsets = self.block_offsets(id);
        let nlast = dims.len() - 1;
        let (olast, dlast) = (offsets[nlast], dims[nlast]);
        let extent = dense_shape[nlast];
        if olast >= extent {
            return;
        }
        let run = dlast.min(extent - olast);

        let nrows: usize = dims[..nlast].iter().product();
        for row in 0..nrows {
            let mut rem = row;
            let mut dense_pos = 0;
            let mut lead = vec![0; nlast];
            for m in (0..nlast).rev() {
                lead[m] = rem % dims[m];
                rem /= dims[m];
            }
            for m in 0..nlast {
                dense_pos = dense_pos * dense_shape[m] + offsets[m] + lead[m];
            }
            let d0 = dense_pos * extent + olast;
            let b0 = row * dlast;
            f(d0..d0 + run, b0..b0 + run);
        }
    }
}

/// Row-major global index of in-block position `pos`.
fn global_flat(pos: usize, dims: &[usize], offsets: &[usize], shape: &[usize]) -> usize {
    let mut rem = pos;
    let mut local = vec![0; dims.len()];
    for m in (0..dims.len()).rev() {
        local[m] = rem % dims[m];
        rem /= dims[m];
    }
    (0..dims.len()).fold(0, |acc, m| acc * shape[m] + offsets[m] + local[m])
}

fn unravel(flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    let mut rem = flat;
    for (i, &n) in index.iter_mut().zip(shape).rev() {
        *i = rem % n;
        rem /= n;
    }
    index
}

/* #endregion */
