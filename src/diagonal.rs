//! Residual diagonal `D[u, v] = (uv|uv)` and pivot selection.

use crate::prelude::*;
use itertools::iproduct;

/// Largest residual diagonal element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pivot {
    pub value: f64,
    pub bfu: usize,
    pub bfv: usize,
}

/// Owner of the residual diagonal, an `(nao, nao)` block tensor tiled like the AO space.
#[derive(Debug, Clone)]
pub struct DiagonalTracker {
    diag: BlockTensor,
}

/// Block tensor over AO pairs, optionally followed by one untiled mode of `extra` entries.
pub(crate) fn ao_pair_tensor(tiling: &AoTiling, extra: Option<usize>, group: &dyn ProcGroup) -> Result<BlockTensor> {
    let mut tiles = vec![tiling.tiles().to_vec(); 2];
    if let Some(n) = extra {
        tiles.push(vec![n]);
    }
    BlockTensor::new(tiles, group)
}

impl DiagonalTracker {
    /// Evaluate `(s1 s2 | s1 s2)` for every significant shell pair of the locally owned blocks.
    pub fn compute<E: IntegralEvaluator + ?Sized>(
        tiling: &AoTiling,
        pairs: &ShellPairList,
        eval: &E,
        group: &dyn ProcGroup,
    ) -> Result<Self> {
        let layout = tiling.layout();
        let nt = tiling.ntiles();
        let mut diag = ao_pair_tensor(tiling, None, group)?;

        for id in diag.local_blocks() {
            let (ti, tj) = (id / nt, id % nt);
            let nj = tiling.tiles()[tj];
            let spairs = pairs.pairs_in_block(tiling, ti, tj);
            let quartets: Vec<[usize; 4]> = spairs.iter().map(|&(s1, s2)| [s1, s2, s1, s2]).collect();
            let ints = eri_quartet_batch(eval, &quartets);

            let block = diag.local_block_mut(id)?;
            for (&(s1, s2), buf) in spairs.iter().zip(ints) {
                let Some(buf) = buf else { continue };
                let (n1, n2) = (layout.shell_size(s1), layout.shell_size(s2));
                let (o1, o2) = (tiling.shell_offset_in_tile(s1), tiling.shell_offset_in_tile(s2));
                for (f1, f2) in iproduct!(0..n1, 0..n2) {
                    block[(o1 + f1) * nj + o2 + f2] = buf[f1 * n2 * n1 * n2 + f2 * n1 * n2 + f1 * n2 + f2];
                }
            }
        }
        Ok(Self { diag })
    }

    /// Diagonal restored from a row-major `(nao, nao)` array.
    pub fn from_dense(tiling: &AoTiling, dense: &[f64], group: &dyn ProcGroup) -> Result<Self> {
        let mut diag = ao_pair_tensor(tiling, None, group)?;
        diag.scatter(dense, tiling.nao())?;
        Ok(Self { diag })
    }

    /// Global maximum of the residual diagonal. Collective.
    ///
    /// Equal maxima resolve to the lowest `u * nao + v`.
    pub fn select_pivot(&self, group: &dyn ProcGroup) -> Result<Pivot> {
        let (value, index) = self.diag.max_element(group)?;
        ensure!(value.is_finite(), "non-finite pivot value {value} at ({}, {})", index[0], index[1]);
        Ok(Pivot { value, bfu: index[0], bfv: index[1] })
    }

    pub fn tensor(&self) -> &BlockTensor {
        &self.diag
    }

    pub fn tensor_mut(&mut self) -> &mut BlockTensor {
        &mut self.diag
    }
}
