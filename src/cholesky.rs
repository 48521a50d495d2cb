//! Pivoted incremental Cholesky decomposition of the AO electron-repulsion supermatrix.
//!
//! The `(nao^2, nao^2)` matrix `(uv|pq)` is never formed. Each iteration takes the largest residual
//! diagonal element `(bfu, bfv)` as pivot, computes the integral row `(uv|bfu bfv)`, and appends
//!
//! ```text
//! L[u, v, count] = (R[u, v] - sum_{k < count} L[u, v, k] L[bfu, bfv, k]) / sqrt(D[bfu, bfv])
//! D[u, v]       -= L[u, v, count]^2
//! ```
//!
//! until `max(D) <= diagtol` or the factor is full.

use crate::ao2mo::full_mo_count;
use crate::diagonal::ao_pair_tensor;
use crate::prelude::*;
use itertools::iproduct;
use std::time::Instant;

/// Converged (or exhausted) AO-basis factor.
#[derive(Debug)]
pub struct CholeskyFactor {
    /// `(nao, nao, max_vectors)`; columns at and past `count` are zero.
    pub chol: BlockTensor,
    pub count: usize,
    pub residual: DiagonalTracker,
}

impl CholeskyFactor {
    /// Dense `(nao, nao, count)` factor. Collective.
    pub fn to_tensor(&self, group: &dyn ProcGroup) -> Result<Tsr> {
        dense_factor(&self.chol, self.count, group)
    }
}

fn dense_factor(chol: &BlockTensor, count: usize, group: &dyn ProcGroup) -> Result<Tsr> {
    let device = DeviceTsr::default();
    let nao = chol.shape()[0];
    let data = chol.gather(count, group)?;
    Ok(rt::asarray((data, [nao, nao, count].c(), &device)).into_dim::<IxD>())
}

/// Per-pivot update of one `(ti, tj)` block, shared by every access strategy.
struct RowUpdate<'k> {
    tiling: &'k AoTiling,
    pairs: &'k ShellPairList,
    /// `L[bfu, bfv, 0..count]`
    lpiv: Vec<f64>,
    sqrt_d0: f64,
    count: usize,
    max_vectors: usize,
}

impl RowUpdate<'_> {
    fn apply(&self, id: usize, row: &[f64], diag: &mut [f64], chol: &mut [f64]) {
        let layout = self.tiling.layout();
        let nt = self.tiling.ntiles();
        let (ti, tj) = (id / nt, id % nt);
        let nj = self.tiling.tiles()[tj];
        let (count, nv) = (self.count, self.max_vectors);

        for (s1, s2) in self.pairs.pairs_in_block(self.tiling, ti, tj) {
            let (o1, o2) = (self.tiling.shell_offset_in_tile(s1), self.tiling.shell_offset_in_tile(s2));
            for (f1, f2) in iproduct!(0..layout.shell_size(s1), 0..layout.shell_size(s2)) {
                let ij = (o1 + f1) * nj + o2 + f2;
                let lij = &mut chol[ij * nv..(ij + 1) * nv];
                let dot: f64 = lij[..count].iter().zip(&self.lpiv).map(|(a, b)| a * b).sum();
                let val = (row[ij] - dot) / self.sqrt_d0;
                lij[count] = val;
                diag[ij] -= val * val;
            }
        }
    }
}

/// Iteration state of the decomposition.
pub struct CholeskyBuilder<'a, E: IntegralEvaluator + ?Sized> {
    eval: &'a E,
    tiling: &'a AoTiling,
    pairs: &'a ShellPairList,
    opts: &'a CDOptions,
    group: &'a dyn ProcGroup,
    files: CheckpointFiles,
    max_vectors: usize,
    diag: DiagonalTracker,
    row: BlockTensor,
    chol: BlockTensor,
    count: usize,
}

impl<'a, E: IntegralEvaluator + ?Sized> CholeskyBuilder<'a, E> {
    pub fn new(
        eval: &'a E,
        tiling: &'a AoTiling,
        pairs: &'a ShellPairList,
        opts: &'a CDOptions,
        group: &'a dyn ProcGroup,
        start: CDStart,
    ) -> Result<Self> {
        opts.validate()?;
        ensure!(
            eval.shell_offsets() == tiling.layout().ao_loc(),
            "integral evaluator and AO tiling disagree on the shell layout"
        );
        ensure!(pairs.nbas() == tiling.layout().nbas(), "shell pair list covers {} shells, basis has {}", pairs.nbas(), tiling.layout().nbas());

        let nao = tiling.nao();
        let max_vectors = opts.max_vectors(nao);
        ensure!(max_vectors > 0, "the factor must hold at least one vector");

        let time = Instant::now();
        let mut chol = ao_pair_tensor(tiling, Some(max_vectors), group)?;
        let (diag, count) = match start {
            CDStart::FreshStart => {
                let diag = DiagonalTracker::compute(tiling, pairs, eval, group)?;
                if group.rank() == 0 {
                    log::info!("Time for computing the diagonal: {:.2?}", time.elapsed());
                }
                (diag, 0)
            },
            CDStart::Resumed(state) => {
                ensure!(
                    state.count <= max_vectors,
                    "checkpoint holds {} vectors, more than the capacity {max_vectors}",
                    state.count
                );
                let diag = DiagonalTracker::from_dense(tiling, &state.diag, group)?;
                chol.scatter(&state.chol, state.count)?;
                if group.rank() == 0 {
                    log::info!("Time for reading the checkpoint: {:.2?}", time.elapsed());
                }
                (diag, state.count)
            },
        };
        let row = ao_pair_tensor(tiling, None, group)?;

        Ok(Self { eval, tiling, pairs, opts, group, files: CheckpointFiles::new(opts), max_vectors, diag, row, chol, count })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn max_vectors(&self) -> usize {
        self.max_vectors
    }

    fn checkpointing(&self) -> bool {
        self.opts.writet && self.tiling.nao() > self.opts.checkpoint_min_nbf
    }

    /// Add one vector, unless the residual is converged or the factor is full.
    ///
    /// Returns the pivot used, or `None` when nothing was added. Writes a checkpoint every
    /// `write_vcount` vectors. Collective.
    pub fn step(&mut self) -> Result<Option<Pivot>> {
        let pivot = self.diag.select_pivot(self.group)?;
        if pivot.value <= self.opts.diagtol || self.count >= self.max_vectors {
            return Ok(None);
        }
        if self.group.rank() == 0 {
            log::debug!("vector {:5}: pivot ({}, {}) = {:.6e}", self.count, pivot.bfu, pivot.bfv, pivot.value);
        }
        self.compute_row(&pivot)?;
        self.update_row_and_diagonal(&pivot)?;
        self.count += 1;

        if self.checkpointing() && self.count % self.opts.write_vcount == 0 {
            self.files.write(self.diag.tensor(), &self.chol, self.count, self.group)?;
        }
        Ok(Some(pivot))
    }

    /// Run until convergence or until the factor is full.
    pub fn run(mut self) -> Result<CholeskyFactor> {
        let time = Instant::now();
        let rank0 = self.group.rank() == 0;
        if rank0 {
            log::info!("Begin cholesky decomposition: diagtol = {:e}, max vectors = {}", self.opts.diagtol, self.max_vectors);
        }

        while self.step()?.is_some() {}

        // a nonzero multiple of write_vcount was already written by the last step
        if self.checkpointing() && (self.count == 0 || self.count % self.opts.write_vcount != 0) {
            self.files.write(self.diag.tensor(), &self.chol, self.count, self.group)?;
        }
        let residual = self.diag.select_pivot(self.group)?.value;
        if rank0 {
            if residual > self.opts.diagtol {
                log::warn!("Cholesky factor is full with residual {residual:.3e} > diagtol");
            }
            log::info!("Number of cholesky vectors = {}", self.count);
            log::info!("Time for computing cholesky vectors: {:.2?}", time.elapsed());
        }

        Ok(CholeskyFactor { chol: self.chol, count: self.count, residual: self.diag })
    }

    /// `R[u, v] = (uv | bfu bfv)` over the significant shell pairs of the owned blocks.
    fn compute_row(&mut self, pivot: &Pivot) -> Result<()> {
        let layout = self.tiling.layout();
        let nt = self.tiling.ntiles();
        let (s1, s2) = (layout.bf2shell(pivot.bfu), layout.bf2shell(pivot.bfv));
        let (n1, n2) = (layout.shell_size(s1), layout.shell_size(s2));
        let (f1, f2) = (pivot.bfu - layout.shell2bf(s1), pivot.bfv - layout.shell2bf(s2));

        self.row.zero();
        for id in self.row.local_blocks() {
            let (ti, tj) = (id / nt, id % nt);
            let nj = self.tiling.tiles()[tj];
            let spairs = self.pairs.pairs_in_block(self.tiling, ti, tj);
            let quartets: Vec<[usize; 4]> = spairs.iter().map(|&(s3, s4)| [s3, s4, s1, s2]).collect();
            let ints = eri_quartet_batch(self.eval, &quartets);

            let block = self.row.local_block_mut(id)?;
            for (&(s3, s4), buf) in spairs.iter().zip(ints) {
                let Some(buf) = buf else { continue };
                let (n3, n4) = (layout.shell_size(s3), layout.shell_size(s4));
                let (o3, o4) = (self.tiling.shell_offset_in_tile(s3), self.tiling.shell_offset_in_tile(s4));
                for (f3, f4) in iproduct!(0..n3, 0..n4) {
                    block[(o3 + f3) * nj + o4 + f4] = buf[((f3 * n4 + f4) * n1 + f1) * n2 + f2];
                }
            }
        }
        Ok(())
    }

    fn update_row_and_diagonal(&mut self, pivot: &Pivot) -> Result<()> {
        let kernel = RowUpdate {
            tiling: self.tiling,
            pairs: self.pairs,
            lpiv: self.chol.get_fiber(&[pivot.bfu, pivot.bfv], self.count, self.group)?,
            sqrt_d0: pivot.value.sqrt(),
            count: self.count,
            max_vectors: self.max_vectors,
        };

        let diag = self.diag.tensor_mut();
        match self.opts.access {
            AccessStrategy::BlockTransfer => {
                for id in self.row.local_blocks() {
                    let row = self.row.get(id)?;
                    let mut d = diag.get(id)?;
                    let mut l = self.chol.get(id)?;
                    kernel.apply(id, &row, &mut d, &mut l);
                    diag.put(id, &d)?;
                    self.chol.put(id, &l)?;
                }
            },
            AccessStrategy::LocalBuffer => {
                self.group.barrier();
                for id in self.row.local_blocks() {
                    let row = self.row.local_block(id)?;
                    kernel.apply(id, row, diag.local_block_mut(id)?, self.chol.local_block_mut(id)?);
                }
                self.group.barrier();
            },
        }
        Ok(())
    }
}

/// Cholesky vectors of the ERI in the MO basis.
///
/// Runs the AO decomposition (or resumes it from disk), drops frozen orbitals from `sys` and `lcao`,
/// and contracts the factor with `lcao` (`(nbf_orig, nmo)`). `sys` is updated in place.
pub fn compute_cholesky_mo<E: IntegralEvaluator + ?Sized>(
    sys: &mut SystemData,
    eval: &E,
    pairs: &ShellPairList,
    lcao: Tsr,
    opts: &CDOptions,
    group: &dyn ProcGroup,
    is_mso: bool,
) -> Result<CDResults> {
    let time = Instant::now();
    opts.validate()?;
    let layout = ShellLayout::new(eval.shell_offsets())?;
    let nao = layout.nao();
    ensure!(nao == sys.nbf_orig, "basis has {nao} functions, system data expects {}", sys.nbf_orig);
    ensure!(sys.nbf == sys.nbf_orig, "frozen orbitals were already removed from the system data");
    let nmo_full = full_mo_count(sys, is_mso);
    ensure!(
        lcao.shape() == &[nao, nmo_full],
        "coefficient matrix shape {:?}, expected [{nao}, {nmo_full}]",
        lcao.shape()
    );
    let tiling = AoTiling::new(layout, opts.ao_tilesize)?;
    let max_vectors = opts.max_vectors(nao);

    let files = CheckpointFiles::new(opts);
    let start = CDStart::resolve(&files, opts, nao)?;
    let restart_copy = match &start {
        CDStart::Resumed(state) => state.diag.len() + state.chol.len(),
        CDStart::FreshStart => 0,
    };

    let mut ledger = MemoryLedger::from_options(opts);
    ledger.add(restart_copy).add(nao * nao).add(nao * nao).add(nao * nao * max_vectors);
    ledger.check("computing cholesky vectors")?;

    let builder = CholeskyBuilder::new(eval, &tiling, pairs, opts, group, start)?;
    ledger.remove(restart_copy);
    let CholeskyFactor { chol, count, residual } = builder.run()?;
    drop(residual);

    ledger.remove(nao * nao).remove(nao * nao).add(nao * nao * count);
    ledger.check("resizing the ao cholesky tensor")?;
    let l_ao = dense_factor(&chol, count, group)?;
    drop(chol);
    ledger.remove(nao * nao * max_vectors);

    let mo = update_sysdata(sys, opts, is_mso)?;
    let lcao = if sys.do_freeze() { reshape_mo_matrix(sys, &lcao, true)? } else { lcao };
    let chol_mo = transform_cholesky(l_ao, &lcao, mo, &mut ledger)?;

    if group.rank() == 0 {
        log::info!("Total time for cholesky decomposition: {:.2?}", time.elapsed());
    }
    Ok(CDResults { chol_mo, count })
}

#[cfg(test)]
mod test {
    use super::*;

    /// `(uv|pq) = sum_k a_k[uv] a_k[pq]`, a positive semi-definite supermatrix of rank `vecs.len()`.
    fn low_rank_eri(ao_loc: Vec<usize>, vecs: &[Vec<f64>]) -> DenseEri {
        let n2 = vecs[0].len();
        let data = iproduct!(0..n2, 0..n2).map(|(x, y)| vecs.iter().map(|a| a[x] * a[y]).sum()).collect();
        DenseEri::new(ao_loc, data).unwrap()
    }

    /// Symmetric in the AO pair, so that the supermatrix has the permutational symmetry of an ERI.
    fn pair_vector(nao: usize, seed: f64) -> Vec<f64> {
        iproduct!(0..nao, 0..nao).map(|(u, v)| ((u + v) as f64 * seed).sin() + (u * v) as f64 * seed * 0.1 + 0.05).collect()
    }

    fn run(eval: &DenseEri, tiling: &AoTiling, opts: &CDOptions, start: CDStart) -> CholeskyFactor {
        let pairs = ShellPairList::dense(tiling.layout().nbas());
        CholeskyBuilder::new(eval, tiling, &pairs, opts, &SerialGroup, start).unwrap().run().unwrap()
    }

    #[test]
    fn test_dominant_pivot_scenario() {
        let layout = ShellLayout::from_sizes(&[1, 3, 1, 3, 2]).unwrap();
        let nao = layout.nao();
        let mut a = vec![0.1; nao * nao];
        a[3 * nao + 3] = 5.0_f64.sqrt();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &[a]);
        let tiling = AoTiling::new(layout, 4).unwrap();
        let opts = CDOptions { diagtol: 1.0e-8, max_vectors: Some(10), ..Default::default() };

        let pairs = ShellPairList::dense(5);
        let builder = CholeskyBuilder::new(&eri, &tiling, &pairs, &opts, &SerialGroup, CDStart::FreshStart).unwrap();
        let pivot = builder.diag.select_pivot(&SerialGroup).unwrap();
        assert_eq!((pivot.bfu, pivot.bfv), (3, 3));
        assert!((pivot.value - 5.0).abs() < 1e-12);

        let factor = builder.run().unwrap();
        assert!(factor.count >= 1 && factor.count <= 10);
        let residual = factor.residual.tensor().gather(nao, &SerialGroup).unwrap();
        assert!(residual.iter().all(|&d| d <= 1.0e-8));
    }

    #[test]
    fn test_convergence_and_reconstruction() {
        let layout = ShellLayout::from_sizes(&[2, 1, 3, 1]).unwrap();
        let nao = layout.nao();
        let vecs: Vec<Vec<f64>> = [0.3, 0.7, 1.1, 1.9].iter().map(|&s| pair_vector(nao, s)).collect();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &vecs);
        let tiling = AoTiling::new(layout, 3).unwrap();
        let opts = CDOptions { diagtol: 1.0e-10, ..Default::default() };

        let factor = run(&eri, &tiling, &opts, CDStart::FreshStart);
        assert!(factor.count <= opts.max_vectors(nao));
        let residual = factor.residual.tensor().gather(nao, &SerialGroup).unwrap();
        assert!(residual.iter().all(|&d| d <= opts.diagtol));

        let l = factor.chol.gather(factor.count, &SerialGroup).unwrap();
        let nv = factor.count;
        for (uv, pq) in iproduct!(0..nao * nao, 0..nao * nao) {
            let approx: f64 = (0..nv).map(|k| l[uv * nv + k] * l[pq * nv + k]).sum();
            let exact: f64 = vecs.iter().map(|a| a[uv] * a[pq]).sum();
            assert!((approx - exact).abs() < 1.0e-8, "({uv}|{pq}): {approx} vs {exact}");
        }
    }

    #[test]
    fn test_access_strategies_agree() {
        let layout = ShellLayout::from_sizes(&[1, 3, 2, 1]).unwrap();
        let nao = layout.nao();
        let vecs: Vec<Vec<f64>> = [0.2, 0.5, 0.9].iter().map(|&s| pair_vector(nao, s)).collect();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &vecs);
        let tiling = AoTiling::new(layout, 2).unwrap();

        let opts = CDOptions { diagtol: 1.0e-9, access: AccessStrategy::BlockTransfer, ..Default::default() };
        let transfer = run(&eri, &tiling, &opts, CDStart::FreshStart);
        let opts = CDOptions { access: AccessStrategy::LocalBuffer, ..opts };
        let local = run(&eri, &tiling, &opts, CDStart::FreshStart);

        assert_eq!(transfer.count, local.count);
        let nv = transfer.count;
        assert_eq!(transfer.chol.gather(nv, &SerialGroup).unwrap(), local.chol.gather(nv, &SerialGroup).unwrap());
    }

    #[test]
    fn test_restart_matches_straight_run() {
        let layout = ShellLayout::from_sizes(&[2, 2, 1, 3]).unwrap();
        let nao = layout.nao();
        let vecs: Vec<Vec<f64>> = [0.15, 0.45, 0.8, 1.3, 1.7, 2.3].iter().map(|&s| pair_vector(nao, s)).collect();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &vecs);
        let tiling = AoTiling::new(layout, 3).unwrap();
        let scratch_dir = std::env::temp_dir().join(format!("cholesky_eri_restart_{}", std::process::id()));

        let full = 6;
        let opts = CDOptions { diagtol: 1.0e-12, max_vectors: Some(full), ..Default::default() };
        let straight = run(&eri, &tiling, &opts, CDStart::FreshStart);
        assert_eq!(straight.count, full);

        // first half, checkpointed at the end
        let opts_half = CDOptions {
            max_vectors: Some(full / 2),
            writet: true,
            checkpoint_min_nbf: 0,
            scratch_dir: scratch_dir.clone(),
            ..opts.clone()
        };
        let half = run(&eri, &tiling, &opts_half, CDStart::FreshStart);
        assert_eq!(half.count, full / 2);

        let opts_resume = CDOptions { readt: true, scratch_dir: scratch_dir.clone(), ..opts.clone() };
        let files = CheckpointFiles::new(&opts_resume);
        let start = CDStart::resolve(&files, &opts_resume, nao).unwrap();
        assert!(matches!(&start, CDStart::Resumed(state) if state.count == full / 2));
        let resumed = run(&eri, &tiling, &opts_resume, start);
        assert_eq!(resumed.count, full);

        let a = straight.chol.gather(full, &SerialGroup).unwrap();
        let b = resumed.chol.gather(full, &SerialGroup).unwrap();
        assert!(a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1.0e-12));
        std::fs::remove_dir_all(&scratch_dir).unwrap();
    }

    #[test]
    fn test_memory_guard_aborts_before_allocation() {
        let layout = ShellLayout::from_sizes(&[1, 1]).unwrap();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &[vec![1.0, 0.5, 0.5, 1.0]]);
        let device = DeviceTsr::default();
        let lcao: Tsr = rt::zeros(([2, 4], &device));
        let mut sys = SystemData::new(2, 1, 1).unwrap();
        let opts = CDOptions { max_vectors: Some(1 << 30), max_memory_gib: Some(1.0), ..Default::default() };

        let err = compute_cholesky_mo(&mut sys, &eri, &ShellPairList::dense(2), lcao, &opts, &SerialGroup, true).unwrap_err();
        assert!(err.to_string().contains("computing cholesky vectors"));
    }

    #[test]
    fn test_invalid_pivot_tolerance() {
        let layout = ShellLayout::from_sizes(&[1]).unwrap();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &[vec![1.0]]);
        let tiling = AoTiling::new(layout, 1).unwrap();
        let pairs = ShellPairList::dense(1);
        let opts = CDOptions { diagtol: -1.0, ..Default::default() };
        assert!(CholeskyBuilder::new(&eri, &tiling, &pairs, &opts, &SerialGroup, CDStart::FreshStart).is_err());
    }

    #[test]
    fn test_screened_pairs_excluded_from_factor() {
        let layout = ShellLayout::from_sizes(&[2, 1, 2]).unwrap();
        let nao = layout.nao();
        let vecs: Vec<Vec<f64>> = [0.25, 0.6, 1.05, 1.6].iter().map(|&s| pair_vector(nao, s)).collect();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &vecs);
        // shell 2 pairs only with itself
        let pairs = ShellPairList::from_lists(vec![vec![0], vec![0, 1], vec![2]]).unwrap();
        let significant: Vec<bool> = iproduct!(0..nao, 0..nao)
            .map(|(u, v)| is_significant(&pairs, layout.bf2shell(u), layout.bf2shell(v)))
            .collect();
        assert!(significant.iter().any(|&x| !x));
        let tiling = AoTiling::new(layout, 2).unwrap();
        let opts = CDOptions { diagtol: 1.0e-10, ..Default::default() };

        let factor = CholeskyBuilder::new(&eri, &tiling, &pairs, &opts, &SerialGroup, CDStart::FreshStart).unwrap().run().unwrap();
        let nv = factor.count;
        assert!(nv > 0 && nv <= significant.iter().filter(|&&x| x).count());
        let l = factor.chol.gather(nv, &SerialGroup).unwrap();
        let d = factor.residual.tensor().gather(nao, &SerialGroup).unwrap();

        for uv in (0..nao * nao).filter(|&uv| !significant[uv]) {
            assert_eq!(d[uv], 0.0);
            assert!(l[uv * nv..(uv + 1) * nv].iter().all(|&x| x == 0.0));
        }
        for (uv, pq) in iproduct!(0..nao * nao, 0..nao * nao).filter(|&(uv, pq)| significant[uv] && significant[pq]) {
            let approx: f64 = (0..nv).map(|k| l[uv * nv + k] * l[pq * nv + k]).sum();
            let exact: f64 = vecs.iter().map(|a| a[uv] * a[pq]).sum();
            assert!((approx - exact).abs() < 1.0e-8, "({uv}|{pq}): {approx} vs {exact}");
        }
    }

    #[test]
    fn test_periodic_checkpoint_and_resume() {
        let layout = ShellLayout::from_sizes(&[2, 2, 1, 3]).unwrap();
        let nao = layout.nao();
        let vecs: Vec<Vec<f64>> = [0.15, 0.45, 0.8, 1.3, 1.7, 2.3].iter().map(|&s| pair_vector(nao, s)).collect();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &vecs);
        let tiling = AoTiling::new(layout, 3).unwrap();
        let pairs = ShellPairList::dense(4);
        let scratch_dir = std::env::temp_dir().join(format!("cholesky_eri_periodic_{}", std::process::id()));

        let opts = CDOptions { diagtol: 1.0e-12, max_vectors: Some(6), ..Default::default() };
        let straight = run(&eri, &tiling, &opts, CDStart::FreshStart);
        assert_eq!(straight.count, 6);

        let opts_ckpt = CDOptions { writet: true, checkpoint_min_nbf: 0, write_vcount: 2, scratch_dir: scratch_dir.clone(), ..opts };
        let files = CheckpointFiles::new(&opts_ckpt);
        let mut builder = CholeskyBuilder::new(&eri, &tiling, &pairs, &opts_ckpt, &SerialGroup, CDStart::FreshStart).unwrap();
        for _ in 0..3 {
            assert!(builder.step().unwrap().is_some());
        }
        assert_eq!(builder.count(), 3);
        drop(builder);

        // only the write at two vectors happened
        let state = files.read(nao).unwrap();
        assert_eq!(state.count, 2);

        let resumed = CholeskyBuilder::new(&eri, &tiling, &pairs, &opts_ckpt, &SerialGroup, CDStart::Resumed(state)).unwrap().run().unwrap();
        assert_eq!(resumed.count, 6);
        assert_eq!(files.read(nao).unwrap().count, 6);

        let a = straight.chol.gather(6, &SerialGroup).unwrap();
        let b = resumed.chol.gather(6, &SerialGroup).unwrap();
        assert!(a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1.0e-12));
        std::fs::remove_dir_all(&scratch_dir).unwrap();
    }

    #[test]
    fn test_ranks_agree_with_serial() {
        let layout = ShellLayout::from_sizes(&[1, 3, 2, 1, 2]).unwrap();
        let nao = layout.nao();
        let vecs: Vec<Vec<f64>> = [0.2, 0.55, 0.95, 1.4].iter().map(|&s| pair_vector(nao, s)).collect();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &vecs);
        let tiling = AoTiling::new(layout, 2).unwrap();
        let pairs = ShellPairList::dense(5);

        for access in [AccessStrategy::BlockTransfer, AccessStrategy::LocalBuffer] {
            let opts = CDOptions { diagtol: 1.0e-9, access, ..Default::default() };
            let serial = run(&eri, &tiling, &opts, CDStart::FreshStart);
            let expected = serial.chol.gather(serial.count, &SerialGroup).unwrap();

            let results = crate::store::threaded::run_ranks(3, |g| {
                let factor = CholeskyBuilder::new(&eri, &tiling, &pairs, &opts, g, CDStart::FreshStart).unwrap().run().unwrap();
                (factor.count, factor.chol.gather(factor.count, g).unwrap())
            });
            for (count, chol) in results {
                assert_eq!(count, serial.count);
                assert_eq!(chol, expected);
            }
        }
    }

    #[test]
    fn test_coefficient_shape_checked_before_decomposition() {
        let layout = ShellLayout::from_sizes(&[1, 1]).unwrap();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &[vec![1.0, 0.5, 0.5, 1.0]]);
        let device = DeviceTsr::default();
        let lcao: Tsr = rt::zeros(([2, 3], &device));
        let mut sys = SystemData::new(2, 1, 1).unwrap();
        // would also fail the memory check
        let opts = CDOptions { max_vectors: Some(1 << 30), max_memory_gib: Some(1.0), ..Default::default() };

        let err = compute_cholesky_mo(&mut sys, &eri, &ShellPairList::dense(2), lcao, &opts, &SerialGroup, true).unwrap_err();
        assert!(err.to_string().contains("coefficient matrix"));
        assert_eq!(sys, SystemData::new(2, 1, 1).unwrap());
    }

    #[test]
    fn test_restart_copy_counts_against_memory() {
        let layout = ShellLayout::from_sizes(&[1, 1]).unwrap();
        let eri = low_rank_eri(layout.ao_loc().to_vec(), &[vec![1.0, 0.5, 0.5, 1.0]]);
        let pairs = ShellPairList::dense(2);
        let device = DeviceTsr::default();
        let scratch_dir = std::env::temp_dir().join(format!("cholesky_eri_restart_memory_{}", std::process::id()));
        let call = |opts: &CDOptions| {
            let mut sys = SystemData::new(2, 1, 1).unwrap();
            let lcao: Tsr = rt::zeros(([2, 4], &device));
            compute_cholesky_mo(&mut sys, &eri, &pairs, lcao, opts, &SerialGroup, true)
        };

        let opts = CDOptions { max_vectors: Some(2), writet: true, checkpoint_min_nbf: 0, scratch_dir: scratch_dir.clone(), ..Default::default() };
        assert_eq!(call(&opts).unwrap().count, 1);

        // D + R + L take 16 values; the checkpoint copy adds 8 more
        let ceiling = Some(crate::memory::gib_of(22));
        let fresh = call(&CDOptions { writet: false, max_memory_gib: ceiling, ..opts.clone() }).unwrap_err();
        assert!(fresh.to_string().contains("the 2-step contraction"));
        let resumed = call(&CDOptions { max_memory_gib: ceiling, ..opts.clone() }).unwrap_err();
        assert!(resumed.to_string().contains("computing cholesky vectors"));
        std::fs::remove_dir_all(&scratch_dir).unwrap();
    }
}
