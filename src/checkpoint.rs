//! On-disk checkpoints of the decomposition: residual diagonal, factor columns, vector count.
//!
//! The count file is written last, so its presence implies that the other two files are complete.

use crate::prelude::*;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    dir: PathBuf,
    diag: PathBuf,
    chol: PathBuf,
    count: PathBuf,
}

/// Decomposition state read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointState {
    /// Row-major `(nao, nao)` residual diagonal.
    pub diag: Vec<f64>,
    /// Row-major `(nao, nao, count)` factor.
    pub chol: Vec<f64>,
    pub count: usize,
}

/// How the decomposition starts: from the integral diagonal or from a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum CDStart {
    FreshStart,
    Resumed(CheckpointState),
}

impl CheckpointFiles {
    /// `{scratch_dir}/{stem}_files/{scf_type}/{stem}.{diag_ao,chol_ao,cholcount}`,
    /// where `stem = {output_file_prefix}.{basis}`.
    pub fn new(opts: &CDOptions) -> Self {
        let stem = format!("{}.{}", opts.output_file_prefix, opts.basis);
        let dir = opts.scratch_dir.join(format!("{stem}_files")).join(&opts.scf_type);
        Self {
            diag: dir.join(format!("{stem}.diag_ao")),
            chol: dir.join(format!("{stem}.chol_ao")),
            count: dir.join(format!("{stem}.cholcount")),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn count_file(&self) -> &Path {
        &self.count
    }

    pub fn exists_all(&self) -> bool {
        [&self.diag, &self.chol, &self.count].iter().all(|p| p.exists())
    }

    /// Persist `diag`, the first `count` columns of `chol`, then `count`. Collective.
    ///
    /// Fails on every rank when rank 0 cannot write.
    pub fn write(&self, diag: &BlockTensor, chol: &BlockTensor, count: usize, group: &dyn ProcGroup) -> Result<()> {
        let nao = diag.shape()[0];
        let diag_dense = diag.gather(nao, group)?;
        let chol_dense = chol.gather(count, group)?;

        let mut status = [0.0];
        let mut written = Ok(());
        if group.rank() == 0 {
            let time = std::time::Instant::now();
            written = self.write_files(&diag_dense, &chol_dense, nao, count);
            match &written {
                Ok(()) => log::info!("Wrote {count} cholesky vectors to disk in {:.2?}", time.elapsed()),
                Err(_) => status[0] = 1.0,
            }
        }
        group.broadcast(&mut status, 0);
        written?;
        ensure!(status[0] == 0.0, "Error writing the checkpoint in {}: failed on rank 0", self.dir.display());
        Ok(())
    }

    fn write_files(&self, diag: &[f64], chol: &[f64], nao: usize, count: usize) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("Error creating {}", self.dir.display()))?;
        // an older count must not vouch for half-written blobs
        match std::fs::remove_file(&self.count) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(e).with_context(|| format!("Error removing {}", self.count.display()));
            },
            _ => (),
        }
        util::write_npy(&self.diag, diag, &[nao, nao])?;
        util::write_npy(&self.chol, chol, &[nao, nao, count])?;

        let tmp = self.count.with_extension("cholcount.tmp");
        std::fs::write(&tmp, format!("{count}\n")).with_context(|| format!("Error writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.count).with_context(|| format!("Error writing {}", self.count.display()))?;
        Ok(())
    }

    /// Read a complete checkpoint for a basis of `nao` functions.
    pub fn read(&self, nao: usize) -> Result<CheckpointState> {
        let count = std::fs::read_to_string(&self.count)
            .with_context(|| format!("Error reading {}", self.count.display()))?
            .trim()
            .parse::<usize>()
            .with_context(|| format!("Error reading {}: not a vector count", self.count.display()))?;

        let (diag, shape) = util::read_npy(&self.diag)?;
        ensure!(shape == [nao, nao], "Error reading {}: shape {shape:?}, expected [{nao}, {nao}]", self.diag.display());
        let (chol, shape) = util::read_npy(&self.chol)?;
        ensure!(
            shape == [nao, nao, count],
            "Error reading {}: shape {shape:?}, expected [{nao}, {nao}, {count}]",
            self.chol.display()
        );

        Ok(CheckpointState { diag, chol, count })
    }
}

impl CDStart {
    /// Resume when `readt` or `writet` is set and all checkpoint files exist; start fresh otherwise.
    pub fn resolve(files: &CheckpointFiles, opts: &CDOptions, nao: usize) -> Result<Self> {
        if (opts.readt || opts.writet) && files.exists_all() {
            let state = files.read(nao)?;
            log::info!("Restarting from {} cholesky vectors in {}", state.count, files.dir().display());
            return Ok(CDStart::Resumed(state));
        }
        Ok(CDStart::FreshStart)
    }
}
