use crate::prelude::*;
use std::path::PathBuf;

/* #region system data */

/// Orbital-space bookkeeping of the SCF reference.
///
/// Counts refer to spatial orbitals per spin. `nmo` is the number of columns
/// of the AO-to-MO coefficient matrix: `n_occ_alpha + n_vir_alpha + n_occ_beta + n_vir_beta` for
/// spin-orbital treatments, `n_occ_alpha + n_vir_alpha` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemData {
    pub n_occ_alpha: usize,
    pub n_vir_alpha: usize,
    pub n_occ_beta: usize,
    pub n_vir_beta: usize,
    pub nbf: usize,
    pub nbf_orig: usize,
    pub n_frozen_core: usize,
    pub n_frozen_virtual: usize,
    pub nmo: usize,
    pub nocc: usize,
    pub nvir: usize,
}

impl SystemData {
    /// Spin-orbital system data from the basis size and the occupied counts of each spin.
    pub fn new(nbf: usize, n_occ_alpha: usize, n_occ_beta: usize) -> Result<Self> {
        ensure!(n_occ_alpha <= nbf && n_occ_beta <= nbf, "occupied orbitals ({n_occ_alpha}, {n_occ_beta}) exceed nbf ({nbf})");
        let mut sys = Self {
            n_occ_alpha,
            n_vir_alpha: nbf - n_occ_alpha,
            n_occ_beta,
            n_vir_beta: nbf - n_occ_beta,
            nbf,
            nbf_orig: nbf,
            n_frozen_core: 0,
            n_frozen_virtual: 0,
            nmo: 0,
            nocc: 0,
            nvir: 0,
        };
        sys.update(true)?;
        Ok(sys)
    }

    /// Request frozen core and frozen virtual orbitals (per spin).
    pub fn with_frozen(mut self, n_frozen_core: usize, n_frozen_virtual: usize) -> Result<Self> {
        ensure!(
            n_frozen_core <= self.n_occ_alpha.min(self.n_occ_beta),
            "cannot freeze {n_frozen_core} core orbitals with {} alpha / {} beta occupied",
            self.n_occ_alpha,
            self.n_occ_beta
        );
        ensure!(
            n_frozen_virtual <= self.n_vir_alpha.min(self.n_vir_beta),
            "cannot freeze {n_frozen_virtual} virtual orbitals with {} alpha / {} beta virtual",
            self.n_vir_alpha,
            self.n_vir_beta
        );
        self.n_frozen_core = n_frozen_core;
        self.n_frozen_virtual = n_frozen_virtual;
        Ok(self)
    }

    pub fn do_freeze(&self) -> bool {
        self.n_frozen_core > 0 || self.n_frozen_virtual > 0
    }

    /// Recompute the derived counts after any of the per-spin counts changed.
    pub fn update(&mut self, spin_orbital: bool) -> Result<()> {
        ensure!(
            self.nbf == self.n_occ_alpha + self.n_vir_alpha,
            "inconsistent system data: nbf = {} but n_occ_alpha + n_vir_alpha = {}",
            self.nbf,
            self.n_occ_alpha + self.n_vir_alpha
        );
        self.nocc = self.n_occ_alpha + self.n_occ_beta;
        self.nvir = self.n_vir_alpha + self.n_vir_beta;
        self.nmo = match spin_orbital {
            true => self.n_occ_alpha + self.n_vir_alpha + self.n_occ_beta + self.n_vir_beta,
            false => self.n_occ_alpha + self.n_vir_alpha,
        };
        Ok(())
    }
}

/* #endregion */

/* #region options */

/// How the update kernel reaches the data of the distributed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStrategy {
    /// Copy each owned block out with `get`, update the copy, write it back with `put`.
    BlockTransfer,
    /// Update owned blocks in place through the local buffers.
    LocalBuffer,
}

/// Options of the Cholesky decomposition and the AO-to-MO transformation.
///
/// Missing builder fields fall back to [`CDOptions::default`].
#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(default)]
pub struct CDOptions {
    /// Convergence threshold on the largest residual diagonal element. Default is 1e-5.
    pub diagtol: f64,

    /// Capacity of the factor tensor, in multiples of the number of basis functions. Default is 12.
    pub max_cvecs_factor: usize,

    /// Explicit capacity of the factor tensor; overrides `max_cvecs_factor` when set.
    pub max_vectors: Option<usize>,

    /// Target number of basis functions per AO tile. Default is 30.
    pub ao_tilesize: usize,

    /// Target number of orbitals per MO tile. Default is 40.
    pub mo_tilesize: usize,

    /// Keep `mo_tilesize` even if it is outside the recommended range.
    pub force_tilesize: bool,

    /// Distribute orbitals evenly over MO tiles instead of fixed-size tiles. Default is true.
    pub balance_tiles: bool,

    /// Read a checkpoint when one exists.
    pub readt: bool,

    /// Write checkpoints (and also restart from one when it exists).
    pub writet: bool,

    /// Write a checkpoint every `write_vcount` vectors. Default is 5000.
    pub write_vcount: usize,

    /// Checkpoints are only written for bases larger than this. Default is 1000.
    pub checkpoint_min_nbf: usize,

    /// Memory ceiling in GiB; the available host memory is used when unset.
    pub max_memory_gib: Option<f64>,

    /// Shell pairs whose largest overlap magnitude is below this are screened out. Default is 1e-12.
    pub screening_threshold: f64,

    /// Access pattern for the row update. Default is `AccessStrategy::BlockTransfer`.
    pub access: AccessStrategy,

    /// Directory that holds the checkpoint directory tree. Default is `.`.
    #[builder(setter(into))]
    pub scratch_dir: PathBuf,

    #[builder(setter(into))]
    pub output_file_prefix: String,

    #[builder(setter(into))]
    pub basis: String,

    /// One of `restricted`, `unrestricted`, `restricted_os`.
    #[builder(setter(into))]
    pub scf_type: String,
}

impl Default for CDOptions {
    fn default() -> Self {
        Self {
            diagtol: 1.0e-5,
            max_cvecs_factor: 12,
            max_vectors: None,
            ao_tilesize: 30,
            mo_tilesize: 40,
            force_tilesize: false,
            balance_tiles: true,
            readt: false,
            writet: false,
            write_vcount: 5000,
            checkpoint_min_nbf: 1000,
            max_memory_gib: None,
            screening_threshold: 1.0e-12,
            access: AccessStrategy::BlockTransfer,
            scratch_dir: PathBuf::from("."),
            output_file_prefix: "output".to_string(),
            basis: "sto-3g".to_string(),
            scf_type: "restricted".to_string(),
        }
    }
}

impl CDOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.diagtol > 0.0 && self.diagtol.is_finite(), "diagtol must be positive, got {}", self.diagtol);
        ensure!(self.ao_tilesize > 0, "ao_tilesize must be positive");
        ensure!(self.mo_tilesize > 0, "mo_tilesize must be positive");
        ensure!(self.write_vcount > 0, "write_vcount must be positive");
        ensure!(
            matches!(self.scf_type.as_str(), "restricted" | "unrestricted" | "restricted_os"),
            "unrecognized scf_type [{}]",
            self.scf_type
        );
        Ok(())
    }

    /// Capacity of the factor tensor for a basis of `nbf` functions.
    pub fn max_vectors(&self, nbf: usize) -> usize {
        self.max_vectors.unwrap_or(self.max_cvecs_factor * nbf)
    }
}

/* #endregion */

/* #region results */

/// Spin role of a tensor mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinPosition {
    Upper,
    Lower,
    Ignore,
}

/// Cholesky vectors in the MO basis, `(nmo, nmo, count)`.
#[derive(Debug)]
pub struct CholVpr {
    pub tensor: Tsr,
    pub spin: [SpinPosition; 3],
    pub mo: MoTiling,
}

#[derive(Debug)]
pub struct CDResults {
    pub chol_mo: CholVpr,
    pub count: usize,
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_system_data_spin_orbital() {
        let sys = SystemData::new(10, 3, 2).unwrap();
        assert_eq!(sys.nocc, 5);
        assert_eq!(sys.nvir, 15);
        assert_eq!(sys.nmo, 20);
        assert!(!sys.do_freeze());
        assert!(SystemData::new(10, 3, 2).unwrap().with_frozen(4, 0).is_err());
    }

    #[test]
    fn test_options_builder() {
        let opts = CDOptionsBuilder::default().diagtol(1.0e-8).max_vectors(Some(10)).basis("cc-pvdz").build().unwrap();
        assert_eq!(opts.diagtol, 1.0e-8);
        assert_eq!(opts.max_vectors(4), 10);
        assert_eq!(opts.ao_tilesize, 30);
        assert_eq!(opts.basis, "cc-pvdz");
        assert!(opts.validate().is_ok());

        let opts = CDOptionsBuilder::default().diagtol(0.0).build().unwrap();
        assert!(opts.validate().is_err());
        let opts = CDOptionsBuilder::default().scf_type("rohf").build().unwrap();
        assert!(opts.validate().is_err());
        assert_eq!(CDOptions::default().max_vectors(7), 84);
    }
}
