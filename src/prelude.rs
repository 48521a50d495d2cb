#![allow(unused)]

/* #region for API callers */

pub use crate::ao2mo::{reshape_mo_matrix, transform_cholesky, update_sysdata};
pub use crate::checkpoint::{CDStart, CheckpointFiles, CheckpointState};
pub use crate::cholesky::{CholeskyBuilder, CholeskyFactor, compute_cholesky_mo};
pub use crate::diagonal::{DiagonalTracker, Pivot};
pub use crate::integrals::{DenseEri, IntegralEvaluator, eri_quartet_batch};
pub use crate::memory::MemoryLedger;
pub use crate::screening::{ShellPairList, is_significant};
pub use crate::store::{BlockTensor, ProcGroup, SerialGroup};
#[cfg(feature = "mpi")]
pub use crate::store::MpiGroup;
pub use crate::structs::{AccessStrategy, CDOptions, CDOptionsBuilder, CDResults, CholVpr, SpinPosition, SystemData};
pub use crate::tiling::{AoTiling, MoTiling, ShellLayout, Spin};

/* #endregion */

/* #region for developers */

// RSTSR backend specification
#[cfg(not(feature = "use_openblas"))]
pub type DeviceTsr = DeviceFaer;
#[cfg(feature = "use_openblas")]
pub type DeviceTsr = DeviceOpenBLAS;

pub(crate) use libcint::prelude::*;
pub(crate) use rayon::prelude::*;
pub(crate) use rstsr::prelude::*;

pub(crate) use anyhow::{Context, Result, bail, ensure};

pub(crate) use crate::*;

pub type Tsr<D = IxD> = Tensor<f64, DeviceTsr, D>;
pub type TsrView<'a, D = IxD> = TensorView<'a, f64, DeviceTsr, D>;
pub type TsrMut<'a, D = IxD> = TensorMut<'a, f64, DeviceTsr, D>;

/* #endregion */
