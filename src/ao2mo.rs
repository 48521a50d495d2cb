//! AO-to-MO transformation of the Cholesky vectors, including frozen-orbital bookkeeping.

use crate::prelude::*;
use std::ops::Range;
use std::time::Instant;

/// Remove frozen orbitals from `sys` and build the MO index space.
///
/// Frozen counts are subtracted from the alpha spaces, and from the beta spaces too when `is_mso`.
pub fn update_sysdata(sys: &mut SystemData, opts: &CDOptions, is_mso: bool) -> Result<MoTiling> {
    if sys.do_freeze() {
        ensure!(sys.nbf == sys.nbf_orig, "frozen orbitals were already removed from the system data");
        let (fc, fv) = (sys.n_frozen_core, sys.n_frozen_virtual);
        sys.nbf -= fc + fv;
        sys.n_occ_alpha -= fc;
        sys.n_vir_alpha -= fv;
        if is_mso {
            sys.n_occ_beta -= fc;
            sys.n_vir_beta -= fv;
        }
        log::info!("Freezing {fc} core and {fv} virtual orbitals, {} active basis functions", sys.nbf);
    }
    sys.update(is_mso)?;

    match is_mso {
        true => MoTiling::spin_orbital(sys, opts, 0),
        false => Ok(MoTiling::reduced(sys, opts)),
    }
}

/// Columns of the coefficient matrix while `sys` still holds the frozen orbitals.
pub(crate) fn full_mo_count(sys: &SystemData, is_mso: bool) -> usize {
    match is_mso {
        true => sys.n_occ_alpha + sys.n_vir_alpha + sys.n_occ_beta + sys.n_vir_beta,
        false => sys.n_occ_alpha + sys.n_vir_alpha,
    }
}

/// `(source start, target start, length)` of the active blocks of the full MO index.
fn active_segments(sys: &SystemData) -> (Vec<(usize, usize, usize)>, usize) {
    let (fc, fv) = (sys.n_frozen_core, sys.n_frozen_virtual);
    let (noa, nob, nva, nvb) = (sys.n_occ_alpha, sys.n_occ_beta, sys.n_vir_alpha, sys.n_vir_beta);
    let nocc = noa + nob;

    if sys.nmo == noa + nva {
        let segments = vec![(fc, 0, noa), (fc + noa, noa, nva)];
        return (segments, fc + noa + nva + fv);
    }

    let block2_off = 2 * fc + noa;
    let block3_off = 2 * fc + nocc;
    let last_block_off = block3_off + fv + nva;
    let segments = vec![(fc, 0, noa), (block2_off, noa, nob), (block3_off, nocc, nva), (last_block_off, nocc + nva, nvb)];
    (segments, last_block_off + nvb + fv)
}

/// Drop the frozen orbitals of an MO-indexed matrix and make the active blocks contiguous.
///
/// With `is_lcao` the matrix is the `(nbf_orig, nmo_full)` coefficient matrix and only columns are
/// rearranged; otherwise it is `(nmo_full, nmo_full)` and rows and columns are rearranged alike.
/// `sys` must already have the frozen orbitals removed (see [`update_sysdata`]).
pub fn reshape_mo_matrix(sys: &SystemData, emat: &Tsr, is_lcao: bool) -> Result<Tsr> {
    let device = DeviceTsr::default();
    let (segments, nfull) = active_segments(sys);
    let nmo = sys.nmo;

    match is_lcao {
        true => {
            ensure!(
                emat.shape() == &[sys.nbf_orig, nfull],
                "coefficient matrix shape {:?}, expected [{}, {nfull}]",
                emat.shape(),
                sys.nbf_orig
            );
            let mut out: Tsr = rt::zeros(([sys.nbf_orig, nmo], &device));
            for &(src, dst, len) in &segments {
                out.i_mut((.., slice!(dst, dst + len))).assign(&emat.i((.., slice!(src, src + len))));
            }
            Ok(out)
        },
        false => {
            ensure!(emat.shape() == &[nfull, nfull], "MO matrix shape {:?}, expected [{nfull}, {nfull}]", emat.shape());
            let mut out: Tsr = rt::zeros(([nmo, nmo], &device));
            for (&(sr, dr, lr), &(sc, dc, lc)) in itertools::iproduct!(&segments, &segments) {
                out.i_mut((slice!(dr, dr + lr), slice!(dc, dc + lc)))
                    .assign(&emat.i((slice!(sr, sr + lr), slice!(sc, sc + lc))));
            }
            Ok(out)
        },
    }
}

/// Maximal runs of MO indices with the same spin label.
fn spin_runs(mo: &MoTiling) -> Vec<(Range<usize>, Spin)> {
    let mut runs: Vec<(Range<usize>, Spin)> = vec![];
    for p in 0..mo.nmo() {
        let Some(spin) = mo.spin(p) else { continue };
        match runs.last_mut() {
            Some((range, s)) if *s == spin && range.end == p => range.end = p + 1,
            _ => runs.push((p..p + 1, spin)),
        }
    }
    runs
}

/// Two-stage contraction of the `(nao, nao, count)` AO factor with `lcao` (`(nao, nmo)`).
///
/// `Temp[p, mu, c] = sum_nu C[nu, p] L[nu, mu, c]`, then `V[p, r, c] = sum_mu C[mu, r] Temp[p, mu, c]`.
/// Each intermediate is dropped as soon as it is consumed. For spin-labelled MO spaces, `V[p, r, :]`
/// vanishes when `p` and `r` have different spin.
pub fn transform_cholesky(l_ao: Tsr, lcao: &Tsr, mo: MoTiling, ledger: &mut MemoryLedger) -> Result<CholVpr> {
    let device = DeviceTsr::default();
    ensure!(l_ao.ndim() == 3, "AO factor must have three modes");
    let (nao, count) = (l_ao.shape()[0], l_ao.shape()[2]);
    let nmo = mo.nmo();
    ensure!(lcao.shape() == &[nao, nmo], "coefficient matrix shape {:?}, expected [{nao}, {nmo}]", lcao.shape());

    ledger.add(nmo * nao * count);
    ledger.check("ao2mo transformation")?;
    let time = Instant::now();

    let tmp = (lcao.t() % l_ao.reshape((nao, nao * count))).into_shape((nmo, nao, count));
    drop(l_ao);

    ledger.remove(nao * nao * count).add(nmo * nmo * count);
    ledger.check("the 2-step contraction")?;

    let runs = spin_runs(&mo);
    let chol_mo: Tsr = rt::zeros(([nmo, nmo, count], &device));
    (0..nmo).into_par_iter().for_each(|p| {
        let mut chol_mo = unsafe { chol_mo.force_mut() };
        chol_mo.i_mut(p).matmul_from(&lcao.t(), &tmp.i(p), 1.0, 0.0);
        if let Some(spin) = mo.spin(p) {
            for (range, _) in runs.iter().filter(|(_, s)| *s != spin) {
                chol_mo.i_mut((p, slice!(range.start, range.end))).fill(0.0);
            }
        }
    });
    drop(tmp);
    ledger.remove(nmo * nao * count);

    log::info!("Time for ao to mo transform: {:.2?}", time.elapsed());
    Ok(CholVpr { tensor: chol_mo, spin: [SpinPosition::Upper, SpinPosition::Lower, SpinPosition::Ignore], mo })
}
