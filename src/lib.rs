//! Pivoted incremental Cholesky decomposition of the electron-repulsion integrals, and the
//! transformation of the resulting vectors to the molecular-orbital basis.
//!
//! The entry point is [`cholesky::compute_cholesky_mo`]; [`cholesky::CholeskyBuilder`] runs the
//! AO-basis decomposition on its own.

#![allow(clippy::deref_addrof)]

pub mod prelude;

pub mod ao2mo;
pub mod checkpoint;
pub mod cholesky;
pub mod diagonal;
pub mod integrals;
pub mod memory;
pub mod screening;
pub mod store;
pub mod structs;
pub mod tiling;
pub mod util;

#[cfg(test)]
fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

#[test]
fn playground_cholesky_ao() {
    use crate::prelude::*;

    let cint_data = init_h2o_def2_tzvp();
    let nao = cint_data.nao();
    let int2e = util::intor_row_major(&cint_data, "int2e");
    let ovlp = util::intor_row_major(&cint_data, "int1e_ovlp");

    let layout = ShellLayout::new(cint_data.shell_offsets()).unwrap();
    let pairs = ShellPairList::from_overlap(&ovlp, &layout, 1.0e-12).unwrap();
    let tiling = AoTiling::new(layout, 30).unwrap();
    let opts = CDOptionsBuilder::default().diagtol(1.0e-8).build().unwrap();

    let time = std::time::Instant::now();
    let builder = CholeskyBuilder::new(&cint_data, &tiling, &pairs, &opts, &SerialGroup, CDStart::FreshStart).unwrap();
    let factor = builder.run().unwrap();
    println!("Cholesky vectors: {} ({:.2?})", factor.count, time.elapsed());

    let l = factor.to_tensor(&SerialGroup).unwrap().into_shape((nao * nao, factor.count));
    let approx = (l.view() % l.t()).reshape(-1).to_vec();
    let exact = int2e.reshape(-1).to_vec();
    let err = max_abs_diff(&approx, &exact);
    println!("Max reconstruction error: {err:.3e}");
    assert!(err < 1.0e-6);
}

#[test]
fn playground_cholesky_mo() {
    use crate::prelude::*;

    let cint_data = init_h2o_def2_tzvp();
    let nao = cint_data.nao();
    let nocc = (cint_data.atom_charges().into_iter().sum::<f64>() / 2.0) as usize;
    let hcore = util::intor_row_major(&cint_data, "int1e_kin") + util::intor_row_major(&cint_data, "int1e_nuc");
    let ovlp = util::intor_row_major(&cint_data, "int1e_ovlp");
    let int2e = util::intor_row_major(&cint_data, "int2e");

    // core-Hamiltonian guess orbitals
    let (_, mo_coeff): (Tsr, Tsr) = rt::linalg::eigh((hcore.view(), ovlp.view())).into();

    let eri = DenseEri::from_tensor(cint_data.shell_offsets(), &int2e).unwrap();
    let layout = ShellLayout::new(eri.shell_offsets()).unwrap();
    let pairs = ShellPairList::from_overlap(&ovlp, &layout, 1.0e-12).unwrap();
    let mut sys = SystemData::new(nao, nocc, nocc).unwrap();
    let opts = CDOptionsBuilder::default().diagtol(1.0e-10).build().unwrap();

    let results = compute_cholesky_mo(&mut sys, &eri, &pairs, mo_coeff.clone(), &opts, &SerialGroup, false).unwrap();
    let (nmo, count) = (sys.nmo, results.count);
    assert_eq!(results.chol_mo.tensor.shape(), &[nmo, nmo, count]);

    // (pp|qq) from the vectors against the dense AO integrals
    let v = results.chol_mo.tensor.reshape(-1).to_vec();
    let eri_mat = int2e.reshape((nao * nao, nao * nao));
    for (p, q) in [(0, 0), (0, nocc), (nocc - 1, nocc + 1), (nocc, nocc)] {
        let dm_p = mo_coeff.i((.., p..p + 1)) % mo_coeff.i((.., p..p + 1)).t();
        let dm_q = mo_coeff.i((.., q..q + 1)) % mo_coeff.i((.., q..q + 1)).t();
        let exact = (dm_p.reshape(-1) % (eri_mat.view() % dm_q.reshape(-1))).to_scalar();
        let approx: f64 = (0..count).map(|k| v[(p * nmo + p) * count + k] * v[(q * nmo + q) * count + k]).sum();
        println!("({p}{p}|{q}{q}): {approx:.10} vs {exact:.10}");
        assert!((approx - exact).abs() < 1.0e-5);
    }
}
