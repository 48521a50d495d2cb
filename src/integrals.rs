//! Four-center integral evaluation.

use crate::prelude::*;

/// Source of four-center electron-repulsion integrals `(s0 s1 | s2 s3)`.
pub trait IntegralEvaluator: Sync {
    /// First basis function of each shell; the last entry is the number of functions.
    fn shell_offsets(&self) -> Vec<usize>;

    /// Row-major `(n0, n1, n2, n3)` block of the shell quartet, `None` if the whole block vanishes.
    fn eri_quartet(&self, shls: [usize; 4]) -> Option<Vec<f64>>;
}

/// Evaluate many shell quartets, in parallel over quartets.
pub fn eri_quartet_batch<E: IntegralEvaluator + ?Sized>(eval: &E, quartets: &[[usize; 4]]) -> Vec<Option<Vec<f64>>> {
    quartets.par_iter().map(|&shls| eval.eri_quartet(shls)).collect()
}

impl IntegralEvaluator for CInt {
    fn shell_offsets(&self) -> Vec<usize> {
        self.ao_loc()
    }

    fn eri_quartet(&self, shls: [usize; 4]) -> Option<Vec<f64>> {
        let shls_slice = shls.map(|s| [s, s + 1]);
        let (out, _) = self.integrate_row_major("int2e", None, &shls_slice).into();
        Some(out)
    }
}

/// Integrals held in memory as a dense row-major `(nao, nao, nao, nao)` buffer.
#[derive(Debug, Clone)]
pub struct DenseEri {
    ao_loc: Vec<usize>,
    data: Vec<f64>,
}

impl DenseEri {
    pub fn new(ao_loc: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let nao = ao_loc.last().copied().unwrap_or(0);
        ensure!(data.len() == nao.pow(4), "dense ERI buffer holds {} values, expected {nao}^4", data.len());
        Ok(Self { ao_loc, data })
    }

    pub fn from_tensor(ao_loc: Vec<usize>, eri: &Tsr) -> Result<Self> {
        let nao = ao_loc.last().copied().unwrap_or(0);
        ensure!(eri.shape() == &[nao, nao, nao, nao], "ERI tensor shape {:?} does not match nao = {nao}", eri.shape());
        Self::new(ao_loc, eri.reshape(-1).to_vec())
    }

    pub fn nao(&self) -> usize {
        self.ao_loc.last().copied().unwrap_or(0)
    }
}

impl IntegralEvaluator for DenseEri {
    fn shell_offsets(&self) -> Vec<usize> {
        self.ao_loc.clone()
    }

    fn eri_quartet(&self, shls: [usize; 4]) -> Option<Vec<f64>> {
        let nao = self.nao();
        let [r0, r1, r2, r3] = shls.map(|s| self.ao_loc[s]..self.ao_loc[s + 1]);
        let mut out = Vec::with_capacity(r0.len() * r1.len() * r2.len() * r3.len());
        for (i, j, k) in itertools::iproduct!(r0, r1, r2) {
            let base = ((i * nao + j) * nao + k) * nao;
            out.extend_from_slice(&self.data[base + r3.start..base + r3.end]);
        }
        out.iter().any(|&x| x != 0.0).then_some(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn toy_eri(nao: usize) -> Vec<f64> {
        (0..nao.pow(4)).map(|x| x as f64).collect()
    }

    #[test]
    fn test_dense_quartet_block() {
        let ao_loc = vec![0, 1, 3];
        let eri = DenseEri::new(ao_loc, toy_eri(3)).unwrap();
        // (1 1 | 0 1): functions i, j in 1..3, k = 0, l in 1..3
        let block = eri.eri_quartet([1, 1, 0, 1]).unwrap();
        assert_eq!(block.len(), 8);
        let flat = |i: usize, j: usize, k: usize, l: usize| (((i * 3 + j) * 3 + k) * 3 + l) as f64;
        assert_eq!(block[0], flat(1, 1, 0, 1));
        assert_eq!(block[1], flat(1, 1, 0, 2));
        assert_eq!(block[2], flat(1, 2, 0, 1));
        assert_eq!(block[7], flat(2, 2, 0, 2));
        // (0 0 | 0 0) is the single value 0
        assert!(eri.eri_quartet([0, 0, 0, 0]).is_none());
        assert!(DenseEri::new(vec![0, 2], vec![0.0; 15]).is_err());
    }

    #[test]
    fn test_batch_matches_serial() {
        let eri = DenseEri::new(vec![0, 1, 3], toy_eri(3)).unwrap();
        let quartets: Vec<[usize; 4]> = itertools::iproduct!(0..2, 0..2, 0..2, 0..2).map(|(a, b, c, d)| [a, b, c, d]).collect();
        let batch = eri_quartet_batch(&eri, &quartets);
        for (shls, out) in quartets.iter().zip(batch) {
            assert_eq!(out, eri.eri_quartet(*shls));
        }
    }
}
