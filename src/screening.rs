//! Shell-pair screening.
//!
//! A shell pair that is not listed here is assumed to give vanishing integrals; an
//! incorrectly dropped pair silently degrades the factorization, there is no runtime check.

use crate::prelude::*;

/// For each shell `s1`, the sorted shells `s2 <= s1` forming a significant pair with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellPairList {
    pairs: Vec<Vec<usize>>,
}

impl ShellPairList {
    /// Every shell pair is significant.
    pub fn dense(nbas: usize) -> Self {
        Self { pairs: (0..nbas).map(|s1| (0..=s1).collect()).collect() }
    }

    /// Keep pairs whose overlap block has an element of magnitude at least `threshold`.
    ///
    /// `ovlp` is the `(nao, nao)` AO overlap matrix. Diagonal pairs are always kept.
    pub fn from_overlap(ovlp: &Tsr, layout: &ShellLayout, threshold: f64) -> Result<Self> {
        let nao = layout.nao();
        ensure!(ovlp.shape() == &[nao, nao], "overlap shape {:?} does not match nao = {nao}", ovlp.shape());

        let nbas = layout.nbas();
        let pairs = (0..nbas)
            .map(|s1| {
                let (p0, p1) = (layout.shell2bf(s1), layout.shell2bf(s1 + 1));
                (0..=s1)
                    .filter(|&s2| {
                        let (q0, q1) = (layout.shell2bf(s2), layout.shell2bf(s2 + 1));
                        s1 == s2 || ovlp.i((slice!(p0, p1), slice!(q0, q1))).iter().any(|x| x.abs() >= threshold)
                    })
                    .collect()
            })
            .collect();
        Ok(Self { pairs })
    }

    /// Build from explicit lists; each list is sorted and must only hold `s2 <= s1`.
    pub fn from_lists(mut pairs: Vec<Vec<usize>>) -> Result<Self> {
        for (s1, list) in pairs.iter_mut().enumerate() {
            list.sort_unstable();
            list.dedup();
            ensure!(list.iter().all(|&s2| s2 <= s1), "shell pair list of shell {s1} holds a larger shell index");
        }
        Ok(Self { pairs })
    }

    pub fn nbas(&self) -> usize {
        self.pairs.len()
    }

    pub fn partners(&self, s1: usize) -> &[usize] {
        &self.pairs[s1]
    }

    /// Significant shell pairs `(s1, s2)` with `s1` in AO tile `ti` and `s2` in AO tile `tj`.
    pub fn pairs_in_block(&self, tiling: &AoTiling, ti: usize, tj: usize) -> Vec<(usize, usize)> {
        itertools::iproduct!(tiling.tile_shells(ti), tiling.tile_shells(tj))
            .filter(|&(s1, s2)| is_significant(self, s1, s2))
            .collect()
    }

    /// Number of significant unordered pairs.
    pub fn npairs(&self) -> usize {
        self.pairs.iter().map(|l| l.len()).sum()
    }
}

/// Whether `(a, b)` is a significant shell pair; symmetric in its arguments.
pub fn is_significant(list: &ShellPairList, a: usize, b: usize) -> bool {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    list.pairs[hi].binary_search(&lo).is_ok()
}
