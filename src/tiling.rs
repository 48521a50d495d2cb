//! Index spaces: shell layout, AO tiles built from whole shells, and MO tiles.

use crate::prelude::*;
use std::collections::BTreeMap;
use std::ops::Range;

/* #region shell layout */

/// Basis-function offsets of the shells of one basis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellLayout {
    ao_loc: Vec<usize>,
    bf2shell: Vec<usize>,
}

impl ShellLayout {
    /// `ao_loc[s]` is the first basis function of shell `s`; the last entry is `nao`.
    pub fn new(ao_loc: Vec<usize>) -> Result<Self> {
        ensure!(ao_loc.len() >= 2, "shell layout needs at least one shell");
        ensure!(ao_loc[0] == 0, "shell layout must start at basis function 0");
        ensure!(ao_loc.windows(2).all(|w| w[0] < w[1]), "shells must have positive sizes");

        let nao = ao_loc[ao_loc.len() - 1];
        let mut bf2shell = vec![0; nao];
        for (s, w) in ao_loc.windows(2).enumerate() {
            bf2shell[w[0]..w[1]].fill(s);
        }
        Ok(Self { ao_loc, bf2shell })
    }

    /// Layout from a list of shell sizes.
    pub fn from_sizes(sizes: &[usize]) -> Result<Self> {
        let ao_loc = std::iter::once(0)
            .chain(sizes.iter().scan(0, |acc, &n| {
                *acc += n;
                Some(*acc)
            }))
            .collect();
        Self::new(ao_loc)
    }

    pub fn nbas(&self) -> usize {
        self.ao_loc.len() - 1
    }

    pub fn nao(&self) -> usize {
        self.ao_loc[self.nbas()]
    }

    pub fn ao_loc(&self) -> &[usize] {
        &self.ao_loc
    }

    pub fn shell2bf(&self, shl: usize) -> usize {
        self.ao_loc[shl]
    }

    pub fn bf2shell(&self, bf: usize) -> usize {
        self.bf2shell[bf]
    }

    pub fn shell_size(&self, shl: usize) -> usize {
        self.ao_loc[shl + 1] - self.ao_loc[shl]
    }

    pub fn max_shell_size(&self) -> usize {
        (0..self.nbas()).map(|s| self.shell_size(s)).max().unwrap_or(0)
    }
}

/* #endregion */

/* #region AO tiling */

/// AO index space tiled along shell boundaries.
#[derive(Debug, Clone)]
pub struct AoTiling {
    layout: ShellLayout,
    /// Last shell of each tile.
    shell_tile_map: Vec<usize>,
    tiles: Vec<usize>,
    tile_offsets: Vec<usize>,
    tile_of_shell: Vec<usize>,
}

impl AoTiling {
    /// Consecutive shells are gathered until the tile reaches `tilesize` functions.
    pub fn new(layout: ShellLayout, tilesize: usize) -> Result<Self> {
        ensure!(tilesize > 0, "AO tile size must be positive");

        let mut shell_tile_map = vec![];
        let mut tiles = vec![];
        let mut tile_of_shell = vec![0; layout.nbas()];
        let mut size = 0;
        for s in 0..layout.nbas() {
            tile_of_shell[s] = tiles.len();
            size += layout.shell_size(s);
            if size >= tilesize {
                tiles.push(size);
                shell_tile_map.push(s);
                size = 0;
            }
        }
        if size > 0 {
            tiles.push(size);
            shell_tile_map.push(layout.nbas() - 1);
        }

        let tile_offsets = std::iter::once(0)
            .chain(tiles.iter().scan(0, |acc, &n| {
                *acc += n;
                Some(*acc)
            }))
            .collect();

        Ok(Self { layout, shell_tile_map, tiles, tile_offsets, tile_of_shell })
    }

    pub fn layout(&self) -> &ShellLayout {
        &self.layout
    }

    pub fn nao(&self) -> usize {
        self.layout.nao()
    }

    pub fn ntiles(&self) -> usize {
        self.tiles.len()
    }

    pub fn tiles(&self) -> &[usize] {
        &self.tiles
    }

    pub fn shell_tile_map(&self) -> &[usize] {
        &self.shell_tile_map
    }

    pub fn tile_offset(&self, tile: usize) -> usize {
        self.tile_offsets[tile]
    }

    pub fn tile_of_shell(&self, shl: usize) -> usize {
        self.tile_of_shell[shl]
    }

    /// Shells whose functions make up `tile`.
    pub fn tile_shells(&self, tile: usize) -> Range<usize> {
        let start = if tile == 0 { 0 } else { self.shell_tile_map[tile - 1] + 1 };
        start..self.shell_tile_map[tile] + 1
    }

    /// Position of the first function of `shl` inside its tile.
    pub fn shell_offset_in_tile(&self, shl: usize) -> usize {
        self.layout.shell2bf(shl) - self.tile_offset(self.tile_of_shell[shl])
    }
}

/* #endregion */

/* #region MO tiling */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spin {
    Alpha,
    Beta,
}

/// MO index space with named sub-ranges and optional spin labels.
#[derive(Debug, Clone)]
pub struct MoTiling {
    nmo: usize,
    tilesize: usize,
    tiles: Vec<usize>,
    ranges: BTreeMap<&'static str, Vec<Range<usize>>>,
    spins: Option<Vec<Spin>>,
}

fn fixed_tiles(n: usize, tilesize: usize) -> Vec<usize> {
    let mut tiles = vec![tilesize; n / tilesize];
    if n % tilesize > 0 {
        tiles.push(n % tilesize);
    }
    tiles
}

fn balanced_tiles(n: usize, tilesize: usize) -> Vec<usize> {
    let est_nt = n.div_ceil(tilesize);
    (0..est_nt).map(|x| n / est_nt + usize::from(x < n % est_nt)).collect()
}

impl MoTiling {
    /// Spin-orbital MO space: alpha and beta occupied first, then alpha and beta virtuals.
    ///
    /// `nactv` virtuals of each spin are marked as internal (`virt_*_int`), the rest external.
    pub fn spin_orbital(sys: &SystemData, opts: &CDOptions, nactv: usize) -> Result<Self> {
        ensure!(
            nactv <= sys.n_vir_alpha.min(sys.n_vir_beta),
            "active virtuals ({nactv}) exceed the virtual space ({}, {})",
            sys.n_vir_alpha,
            sys.n_vir_beta
        );

        let mut tilesize = opts.mo_tilesize;
        if (tilesize < sys.nbf / 10 || tilesize < 50 || tilesize > 100) && !opts.force_tilesize {
            tilesize = (sys.nbf / 10).clamp(50, 100);
            log::warn!("Resetting MO tilesize to: {tilesize}");
        }

        let (noa, nob, nva) = (sys.n_occ_alpha, sys.n_occ_beta, sys.n_vir_alpha);
        let nocc = noa + nob;
        let total = sys.nmo;
        ensure!(
            total == nocc + nva + sys.n_vir_beta,
            "spin-orbital MO space expects nmo = {}, got {total}",
            nocc + nva + sys.n_vir_beta
        );

        let segments = [noa, nob, nactv, nva - nactv, nactv, total - (nocc + nactv + nva)];
        let split: fn(usize, usize) -> Vec<usize> = if opts.balance_tiles { balanced_tiles } else { fixed_tiles };
        let tiles = segments.iter().flat_map(|&n| split(n, tilesize)).collect();

        let ranges = BTreeMap::from([
            ("all", vec![0..total]),
            ("occ", vec![0..nocc]),
            ("occ_alpha", vec![0..noa]),
            ("occ_beta", vec![noa..nocc]),
            ("virt", vec![nocc..total]),
            ("virt_alpha", vec![nocc..nocc + nva]),
            ("virt_beta", vec![nocc + nva..total]),
            ("virt_alpha_int", vec![nocc..nocc + nactv]),
            ("virt_beta_int", vec![nocc + nva..nocc + nactv + nva]),
            ("virt_int", vec![nocc..nocc + nactv, nocc + nva..nocc + nactv + nva]),
            ("virt_alpha_ext", vec![nocc + nactv..nocc + nva]),
            ("virt_beta_ext", vec![nocc + nactv + nva..total]),
            ("virt_ext", vec![nocc + nactv..nocc + nva, nocc + nactv + nva..total]),
        ]);

        let mut spins = vec![Spin::Beta; total];
        spins[0..noa].fill(Spin::Alpha);
        spins[nocc..nocc + nva].fill(Spin::Alpha);

        Ok(Self { nmo: total, tilesize, tiles, ranges, spins: Some(spins) })
    }

    /// Spatial-orbital MO space (alpha occupied and virtual only).
    pub fn reduced(sys: &SystemData, opts: &CDOptions) -> Self {
        let mut tilesize = opts.mo_tilesize;
        if (tilesize < sys.nbf / 10 || tilesize < 50) && !opts.force_tilesize {
            tilesize = (sys.nbf / 10).max(50);
            log::warn!("Resetting MO tilesize to: {tilesize}");
        }

        let (noa, nva) = (sys.n_occ_alpha, sys.n_vir_alpha);
        let total = noa + nva;
        let tiles = [noa, nva].iter().flat_map(|&n| balanced_tiles(n, tilesize)).collect();
        let ranges = BTreeMap::from([("all", vec![0..total]), ("occ", vec![0..noa]), ("virt", vec![noa..total])]);

        Self { nmo: total, tilesize, tiles, ranges, spins: None }
    }

    pub fn nmo(&self) -> usize {
        self.nmo
    }

    pub fn tilesize(&self) -> usize {
        self.tilesize
    }

    pub fn tiles(&self) -> &[usize] {
        &self.tiles
    }

    pub fn range(&self, name: &str) -> Option<&[Range<usize>]> {
        self.ranges.get(name).map(|r| r.as_slice())
    }

    pub fn spin(&self, p: usize) -> Option<Spin> {
        self.spins.as_ref().map(|s| s[p])
    }

    pub fn is_spin_blocked(&self) -> bool {
        self.spins.is_some()
    }
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shell_layout() {
        let layout = ShellLayout::from_sizes(&[1, 3, 1, 3, 2]).unwrap();
        assert_eq!(layout.nbas(), 5);
        assert_eq!(layout.nao(), 10);
        assert_eq!(layout.ao_loc(), &[0, 1, 4, 5, 8, 10]);
        assert_eq!(layout.bf2shell(3), 1);
        assert_eq!(layout.bf2shell(9), 4);
        assert_eq!(layout.max_shell_size(), 3);
        assert!(ShellLayout::new(vec![0, 2, 2]).is_err());
    }

    #[test]
    fn test_ao_tiling() {
        let layout = ShellLayout::from_sizes(&[1, 3, 1, 3, 2]).unwrap();
        let tiling = AoTiling::new(layout, 4).unwrap();
        // tiles close once they reach 4 functions: [1, 3] [1, 3] [2]
        assert_eq!(tiling.tiles(), &[4, 4, 2]);
        assert_eq!(tiling.shell_tile_map(), &[1, 3, 4]);
        assert_eq!(tiling.tile_shells(1), 2..4);
        assert_eq!(tiling.tile_offset(2), 8);
        assert_eq!(tiling.shell_offset_in_tile(3), 1);
        assert_eq!(tiling.tile_of_shell(4), 2);
    }

    #[test]
    fn test_mo_tiling_spin_orbital() {
        let sys = SystemData::new(120, 5, 4).unwrap();
        let opts = CDOptions { mo_tilesize: 50, balance_tiles: false, ..Default::default() };
        let mo = MoTiling::spin_orbital(&sys, &opts, 0).unwrap();
        assert_eq!(mo.nmo(), 240);
        assert_eq!(mo.tiles().iter().sum::<usize>(), 240);
        assert_eq!(&mo.tiles()[..2], &[5, 4]);
        assert_eq!(mo.range("virt_alpha").unwrap(), &[9..124]);
        assert_eq!(mo.spin(4), Some(Spin::Alpha));
        assert_eq!(mo.spin(5), Some(Spin::Beta));
        assert_eq!(mo.spin(124), Some(Spin::Beta));
        assert_eq!(mo.spin(123), Some(Spin::Alpha));
    }

    #[test]
    fn test_mo_tiling_reset_and_balance() {
        let sys = SystemData::new(1200, 10, 10).unwrap();
        let opts = CDOptions { mo_tilesize: 40, ..Default::default() };
        let mo = MoTiling::spin_orbital(&sys, &opts, 0).unwrap();
        assert_eq!(mo.tilesize(), 100);
        assert!(mo.tiles().iter().all(|&t| t <= 100));

        let opts = CDOptions { mo_tilesize: 40, force_tilesize: true, ..Default::default() };
        let mo = MoTiling::reduced(&sys, &opts);
        assert_eq!(mo.tilesize(), 40);
        assert_eq!(mo.nmo(), 1200);
        // 1190 virtuals over 30 balanced tiles
        assert_eq!(mo.tiles().len(), 31);
        assert!(!mo.is_spin_blocked());
    }
}
