//! Memory bookkeeping of the live tensors, checked before each large allocation.

use crate::prelude::*;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// GiB occupied by `nelem` double-precision values.
pub fn gib_of(nelem: usize) -> f64 {
    8.0 * nelem as f64 / GIB
}

/// Running total of the memory held by live tensors, against a fixed ceiling.
#[derive(Debug, Clone)]
pub struct MemoryLedger {
    ceiling_gib: f64,
    live_gib: f64,
}

impl MemoryLedger {
    pub fn new(ceiling_gib: f64) -> Self {
        Self { ceiling_gib, live_gib: 0.0 }
    }

    /// Ceiling from `max_memory_gib`, or from the memory currently available on the host.
    pub fn from_options(opts: &CDOptions) -> Self {
        let ceiling_gib = opts.max_memory_gib.unwrap_or_else(|| {
            let mut sys = sysinfo::System::new();
            sys.refresh_memory();
            sys.available_memory() as f64 / GIB
        });
        Self::new(ceiling_gib)
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling_gib
    }

    pub fn live(&self) -> f64 {
        self.live_gib
    }

    /// Account for a tensor of `nelem` values.
    pub fn add(&mut self, nelem: usize) -> &mut Self {
        self.live_gib += gib_of(nelem);
        self
    }

    /// Release a tensor of `nelem` values.
    pub fn remove(&mut self, nelem: usize) -> &mut Self {
        self.live_gib = (self.live_gib - gib_of(nelem)).max(0.0);
        self
    }

    /// Fail if the live tensors of `stage` would not fit under the ceiling.
    pub fn check(&self, stage: &str) -> Result<()> {
        log::info!("Total memory required for {stage}: {:.2} GiB (ceiling {:.2} GiB)", self.live_gib, self.ceiling_gib);
        if self.live_gib > self.ceiling_gib {
            bail!(
                "Insufficient memory for {stage}: {:.2} GiB required, {:.2} GiB available",
                self.live_gib,
                self.ceiling_gib
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ledger_stages() {
        let mut ledger = MemoryLedger::new(1.0);
        // (1024, 1024, 64) doubles is half a GiB
        ledger.add(1024 * 1024 * 64);
        assert!((ledger.live() - 0.5).abs() < 1e-12);
        assert!(ledger.check("computing cholesky vectors").is_ok());

        ledger.add(1024 * 1024 * 96);
        let err = ledger.check("ao2mo transformation").unwrap_err();
        assert!(err.to_string().contains("ao2mo transformation"));

        ledger.remove(1024 * 1024 * 96);
        assert!(ledger.check("the 2-step contraction").is_ok());
        ledger.remove(usize::MAX / 16);
        assert_eq!(ledger.live(), 0.0);
    }

    #[test]
    fn test_ceiling_from_options() {
        let opts = CDOptions { max_memory_gib: Some(3.5), ..Default::default() };
        assert_eq!(MemoryLedger::from_options(&opts).ceiling(), 3.5);
        let host = MemoryLedger::from_options(&CDOptions::default());
        assert!(host.ceiling() >= 0.0);
    }
}
