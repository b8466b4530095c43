//! Sample-sequence selection.
//!
//! The trace kernel indexes a Z-order (Morton) scrambled Sobol sequence
//! by interleaving pixel coordinates with the sample index. That index
//! must fit in 32 bits; when the configured resolution and sample count
//! blow the budget the renderer falls back to uniform hashing and says
//! so once at startup.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SampleStrategy {
    ZSobol = 0,
    Uniform = 1,
}

fn log2_ceil(v: u32) -> u32 {
    32 - v.max(1).next_power_of_two().leading_zeros() - 1
}

/// Bits the Morton sample index needs for `spp` samples at `w`x`h`.
pub fn index_bits(spp: u32, width: u32, height: u32) -> u32 {
    let dim_bits = log2_ceil(width.max(height));
    2 * dim_bits + log2_ceil(spp)
}

pub fn select_strategy(
    spp: u32,
    width: u32,
    height: u32,
    force_uniform: bool,
) -> SampleStrategy {
    if force_uniform {
        return SampleStrategy::Uniform;
    }
    let bits = index_bits(spp, width, height);
    if bits <= 32 {
        SampleStrategy::ZSobol
    } else {
        log::warn!(
            "sample index needs {bits} bits at {width}x{height} spp {spp}; \
             falling back to uniform sampling"
        );
        SampleStrategy::Uniform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log2_ceil_rounds_up() {
        assert_eq!(log2_ceil(1), 0);
        assert_eq!(log2_ceil(2), 1);
        assert_eq!(log2_ceil(3), 2);
        assert_eq!(log2_ceil(1024), 10);
        assert_eq!(log2_ceil(1025), 11);
    }

    #[test]
    fn small_configs_use_zsobol() {
        assert_eq!(select_strategy(64, 128, 128, false), SampleStrategy::ZSobol);
        // 2*11 + 10 = 32: exactly on budget
        assert_eq!(
            select_strategy(1024, 2048, 2048, false),
            SampleStrategy::ZSobol
        );
    }

    #[test]
    fn oversized_budget_falls_back() {
        // 2*12 + 10 = 34 bits
        assert_eq!(
            select_strategy(1024, 4096, 4096, false),
            SampleStrategy::Uniform
        );
    }

    #[test]
    fn force_uniform_wins() {
        assert_eq!(select_strategy(4, 64, 64, true), SampleStrategy::Uniform);
    }
}
