//! ARMv7-A specifics: saved register frames, barriers, cache maintenance
//! and the cp15 side of the MMU.

pub mod barrier;
pub mod cache;
pub mod context;
pub mod mmu;
