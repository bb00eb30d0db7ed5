//! The CPU port seam.
//!
//! Everything the kernel needs from the processor goes through this
//! module: interrupt masking, the pend-switch and service call plumbing,
//! the system timer and the stack pointer shuffle at start. On an ARM
//! bare-metal target the real Cortex-M port is compiled in; everywhere
//! else a simulated CPU takes its place so the whole kernel can be
//! exercised on a host, driven by [`sim`].

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod cortex;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex::*;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod sim;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use sim::*;
