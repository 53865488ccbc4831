//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `caphub_core` linkage.
//! - Keep output deterministic for quick local sanity checks.

fn main() {
    // Why: argument parsing and result printing live in the host; this
    // probe only validates that the core crate links and reports itself.
    println!("caphub_core ping={}", caphub_core::ping());
    println!("caphub_core version={}", caphub_core::core_version());
}
