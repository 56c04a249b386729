//! Check command: resolve a runner library without starting anything.

use std::path::Path;

use pgembed_core::CodeScope;
use pgembed_core::scope::ffi::{START_SYMBOL, STOP_SYMBOL};

use crate::colors;

pub fn execute(library: &Path) -> anyhow::Result<()> {
    let scope = CodeScope::load_library(library)?;

    println!(
        "{}Resolved{} {} and {} in {}",
        colors::GREEN,
        colors::RESET,
        START_SYMBOL,
        STOP_SYMBOL,
        scope.name()
    );
    Ok(())
}
