// SPDX-License-Identifier: GPL-2.0

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn read_trimmed(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(raw.trim().to_string())
}

pub fn read_u64(path: &Path) -> Result<u64> {
    let s = read_trimmed(path)?;
    s.parse::<u64>()
        .with_context(|| format!("{}: not an unsigned integer: {:?}", path.display(), s))
}

pub fn read_u32(path: &Path) -> Result<u32> {
    Ok(read_u64(path)? as u32)
}

pub fn write_str(path: &Path, val: &str) -> Result<()> {
    fs::write(path, val).with_context(|| format!("failed to write {}", path.display()))
}
