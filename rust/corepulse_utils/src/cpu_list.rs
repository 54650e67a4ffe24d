// SPDX-License-Identifier: GPL-2.0

use anyhow::{anyhow, bail, Result};
use std::collections::HashSet;

/// Parse a CPU list in the kernel's mask format: a comma-separated mix of
/// single ids and inclusive ranges ("0-3,5"). Used both for CLI options and
/// for the sysfs `online` / `possible` masks.
pub fn parse_cpu_list(optarg: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    let mut seen = HashSet::new();

    if optarg
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        bail!("invalid character in CPU list {:?}", optarg);
    }

    for token in optarg.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if let Some((start_str, end_str)) = token.split_once('-') {
            let start = start_str
                .trim()
                .parse::<usize>()
                .map_err(|_| anyhow!("invalid range start in {:?}", token))?;
            let end = end_str
                .trim()
                .parse::<usize>()
                .map_err(|_| anyhow!("invalid range end in {:?}", token))?;
            if start > end {
                bail!("invalid CPU range: {}-{}", start, end);
            }
            for i in start..=end {
                if seen.insert(i) {
                    cpus.push(i);
                }
            }
        } else {
            let cpu = token
                .parse::<usize>()
                .map_err(|_| anyhow!("invalid CPU: {:?}", token))?;
            if seen.insert(cpu) {
                cpus.push(cpu);
            }
        }
    }

    Ok(cpus)
}
