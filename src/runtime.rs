use anyhow::{anyhow, bail, Context, Result};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

use std::fs;
use std::path::Path;

use crate::emu;
use crate::meta::{self, ObfTable};
use crate::obfuscate;
use crate::trace::{MapEntry, Tracer};

/// int3.
pub const TRAP: u8 = 0xcc;

/// The runtime virtual address of `.text` offset zero, recovered from the
/// first executable mapping and the section's file offset.
fn text_base_addr(region: &MapEntry, text_offset: u64) -> Result<u64> {
    (region.start + text_offset)
        .checked_sub(region.offset)
        .ok_or_else(|| anyhow!("executable mapping does not cover the text section"))
}

/// Supervises one stripped binary: plants a trap at every erased site and
/// replays the original branches as the tracee hits them.
pub struct Supervisor {
    tracer: Tracer,
    table: ObfTable,
    text_base: u64,
}

impl Supervisor {
    /// Load the metadata, spawn `binary` under trace, and install the
    /// traps. The tracee is left in its initial stop.
    pub fn prepare(binary: &str, metadata: &Path, args: &[String]) -> Result<Self> {
        let blob = fs::read(metadata)
            .with_context(|| format!("reading metadata from {}", metadata.display()))?;
        let table = meta::deserialize(&blob)?;
        log::info!("loaded {} obfuscation records", table.len());

        let elf = fs::read(binary).with_context(|| format!("reading {}", binary))?;
        let text = obfuscate::locate_text(&elf)?;

        let tracer = Tracer::spawn(binary, args)?;

        let region = tracer.first_executable_region()?;
        let text_base = text_base_addr(&region, text.offset)?;
        log::debug!(
            "text base {:#x} (mapping {:#x}..{:#x} at file offset {:#x})",
            text_base,
            region.start,
            region.end,
            region.offset
        );

        for offset in table.keys() {
            tracer.poke(text_base + offset, &[TRAP])?;
        }
        log::debug!("installed {} traps", table.len());

        Ok(Self {
            tracer,
            table,
            text_base,
        })
    }

    /// Resume the tracee and service traps until it exits. Returns the
    /// tracee's exit status.
    ///
    /// Any stop other than a trap is fatal: signal handling is outside the
    /// metadata contract, and continuing past one would mask a divergence.
    pub fn run(&self) -> Result<i32> {
        self.tracer.cont()?;

        loop {
            match self.tracer.wait()? {
                WaitStatus::Exited(_, status) => {
                    log::debug!("tracee exited with {}", status);
                    return Ok(status);
                }
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    emu::service_trap(&self.tracer, &self.table, self.text_base)?;
                    self.tracer.cont()?;
                }
                WaitStatus::Stopped(_, signal) => {
                    let _ = self.tracer.kill();
                    bail!("tracee stopped with unexpected signal {:?}", signal);
                }
                status => {
                    let _ = self.tracer.kill();
                    bail!("unexpected tracee state: {:?}", status);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{MAP_EXEC, MAP_READ};

    fn region(start: u64, offset: u64) -> MapEntry {
        MapEntry {
            start,
            end: start + 0x4000,
            flags: MAP_READ | MAP_EXEC,
            offset,
            device: "103:02".to_string(),
            inode: 42,
            name: "/tmp/target.obf".to_string(),
        }
    }

    #[test]
    fn test_text_base_addr() {
        // .text at file offset 0x1040, segment mapped from file offset
        // 0x1000: offset zero of .text lands 0x40 into the mapping.
        let base = text_base_addr(&region(0x5555_5555_0000, 0x1000), 0x1040).unwrap();
        assert_eq!(base, 0x5555_5555_0040);

        // Zero-offset mapping (non-PIE single segment).
        let base = text_base_addr(&region(0x40_0000, 0), 0x1040).unwrap();
        assert_eq!(base, 0x40_1040);
    }

    #[test]
    fn test_text_base_addr_rejects_disjoint_mapping() {
        assert!(text_base_addr(&region(0x1000, 0x10_0000), 0x40).is_err());
    }
}
