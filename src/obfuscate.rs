use anyhow::{anyhow, Context, Result};
use goblin::elf::Elf;
use rand::Rng;

use std::fs;
use std::path::Path;

use crate::disasm::{self, ObfRecord, Strategy};

/// The single-byte no-op filler.
pub const NOP: u8 = 0x90;

/// What gets written over an erased instruction's bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filler {
    Nop,
    Random,
}

/// Where `.text` lives in the file, plus the entry point for the recursive
/// strategy. The runtime reuses this to recover the file offset it needs
/// for the text base computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextSection {
    pub offset: u64,
    pub size: u64,
    pub vaddr: u64,
    pub entry: u64,
}

/// Locate `.text` in an ELF image.
pub fn locate_text(elf_bytes: &[u8]) -> Result<TextSection> {
    let elf = Elf::parse(elf_bytes).context("parsing the ELF image")?;

    for sh in &elf.section_headers {
        if let Some(".text") = elf.shdr_strtab.get_at(sh.sh_name) {
            return Ok(TextSection {
                offset: sh.sh_offset,
                size: sh.sh_size,
                vaddr: sh.sh_addr,
                entry: elf.entry,
            });
        }
    }

    Err(anyhow!("no .text section in the ELF image"))
}

/// Obfuscate the ELF at `path`: erase every covered control-transfer
/// instruction and return the rewritten image together with the recovery
/// table.
pub fn obfuscate(path: &Path, strategy: Strategy, filler: Filler) -> Result<(Vec<u8>, Vec<ObfRecord>)> {
    let contents = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    obfuscate_bytes(&contents, strategy, filler)
}

/// The in-memory obfuscation transform. The output is byte-identical to the
/// input outside the erased intervals.
pub fn obfuscate_bytes(
    contents: &[u8],
    strategy: Strategy,
    filler: Filler,
) -> Result<(Vec<u8>, Vec<ObfRecord>)> {
    let text = locate_text(contents)?;

    let start = text.offset as usize;
    let end = start
        .checked_add(text.size as usize)
        .filter(|end| *end <= contents.len())
        .ok_or_else(|| anyhow!(".text section extends past the end of the file"))?;
    let code = &contents[start..end];

    // The entry point is a virtual address; the recursive walk wants it
    // relative to the start of .text.
    let entry = text.entry.wrapping_sub(text.vaddr);
    let records = disasm::disassemble(code, strategy, entry);

    log::info!("obfuscated {} instructions", records.len());

    let mut out = contents.to_vec();
    let mut rng = rand::thread_rng();
    for record in &records {
        let lo = start + record.offset as usize;
        for byte in &mut out[lo..lo + record.decoded.len] {
            *byte = match filler {
                Filler::Nop => NOP,
                Filler::Random => rng.gen(),
            };
        }
    }

    Ok((out, records))
}
