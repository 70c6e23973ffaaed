use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::disasm::ObfRecord;
use crate::inst;

/// The wire form of one erased instruction. Only the offset and the
/// original bytes travel; the decoded form is reconstructed on import by
/// the same decoder that produced it, so the two sides can't drift.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub offset: u64,
    pub instruction: Vec<u8>,
}

/// The immutable runtime-side table: offset into `.text` to erased
/// instruction.
pub type ObfTable = BTreeMap<u64, ObfRecord>;

pub fn export(records: &[ObfRecord]) -> Vec<ExportRecord> {
    records
        .iter()
        .map(|record| ExportRecord {
            offset: record.offset,
            instruction: record.bytes.clone(),
        })
        .collect()
}

/// Serialize the table for transport alongside the stripped binary.
pub fn serialize(records: &[ObfRecord]) -> Result<Vec<u8>> {
    serde_json::to_vec(&export(records)).context("serializing obfuscation metadata")
}

/// Deserialize a metadata blob, re-decoding every instruction. Any failure
/// is fatal: the blob was produced by this crate's own encoder, so a record
/// that won't round-trip means corruption or a version mismatch.
pub fn deserialize(blob: &[u8]) -> Result<ObfTable> {
    let raw: Vec<ExportRecord> =
        serde_json::from_slice(blob).context("obfuscation metadata is corrupt")?;
    import(raw)
}

pub fn import(raw: Vec<ExportRecord>) -> Result<ObfTable> {
    let mut table = ObfTable::new();

    for record in raw {
        let decoded = inst::decode_branch(&record.instruction, record.offset)
            .with_context(|| {
                format!(
                    "metadata record at offset {:#x} does not re-decode",
                    record.offset
                )
            })?;

        let offset = record.offset;
        let previous = table.insert(
            offset,
            ObfRecord {
                offset,
                bytes: record.instruction,
                decoded,
            },
        );
        if previous.is_some() {
            bail!("duplicate metadata record at offset {:#x}", offset);
        }
    }

    Ok(table)
}
