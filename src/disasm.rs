use anyhow::{bail, Result};
use iced_x86::{Instruction, Mnemonic};

use std::collections::HashSet;

use crate::inst::{self, Decoded, Opcode, Operand, ENDBR64};

/// One erased instruction: where it sat in `.text`, its original bytes, and
/// the decoded form the emulator replays.
#[derive(Clone, Debug, PartialEq)]
pub struct ObfRecord {
    pub offset: u64,
    pub bytes: Vec<u8>,
    pub decoded: Decoded,
}

/// How the obfuscator walks `.text`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Decode every instruction from offset zero onwards. The default.
    Linear,
    /// Follow the control flow from the entry point. Unreliable on ordinary
    /// compiler output, where the entry chain reaches `main` through a
    /// register.
    Recursive,
}

/// Disassemble `.text` with the chosen strategy. `entry` is the
/// `.text`-relative entry point and is only consulted in recursive mode.
pub fn disassemble(code: &[u8], strategy: Strategy, entry: u64) -> Vec<ObfRecord> {
    match strategy {
        Strategy::Linear => linear(code),
        Strategy::Recursive => recursive(code, entry),
    }
}

/// Linear sweep. Fails soft: an undecodable position ends the walk and the
/// records gathered so far are the result.
pub fn linear(code: &[u8]) -> Vec<ObfRecord> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < code.len() {
        if code[pos..].starts_with(&ENDBR64) {
            pos += ENDBR64.len();
            continue;
        }

        let instr = match inst::decode_one(&code[pos..], pos as u64) {
            Some(instr) => instr,
            None => {
                log_soft_stop(code, pos);
                break;
            }
        };

        if let Some(opcode) = inst::classify(&instr) {
            match record_at(code, pos, &instr, opcode) {
                Ok(record) => records.push(record),
                Err(e) => {
                    log::warn!("offset {:#x}: {:#}; stopping here", pos, e);
                    break;
                }
            }
        }

        pos += instr.len();
    }

    records
}

/// Recursive traversal seeded at `entry`. Chains end at `JMP`, `RET`, an
/// already-visited offset, or a decode failure; relative branch targets
/// inside the buffer are queued for their own chain.
pub fn recursive(code: &[u8], entry: u64) -> Vec<ObfRecord> {
    let len = code.len() as u64;
    let mut records = Vec::new();
    let mut stack = vec![entry];
    let mut visited = HashSet::new();

    while let Some(start) = stack.pop() {
        let mut pos = start;

        while pos < len {
            // Landing on a visited start-of-instruction means this chain
            // merged into code we already walked.
            if !visited.insert(pos) {
                break;
            }

            let at = pos as usize;
            if code[at..].starts_with(&ENDBR64) {
                pos += ENDBR64.len() as u64;
                continue;
            }

            let instr = match inst::decode_one(&code[at..], pos) {
                Some(instr) => instr,
                None => {
                    log_soft_stop(code, at);
                    break;
                }
            };

            let opcode = inst::classify(&instr);
            if let Some(opcode) = opcode {
                let record = match record_at(code, at, &instr, opcode) {
                    Ok(record) => record,
                    Err(e) => {
                        log::warn!("offset {:#x}: {:#}; stopping here", pos, e);
                        break;
                    }
                };

                if let Operand::Relative(delta) = record.decoded.operand {
                    let target = pos
                        .wrapping_add(instr.len() as u64)
                        .wrapping_add(delta as u64);
                    if target < len {
                        stack.push(target);
                    }
                }

                records.push(record);

                if opcode == Opcode::Jmp {
                    break;
                }
            } else if instr.mnemonic() == Mnemonic::Ret {
                break;
            }

            pos += instr.len() as u64;
        }
    }

    records.sort_by_key(|record| record.offset);
    records
}

fn record_at(code: &[u8], pos: usize, instr: &Instruction, opcode: Opcode) -> Result<ObfRecord> {
    let decoded = Decoded {
        opcode,
        len: instr.len(),
        operand: inst::operand(instr)?,
    };

    // The covered branch forms are 2..=7 bytes. A branch dressed up with
    // enough prefixes to exceed that is not something the runtime can
    // honor, so it ends the walk like any other decode anomaly.
    if !(2..=7).contains(&decoded.len) {
        bail!("{}-byte {:?} is outside the covered branch forms", decoded.len, opcode);
    }

    Ok(ObfRecord {
        offset: pos as u64,
        bytes: code[pos..pos + decoded.len].to_vec(),
        decoded,
    })
}

fn log_soft_stop(code: &[u8], pos: usize) {
    let window = &code[pos..code.len().min(pos + 8)];
    log::warn!(
        "can't decode instruction at offset {:#x}; stopping obfuscation here",
        pos
    );
    log::warn!("bytes: {:02x?}", window);
}
