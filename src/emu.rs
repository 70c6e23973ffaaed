use anyhow::{anyhow, bail, Result};

use std::convert::TryInto;

use crate::inst::{Decoded, Opcode, Operand};
use crate::meta::ObfTable;
use crate::trace::{register_value, Tracer};

/// How much tracee memory to dump when a trap can't be matched to a
/// metadata record.
const DUMP_WINDOW: usize = 32;

/// The effects of one serviced trap: the register file to write back, and
/// for `CALL` the return address store that must land first.
#[derive(Clone, Copy)]
pub struct Resolution {
    pub regs: libc::user_regs_struct,
    pub stack_push: Option<(u64, u64)>,
}

/// Replay the erased instruction behind a trap.
///
/// The trap byte has already retired, so `regs.rip` points one past the
/// first byte of the erased site. `read_qword` supplies 8 bytes of tracee
/// memory for memory-indirect targets; it is only invoked for those.
pub fn resolve_trap(
    table: &ObfTable,
    text_base: u64,
    mut regs: libc::user_regs_struct,
    read_qword: impl FnOnce(u64) -> Result<u64>,
) -> Result<Resolution> {
    let offset = regs
        .rip
        .checked_sub(text_base + 1)
        .ok_or_else(|| anyhow!("trap below the text base (rip {:#x})", regs.rip))?;

    let record = table.get(&offset).ok_or_else(|| {
        anyhow!(
            "trap at unrecorded text offset {:#x} (rip {:#x})",
            offset,
            regs.rip
        )
    })?;
    let decoded = &record.decoded;

    log::debug!(
        "servicing {:?} at text offset {:#x}",
        decoded.opcode,
        offset
    );

    let taken = decoded.opcode.taken(regs.eflags, regs.rcx);

    // rip already advanced one byte past the trap; move it the rest of the
    // way so it addresses the byte after the original instruction.
    regs.rip += decoded.len as u64 - 1;

    let mut stack_push = None;
    if decoded.opcode == Opcode::Call {
        regs.rsp = regs.rsp.wrapping_sub(8);
        stack_push = Some((regs.rsp, regs.rip));
    }

    if taken {
        regs.rip = branch_target(decoded, &regs, read_qword)?;
    }

    Ok(Resolution { regs, stack_push })
}

/// Evaluate a taken branch's operand. `regs.rip` already addresses the
/// byte after the original instruction, which is what both relative and
/// rip-relative forms are defined against.
fn branch_target(
    decoded: &Decoded,
    regs: &libc::user_regs_struct,
    read_qword: impl FnOnce(u64) -> Result<u64>,
) -> Result<u64> {
    match decoded.operand {
        Operand::Relative(delta) => Ok(regs.rip.wrapping_add(delta as u64)),
        Operand::Register(reg) => register_value(regs, reg),
        Operand::Memory {
            seg,
            base,
            index,
            scale,
            disp,
        } => {
            if let Some(seg) = seg {
                bail!("segment-prefixed branch target ({:?}) is not supported", seg);
            }

            let base = base.map(|reg| register_value(regs, reg)).transpose()?;
            let index = index.map(|reg| register_value(regs, reg)).transpose()?;
            let addr = base
                .unwrap_or(0)
                .wrapping_add(disp as u64)
                .wrapping_add(index.unwrap_or(0).wrapping_mul(scale as u64));

            read_qword(addr)
        }
        Operand::Immediate(imm) => bail!(
            "immediate branch operand {:#x}; the covered x86-64 branch forms never carry one",
            imm
        ),
    }
}

/// Service one SIGTRAP stop: fetch the registers, resolve the branch, and
/// apply the outcome to the tracee. A resolution failure is fatal and
/// leaves a diagnostic dump in the log.
pub fn service_trap(tracer: &Tracer, table: &ObfTable, text_base: u64) -> Result<()> {
    let regs = tracer.get_regs()?;

    let resolution = resolve_trap(table, text_base, regs, |addr| {
        let bytes = tracer.peek(addr, 8)?;
        Ok(u64::from_le_bytes(bytes.as_slice().try_into()?))
    });

    let resolution = match resolution {
        Ok(resolution) => resolution,
        Err(e) => {
            dump_around(tracer, regs.rip);
            let _ = tracer.kill();
            return Err(e);
        }
    };

    if let Some((addr, value)) = resolution.stack_push {
        tracer.poke(addr, &value.to_le_bytes())?;
    }
    tracer.set_regs(resolution.regs)?;

    Ok(())
}

fn dump_around(tracer: &Tracer, rip: u64) {
    let start = rip.saturating_sub(DUMP_WINDOW as u64 / 2);
    match tracer.peek(start, DUMP_WINDOW) {
        Ok(bytes) => log::error!("tracee memory at {:#x}: {:02x?}", start, bytes),
        Err(e) => log::error!("can't dump tracee memory around {:#x}: {:#}", rip, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::ZF;
    use crate::meta;

    const TEXT_BASE: u64 = 0x55d0_0000_1000;

    fn table_of(records: &[(u64, &[u8])]) -> ObfTable {
        let raw = records
            .iter()
            .map(|(offset, bytes)| meta::ExportRecord {
                offset: *offset,
                instruction: bytes.to_vec(),
            })
            .collect();
        meta::import(raw).unwrap()
    }

    fn trapped_regs(offset: u64) -> libc::user_regs_struct {
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        regs.rip = TEXT_BASE + offset + 1;
        regs
    }

    fn no_memory(_: u64) -> Result<u64> {
        panic!("memory read not expected for this operand");
    }

    #[test]
    fn test_unconditional_jmp() {
        // jmp +5 at 0x40.
        let table = table_of(&[(0x40, &[0xeb, 0x05])]);
        let regs = trapped_regs(0x40);

        let resolution = resolve_trap(&table, TEXT_BASE, regs, no_memory).unwrap();
        assert_eq!(resolution.regs.rip, TEXT_BASE + 0x47);
        assert!(resolution.stack_push.is_none());
        assert_eq!(resolution.regs.rsp, regs.rsp);
    }

    #[test]
    fn test_conditional_not_taken() {
        // je +10 at 0x10 with ZF clear: fall through.
        let table = table_of(&[(0x10, &[0x74, 0x0a])]);
        let regs = trapped_regs(0x10);

        let resolution = resolve_trap(&table, TEXT_BASE, regs, no_memory).unwrap();
        assert_eq!(resolution.regs.rip, TEXT_BASE + 0x12);
    }

    #[test]
    fn test_conditional_taken() {
        let table = table_of(&[(0x10, &[0x74, 0x0a])]);
        let mut regs = trapped_regs(0x10);
        regs.eflags = ZF;

        let resolution = resolve_trap(&table, TEXT_BASE, regs, no_memory).unwrap();
        assert_eq!(resolution.regs.rip, TEXT_BASE + 0x1c);
    }

    #[test]
    fn test_direct_call_pushes_return_address() {
        // call +20 at 0x100.
        let table = table_of(&[(0x100, &[0xe8, 0x14, 0x00, 0x00, 0x00])]);
        let mut regs = trapped_regs(0x100);
        regs.rsp = 0x7fff_ffff_f000;

        let resolution = resolve_trap(&table, TEXT_BASE, regs, no_memory).unwrap();

        assert_eq!(resolution.regs.rsp, 0x7fff_ffff_eff8);
        assert_eq!(
            resolution.stack_push,
            Some((0x7fff_ffff_eff8, TEXT_BASE + 0x105))
        );
        assert_eq!(resolution.regs.rip, TEXT_BASE + 0x119);
    }

    #[test]
    fn test_register_indirect_jmp() {
        // jmp rax at 0x200.
        let table = table_of(&[(0x200, &[0xff, 0xe0])]);
        let mut regs = trapped_regs(0x200);
        regs.rax = 0xdead_beef_cafe_0000;

        let resolution = resolve_trap(&table, TEXT_BASE, regs, no_memory).unwrap();
        assert_eq!(resolution.regs.rip, 0xdead_beef_cafe_0000);
    }

    #[test]
    fn test_rcx_width_variants() {
        let rcx = 0x1_0000_0000u64;

        // jrcxz +5: all 64 bits are non-zero, no branch.
        let table = table_of(&[(0x20, &[0xe3, 0x05])]);
        let mut regs = trapped_regs(0x20);
        regs.rcx = rcx;
        let resolution = resolve_trap(&table, TEXT_BASE, regs, no_memory).unwrap();
        assert_eq!(resolution.regs.rip, TEXT_BASE + 0x22);

        // jecxz +5: the low 32 bits are zero, branch.
        let table = table_of(&[(0x20, &[0x67, 0xe3, 0x05])]);
        let mut regs = trapped_regs(0x20);
        regs.rcx = rcx;
        let resolution = resolve_trap(&table, TEXT_BASE, regs, no_memory).unwrap();
        assert_eq!(resolution.regs.rip, TEXT_BASE + 0x28);
    }

    #[test]
    fn test_memory_indirect_jmp() {
        // jmp [rbx+0x10] at 0x80.
        let table = table_of(&[(0x80, &[0xff, 0x63, 0x10])]);
        let mut regs = trapped_regs(0x80);
        regs.rbx = 0x7000;

        let resolution = resolve_trap(&table, TEXT_BASE, regs, |addr| {
            assert_eq!(addr, 0x7010);
            Ok(0x4141_4141_4141_4141)
        })
        .unwrap();
        assert_eq!(resolution.regs.rip, 0x4141_4141_4141_4141);
    }

    #[test]
    fn test_rip_relative_jmp() {
        // jmp [rip+0x1000] at 0x300, 6 bytes: the slot sits at the runtime
        // address of the next instruction plus the displacement.
        let table = table_of(&[(0x300, &[0xff, 0x25, 0x00, 0x10, 0x00, 0x00])]);
        let regs = trapped_regs(0x300);

        let resolution = resolve_trap(&table, TEXT_BASE, regs, |addr| {
            assert_eq!(addr, TEXT_BASE + 0x306 + 0x1000);
            Ok(0x1234_5678)
        })
        .unwrap();
        assert_eq!(resolution.regs.rip, 0x1234_5678);
    }

    #[test]
    fn test_scaled_index_addressing() {
        // jmp [rbx+rcx*8+0x20] at 0. rcx also drives no predicate here, so
        // any value is fine.
        let table = table_of(&[(0x0, &[0xff, 0x64, 0xcb, 0x20])]);
        let mut regs = trapped_regs(0x0);
        regs.rbx = 0x1000;
        regs.rcx = 3;

        let resolution = resolve_trap(&table, TEXT_BASE, regs, |addr| {
            assert_eq!(addr, 0x1000 + 3 * 8 + 0x20);
            Ok(0x9999)
        })
        .unwrap();
        assert_eq!(resolution.regs.rip, 0x9999);
    }

    #[test]
    fn test_segment_prefixed_target_is_fatal() {
        // jmp gs:[rcx] at 0x50.
        let table = table_of(&[(0x50, &[0x65, 0xff, 0x21])]);
        let regs = trapped_regs(0x50);

        assert!(resolve_trap(&table, TEXT_BASE, regs, no_memory).is_err());
    }

    #[test]
    fn test_unknown_offset_is_fatal() {
        let table = table_of(&[(0x40, &[0xeb, 0x05])]);
        let regs = trapped_regs(0x41);

        assert!(resolve_trap(&table, TEXT_BASE, regs, no_memory).is_err());
    }

    #[test]
    fn test_trap_below_text_base_is_fatal() {
        let table = table_of(&[(0x40, &[0xeb, 0x05])]);
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        regs.rip = TEXT_BASE - 0x10;

        assert!(resolve_trap(&table, TEXT_BASE, regs, no_memory).is_err());
    }

    #[test]
    fn test_rsp_only_moves_for_call() {
        let cases: &[(u64, &[u8])] = &[
            (0x10, &[0xeb, 0x05]),
            (0x10, &[0x74, 0x0a]),
            (0x10, &[0xff, 0xe0]),
        ];

        for (offset, bytes) in cases {
            let table = table_of(&[(*offset, bytes)]);
            let mut regs = trapped_regs(*offset);
            regs.rsp = 0x7fff_0000_0000;
            regs.eflags = ZF;

            let resolution = resolve_trap(&table, TEXT_BASE, regs, no_memory).unwrap();
            assert_eq!(resolution.regs.rsp, regs.rsp, "{:02x?}", bytes);
            assert!(resolution.stack_push.is_none());
        }
    }
}
