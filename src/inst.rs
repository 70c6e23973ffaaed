use anyhow::{anyhow, bail, Result};
use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

/// `endbr64`. Matched by the byte sequence so the disassemblers skip it
/// uniformly regardless of what the decoder makes of it.
pub const ENDBR64: [u8; 4] = [0xf3, 0x0f, 0x1e, 0xfa];

// rflags condition bits.
pub const CF: u64 = 1 << 0;
pub const PF: u64 = 1 << 2;
pub const ZF: u64 = 1 << 6;
pub const SF: u64 = 1 << 7;
pub const OF: u64 = 1 << 11;

/// The closed set of control-transfer opcodes we erase and later emulate.
///
/// Every variant here has a predicate row in `taken`; the obfuscator never
/// records an instruction outside this set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Jmp,
    Jo,
    Jno,
    Js,
    Jns,
    Je,
    Jne,
    Jb,
    Jae,
    Jbe,
    Ja,
    Jl,
    Jge,
    Jle,
    Jg,
    Jp,
    Jnp,
    Jrcxz,
    Jecxz,
    Jcxz,
    Call,
}

impl Opcode {
    /// Map a decoded mnemonic into the covered set, or `None` for anything
    /// we leave alone.
    pub fn from_mnemonic(mnemonic: Mnemonic) -> Option<Self> {
        match mnemonic {
            Mnemonic::Jmp => Some(Opcode::Jmp),
            Mnemonic::Jo => Some(Opcode::Jo),
            Mnemonic::Jno => Some(Opcode::Jno),
            Mnemonic::Js => Some(Opcode::Js),
            Mnemonic::Jns => Some(Opcode::Jns),
            Mnemonic::Je => Some(Opcode::Je),
            Mnemonic::Jne => Some(Opcode::Jne),
            Mnemonic::Jb => Some(Opcode::Jb),
            Mnemonic::Jae => Some(Opcode::Jae),
            Mnemonic::Jbe => Some(Opcode::Jbe),
            Mnemonic::Ja => Some(Opcode::Ja),
            Mnemonic::Jl => Some(Opcode::Jl),
            Mnemonic::Jge => Some(Opcode::Jge),
            Mnemonic::Jle => Some(Opcode::Jle),
            Mnemonic::Jg => Some(Opcode::Jg),
            Mnemonic::Jp => Some(Opcode::Jp),
            Mnemonic::Jnp => Some(Opcode::Jnp),
            Mnemonic::Jrcxz => Some(Opcode::Jrcxz),
            Mnemonic::Jecxz => Some(Opcode::Jecxz),
            Mnemonic::Jcxz => Some(Opcode::Jcxz),
            Mnemonic::Call => Some(Opcode::Call),
            _ => None,
        }
    }

    /// Evaluate the branch predicate against the tracee's rflags and `RCX`.
    pub fn taken(self, rflags: u64, rcx: u64) -> bool {
        let cf = rflags & CF != 0;
        let pf = rflags & PF != 0;
        let zf = rflags & ZF != 0;
        let sf = rflags & SF != 0;
        let of = rflags & OF != 0;

        match self {
            Opcode::Jmp | Opcode::Call => true,
            Opcode::Jo => of,
            Opcode::Jno => !of,
            Opcode::Js => sf,
            Opcode::Jns => !sf,
            Opcode::Je => zf,
            Opcode::Jne => !zf,
            Opcode::Jb => cf,
            Opcode::Jae => !cf,
            Opcode::Jbe => cf || zf,
            Opcode::Ja => !cf && !zf,
            Opcode::Jl => sf != of,
            Opcode::Jge => sf == of,
            Opcode::Jle => zf || sf != of,
            Opcode::Jg => !zf && sf == of,
            Opcode::Jp => pf,
            Opcode::Jnp => !pf,
            Opcode::Jrcxz => rcx == 0,
            Opcode::Jecxz => rcx & 0xffff_ffff == 0,
            Opcode::Jcxz => rcx & 0xffff == 0,
        }
    }
}

/// A branch instruction's single operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// Signed displacement from the end of the instruction.
    Relative(i64),
    Register(Register),
    Memory {
        seg: Option<Register>,
        base: Option<Register>,
        index: Option<Register>,
        scale: u32,
        disp: i64,
    },
    /// Never produced by the covered branch forms; carried so a decoder
    /// mismatch surfaces as a fatal error instead of silent misexecution.
    Immediate(i64),
}

/// The decoded form of one erased instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub opcode: Opcode,
    pub len: usize,
    pub operand: Operand,
}

/// Decode a single instruction at the start of `code`, or `None` if the
/// decoder rejects the bytes. A rejection on a linear sweep means the
/// stream is misaligned (or is data), and the caller stops there.
pub fn decode_one(code: &[u8], ip: u64) -> Option<Instruction> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let instr = decoder.decode();

    match instr.code() {
        Code::INVALID => None,
        _ => Some(instr),
    }
}

/// Is this instruction in the covered set?
///
/// Far jumps and calls share the near forms' mnemonics but rewrite `CS`,
/// which the emulator has no way to express; they stay untouched.
pub fn classify(instr: &Instruction) -> Option<Opcode> {
    let code = instr.code();
    if code.is_jmp_far()
        || code.is_jmp_far_indirect()
        || code.is_call_far()
        || code.is_call_far_indirect()
    {
        return None;
    }

    Opcode::from_mnemonic(instr.mnemonic())
}

fn reg_opt(reg: Register) -> Option<Register> {
    match reg {
        Register::None => None,
        reg => Some(reg),
    }
}

/// Extract the tagged operand of a covered branch instruction.
pub fn operand(instr: &Instruction) -> Result<Operand> {
    match instr.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Ok(
            Operand::Relative(instr.near_branch_target().wrapping_sub(instr.next_ip()) as i64),
        ),
        OpKind::Register => Ok(Operand::Register(instr.op0_register())),
        OpKind::Memory => {
            // For rip-relative operands the decoder folds the displacement
            // into an absolute address; keep the raw displacement so the
            // emulator can re-add the runtime rip.
            let disp = if instr.memory_base() == Register::RIP {
                instr.memory_displacement64().wrapping_sub(instr.next_ip()) as i64
            } else {
                instr.memory_displacement64() as i64
            };

            Ok(Operand::Memory {
                seg: reg_opt(instr.segment_prefix()),
                base: reg_opt(instr.memory_base()),
                index: reg_opt(instr.memory_index()),
                scale: instr.memory_index_scale(),
                disp,
            })
        }
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => Ok(Operand::Immediate(instr.immediate(0) as i64)),
        kind => Err(anyhow!(
            "unsupported operand kind {:?} for {:?}",
            kind,
            instr.code()
        )),
    }
}

/// Fully decode a recorded instruction's bytes back into its `Decoded`
/// form. Used by the metadata codec on import: the bytes were produced by
/// this same decoder, so any failure here is a contract violation.
pub fn decode_branch(bytes: &[u8], ip: u64) -> Result<Decoded> {
    let instr =
        decode_one(bytes, ip).ok_or_else(|| anyhow!("instruction bytes do not decode"))?;

    let opcode = classify(&instr).ok_or_else(|| {
        anyhow!(
            "{:?} is not a covered control-transfer instruction",
            instr.code()
        )
    })?;

    if instr.len() != bytes.len() {
        bail!(
            "instruction length {} does not match the {} recorded bytes",
            instr.len(),
            bytes.len()
        );
    }

    Ok(Decoded {
        opcode,
        len: instr.len(),
        operand: operand(&instr)?,
    })
}
