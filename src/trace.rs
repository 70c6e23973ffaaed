use anyhow::{anyhow, bail, Context, Result};
use iced_x86::Register;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::uio;
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::Pid;
use spawn_ptrace::CommandPtraceSpawn;

use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::mpsc;
use std::thread;

/// ptrace reads and writes whole words.
pub const WORD_SIZE: usize = 8;

// Bits of MapEntry::flags.
pub const MAP_READ: u8 = 1 << 0;
pub const MAP_WRITE: u8 = 1 << 1;
pub const MAP_EXEC: u8 = 1 << 2;
pub const MAP_PRIVATE: u8 = 1 << 3;
pub const MAP_SHARED: u8 = 1 << 4;

/// One line of the tracee's `/proc/<pid>/maps`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub flags: u8,
    pub offset: u64,
    pub device: String,
    pub inode: u64,
    pub name: String,
}

impl MapEntry {
    pub fn is_executable(&self) -> bool {
        self.flags & MAP_EXEC != 0
    }

    /// Parse a maps line, e.g.
    /// `5630a4a8c000-5630a4a90000 r-xp 00002000 103:02 2623479  /usr/bin/cat`.
    fn parse(line: &str) -> Option<MapEntry> {
        let mut fields = line.split_whitespace();

        let mut range = fields.next()?.splitn(2, '-');
        let start = u64::from_str_radix(range.next()?, 16).ok()?;
        let end = u64::from_str_radix(range.next()?, 16).ok()?;

        let perms = fields.next()?;
        let mut flags = 0u8;
        if perms.contains('r') {
            flags |= MAP_READ;
        }
        if perms.contains('w') {
            flags |= MAP_WRITE;
        }
        if perms.contains('x') {
            flags |= MAP_EXEC;
        }
        if perms.contains('p') {
            flags |= MAP_PRIVATE;
        }
        if perms.contains('s') {
            flags |= MAP_SHARED;
        }

        let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
        let device = fields.next()?.to_string();
        let inode = fields.next()?.parse().ok()?;
        let name = fields.collect::<Vec<_>>().join(" ");

        Some(MapEntry {
            start,
            end,
            flags,
            offset,
            device,
            inode,
            name,
        })
    }
}

/// Concretize an iced-x86 register id against the tracee's register file.
///
/// Only the 16 64-bit general-purpose registers and `RIP` can appear in the
/// branch forms we patch; anything narrower, or any segment or vector
/// register, means the decoder handed back an operand outside the contract.
pub fn register_value(regs: &libc::user_regs_struct, reg: Register) -> Result<u64> {
    Ok(match reg {
        Register::RAX => regs.rax,
        Register::RBX => regs.rbx,
        Register::RCX => regs.rcx,
        Register::RDX => regs.rdx,
        Register::RSI => regs.rsi,
        Register::RDI => regs.rdi,
        Register::RSP => regs.rsp,
        Register::RBP => regs.rbp,
        Register::R8 => regs.r8,
        Register::R9 => regs.r9,
        Register::R10 => regs.r10,
        Register::R11 => regs.r11,
        Register::R12 => regs.r12,
        Register::R13 => regs.r13,
        Register::R14 => regs.r14,
        Register::R15 => regs.r15,
        Register::RIP => regs.rip,
        _ => return Err(anyhow!("unsupported register in branch operand: {:?}", reg)),
    })
}

type TraceOp = Box<dyn FnOnce() + Send>;

/// A process being traced, with every ptrace call funneled through one
/// dedicated thread. The kernel ties tracer identity to the task that
/// spawned the tracee, so the worker both forks the child and services all
/// subsequent requests.
pub struct Tracer {
    pid: Pid,
    ops: mpsc::Sender<TraceOp>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Tracer {
    /// Spawn `path` under trace with the given arguments. Returns with the
    /// tracee stopped at its exec handshake; the caller resumes it with
    /// `cont` once setup is done. The tracee gets `SIGKILL` if this process
    /// dies first.
    pub fn spawn(path: &str, args: &[String]) -> Result<Self> {
        let (ops, op_rx) = mpsc::channel::<TraceOp>();
        let (spawn_tx, spawn_rx) = mpsc::channel();

        let spawn_path = path.to_string();
        let args = args.to_vec();
        let worker = thread::Builder::new()
            .name("tracer".into())
            .spawn(move || {
                let mut command = Command::new(&spawn_path);
                command.args(&args);
                unsafe {
                    command.pre_exec(|| {
                        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                            return Err(io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }

                // spawn_ptrace consumes the initial stop before returning.
                match command.spawn_ptrace() {
                    Ok(child) => {
                        let _ = spawn_tx.send(Ok(Pid::from_raw(child.id() as i32)));
                    }
                    Err(e) => {
                        let _ = spawn_tx
                            .send(Err(anyhow!(e).context(format!("spawning {}", spawn_path))));
                        return;
                    }
                }

                for op in op_rx {
                    op();
                }
            })
            .context("spawning the tracer thread")?;

        let pid = spawn_rx
            .recv()
            .map_err(|_| anyhow!("tracer thread died during spawn"))??;

        log::debug!("spawned {} for tracing as {}", path, pid);

        Ok(Self {
            pid,
            ops,
            worker: Some(worker),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Run `op` on the tracer thread and wait for its result.
    fn on_tracer_thread<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Pid) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let pid = self.pid;
        self.ops
            .send(Box::new(move || {
                let _ = tx.send(op(pid));
            }))
            .map_err(|_| anyhow!("tracer thread is gone"))?;
        rx.recv()
            .map_err(|_| anyhow!("tracer thread dropped the request"))?
    }

    /// Block until the tracee changes state.
    pub fn wait(&self) -> Result<WaitStatus> {
        self.on_tracer_thread(|pid| Ok(wait::waitpid(pid, None)?))
    }

    pub fn get_regs(&self) -> Result<libc::user_regs_struct> {
        self.on_tracer_thread(|pid| Ok(ptrace::getregs(pid)?))
    }

    pub fn set_regs(&self, regs: libc::user_regs_struct) -> Result<()> {
        self.on_tracer_thread(move |pid| Ok(ptrace::setregs(pid, regs)?))
    }

    /// Resume the tracee without delivering a signal.
    pub fn cont(&self) -> Result<()> {
        self.on_tracer_thread(|pid| Ok(ptrace::cont(pid, None)?))
    }

    /// Advance the tracee by a single instruction.
    pub fn single_step(&self) -> Result<()> {
        self.on_tracer_thread(|pid| Ok(ptrace::step(pid, None)?))
    }

    pub fn kill(&self) -> Result<()> {
        self.on_tracer_thread(|pid| Ok(signal::kill(pid, Signal::SIGKILL)?))
    }

    /// Read `len` bytes of tracee memory at `addr`.
    pub fn peek(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.on_tracer_thread(move |pid| {
            let mut bytes = vec![0u8; len];
            let remote = uio::RemoteIoVec {
                base: addr as usize,
                len,
            };

            let n = uio::process_vm_readv(
                pid,
                &[uio::IoVec::from_mut_slice(&mut bytes)],
                &[remote],
            )
            .with_context(|| format!("reading {} tracee bytes at {:#x}", len, addr))?;
            if n != len {
                bail!(
                    "short read from tracee memory at {:#x}: {} of {}",
                    addr,
                    n,
                    len
                );
            }

            Ok(bytes)
        })
    }

    /// Write `data` into the tracee at `addr`, preserving the bytes of any
    /// partially covered word. POKEDATA writes whole words and ignores page
    /// protections, which is what lets traps land in read-only text.
    pub fn poke(&self, addr: u64, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.on_tracer_thread(move |pid| {
            let end = addr + data.len() as u64;
            let mut word_addr = addr & !(WORD_SIZE as u64 - 1);

            while word_addr < end {
                let existing = ptrace::read(pid, word_addr as ptrace::AddressType)
                    .with_context(|| format!("reading tracee word at {:#x}", word_addr))?;
                let mut word = (existing as u64).to_ne_bytes();

                for (i, byte) in word.iter_mut().enumerate() {
                    let at = word_addr + i as u64;
                    if at >= addr && at < end {
                        *byte = data[(at - addr) as usize];
                    }
                }

                let word = u64::from_ne_bytes(word);
                unsafe {
                    ptrace::write(
                        pid,
                        word_addr as ptrace::AddressType,
                        word as *mut libc::c_void,
                    )
                    .with_context(|| format!("writing tracee word at {:#x}", word_addr))?;
                }

                word_addr += WORD_SIZE as u64;
            }

            Ok(())
        })
    }

    /// Enumerate the tracee's address-space map.
    pub fn memory_map(&self) -> Result<Vec<MapEntry>> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", self.pid))
            .context("reading the tracee's memory map")?;
        Ok(maps.lines().filter_map(MapEntry::parse).collect())
    }

    /// The first mapping with the executable bit. For the standard
    /// single-executable-segment layout this is the segment carrying
    /// `.text`.
    pub fn first_executable_region(&self) -> Result<MapEntry> {
        self.memory_map()?
            .into_iter()
            .find(MapEntry::is_executable)
            .ok_or_else(|| anyhow!("tracee has no executable mapping"))
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        // Disconnect the op channel so the worker's loop ends.
        let (stand_in, _) = mpsc::channel();
        drop(std::mem::replace(&mut self.ops, stand_in));

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_regs() -> libc::user_regs_struct {
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        regs.rax = 0x9900aabbccddeeff;
        regs.rcx = 0x0000000011112222;
        regs.r8 = 0x1234;
        regs.rip = 0x401000;
        regs
    }

    #[test]
    fn test_register_value() {
        let regs = dummy_regs();

        assert_eq!(
            register_value(&regs, Register::RAX).unwrap(),
            0x9900aabbccddeeff
        );
        assert_eq!(register_value(&regs, Register::RCX).unwrap(), 0x11112222);
        assert_eq!(register_value(&regs, Register::R8).unwrap(), 0x1234);
        assert_eq!(register_value(&regs, Register::RIP).unwrap(), 0x401000);
        assert_eq!(register_value(&regs, Register::RBX).unwrap(), 0);

        // Sub-registers and segments are outside the contract.
        assert!(register_value(&regs, Register::EAX).is_err());
        assert!(register_value(&regs, Register::AX).is_err());
        assert!(register_value(&regs, Register::AL).is_err());
        assert!(register_value(&regs, Register::FS).is_err());
        assert!(register_value(&regs, Register::XMM0).is_err());
    }

    #[test]
    fn test_parse_map_entry() {
        let entry = MapEntry::parse(
            "5630a4a8c000-5630a4a90000 r-xp 00002000 103:02 2623479                    /usr/bin/cat",
        )
        .unwrap();

        assert_eq!(entry.start, 0x5630a4a8c000);
        assert_eq!(entry.end, 0x5630a4a90000);
        assert_eq!(entry.flags, MAP_READ | MAP_EXEC | MAP_PRIVATE);
        assert!(entry.is_executable());
        assert_eq!(entry.offset, 0x2000);
        assert_eq!(entry.device, "103:02");
        assert_eq!(entry.inode, 2623479);
        assert_eq!(entry.name, "/usr/bin/cat");
    }

    #[test]
    fn test_parse_map_entry_pseudo_and_anonymous() {
        let stack =
            MapEntry::parse("7ffc2e8f7000-7ffc2e918000 rw-p 00000000 00:00 0    [stack]").unwrap();
        assert_eq!(stack.flags, MAP_READ | MAP_WRITE | MAP_PRIVATE);
        assert!(!stack.is_executable());
        assert_eq!(stack.name, "[stack]");

        let anon = MapEntry::parse("7f1be9a71000-7f1be9a73000 rw-s 00000000 00:00 0").unwrap();
        assert_eq!(anon.flags, MAP_READ | MAP_WRITE | MAP_SHARED);
        assert_eq!(anon.name, "");
    }

    #[test]
    fn test_parse_map_entry_rejects_garbage() {
        assert!(MapEntry::parse("").is_none());
        assert!(MapEntry::parse("not a maps line").is_none());
        assert!(MapEntry::parse("zzzz-yyyy r-xp 0 103:02 1 /bin/sh").is_none());
    }
}
