//! Remote stack unwinding.
//!
//! Two ways to walk a stopped process's stack:
//!
//! - **libunwind-ptrace** (feature `libunwind`): full DWARF-based unwinding.
//!   Valid only from the thread that traces the target.
//! - **frame pointers**: follow `(fp, fp[+1])` chains reading the target
//!   through a `/proc/<pid>/mem` fd. Needs no tracing relationship at all,
//!   which is what lets the forked helper do the walking.
//!
//! With the feature on, libunwind drives and the frame-pointer walker picks
//! up whatever frames remain when `unw_step` gives up mid-stack.
//!
//! The helper sub-protocol lives here too: `UnwindSetup` in, status plus
//! frame strings out.

pub mod symbols;

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use log::warn;
use thiserror::Error;

use crate::comms::{Comms, CommsError};
use crate::regs::Regs;
use symbols::SymbolsError;

/// Frame budget when the caller does not say otherwise.
pub const DEFAULT_MAX_FRAMES: usize = 200;

/// Where the return address sits relative to the saved frame pointer, in
/// words. PPC stores the LR save doubleword one slot further.
const FP_IP_OFFSET_WORDS: u64 = if cfg!(target_arch = "powerpc64") { 2 } else { 1 };

const WORD: u64 = std::mem::size_of::<u64>() as u64;

#[derive(Debug, Error)]
pub enum UnwindError {
    #[error("opening target memory: {0}")]
    Memory(io::Error),

    #[error("reading target memory at {addr:#x}: {err}")]
    Read { addr: u64, err: io::Error },

    #[error("symbolization: {0}")]
    Symbols(#[from] SymbolsError),

    #[error("comms: {0}")]
    Comms(#[from] CommsError),

    #[error("malformed unwind setup message")]
    MalformedSetup,

    #[cfg(feature = "libunwind")]
    #[error("libunwind: {0}")]
    LibUnwind(&'static str),
}

/// Read-only view of another process's memory through `/proc/<pid>/mem`.
pub struct RemoteMemory {
    mem: File,
}

impl RemoteMemory {
    pub fn open(pid: libc::pid_t) -> Result<Self, UnwindError> {
        File::open(format!("/proc/{pid}/mem"))
            .map(|mem| Self { mem })
            .map_err(UnwindError::Memory)
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            mem: File::from(fd),
        }
    }

    pub fn as_file(&self) -> &File {
        &self.mem
    }

    fn read_word(&self, addr: u64) -> Result<u64, UnwindError> {
        let mut buf = [0u8; 8];
        // SAFETY: buf is valid for 8 bytes; pread64 with an explicit offset
        // leaves the shared file position alone.
        let ret = unsafe {
            libc::pread64(
                self.mem.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                addr as libc::off64_t,
            )
        };
        if ret != buf.len() as isize {
            return Err(UnwindError::Read {
                addr,
                err: io::Error::last_os_error(),
            });
        }
        Ok(u64::from_le_bytes(buf))
    }
}

/// Follows the frame-pointer chain starting at `fp`, up to `max_frames`
/// return addresses.
pub fn unwind_with_frame_pointers(
    mem: &RemoteMemory,
    mut fp: u64,
    max_frames: usize,
) -> Result<Vec<u64>, UnwindError> {
    let mut ips = Vec::new();
    while fp != 0 && ips.len() < max_frames {
        ips.push(mem.read_word(fp + FP_IP_OFFSET_WORDS * WORD)?);
        fp = mem.read_word(fp)?;
    }
    Ok(ips)
}

/// Produces the instruction pointers of the target's stack, newest first.
///
/// `max_frames == 0` is not an error: the walk just has nothing to do.
pub fn run_unwind(
    pid: libc::pid_t,
    regs: &Regs,
    mem: &RemoteMemory,
    max_frames: usize,
) -> Result<Vec<u64>, UnwindError> {
    if max_frames == 0 {
        return Ok(Vec::new());
    }

    #[cfg(feature = "libunwind")]
    {
        match libunwind_unwind(pid, mem, max_frames) {
            Ok(ips) if !ips.is_empty() => return Ok(ips),
            Ok(_) => warn!("libunwind produced no frames, falling back to frame pointers"),
            Err(err) => warn!("libunwind failed ({err}), falling back to frame pointers"),
        }
    }
    #[cfg(not(feature = "libunwind"))]
    let _ = pid;

    let mut ips = vec![regs.instruction_pointer()];
    if ips.len() < max_frames {
        match unwind_with_frame_pointers(mem, regs.frame_pointer(), max_frames - ips.len()) {
            Ok(rest) => ips.extend(rest),
            // A truncated walk is still a stack trace.
            Err(err) => warn!("frame pointer walk stopped early: {err}"),
        }
    }
    Ok(ips)
}

/// DWARF unwinding via libunwind-ptrace. The calling thread must be the
/// target's tracer. Falls back to frame pointers for the remaining budget
/// when `unw_step` fails mid-stack.
#[cfg(feature = "libunwind")]
fn libunwind_unwind(
    pid: libc::pid_t,
    mem: &RemoteMemory,
    max_frames: usize,
) -> Result<Vec<u64>, UnwindError> {
    use std::sync::OnceLock;
    use tracebox_sys::unwind as uw;

    static ADDR_SPACE: OnceLock<usize> = OnceLock::new();
    // SAFETY: creating the shared address space once; libunwind allows
    // concurrent cursors over one address space.
    let addr_space = *ADDR_SPACE.get_or_init(|| unsafe {
        uw::unw_create_addr_space(&uw::_UPT_accessors, 0) as usize
    }) as uw::unw_addr_space_t;
    if addr_space.is_null() {
        return Err(UnwindError::LibUnwind("unw_create_addr_space() failed"));
    }

    // SAFETY: context is destroyed on every exit path below.
    let context = unsafe { uw::_UPT_create(pid) };
    if context.is_null() {
        return Err(UnwindError::LibUnwind("_UPT_create() failed"));
    }

    let result = (|| {
        let mut cursor = uw::unw_cursor_t::zeroed();
        // SAFETY: cursor/context/addr_space are all live.
        if unsafe { uw::unw_init_remote(&mut cursor, addr_space, context) } < 0 {
            return Err(UnwindError::LibUnwind("unw_init_remote() failed"));
        }

        let mut ips = Vec::new();
        for _ in 0..max_frames {
            let mut ip: uw::unw_word_t = 0;
            let mut fp: uw::unw_word_t = 0;
            // SAFETY: cursor is initialized.
            if unsafe { uw::unw_get_reg(&mut cursor, uw::UNW_REG_IP, &mut ip) } < 0 {
                break;
            }
            // SAFETY: same.
            unsafe { uw::unw_get_reg(&mut cursor, uw::UNW_FP_REG, &mut fp) };
            ips.push(ip as u64);

            // SAFETY: same.
            let rc = unsafe { uw::unw_step(&mut cursor) };
            if rc <= 0 {
                if fp != 0 {
                    match unwind_with_frame_pointers(mem, fp as u64, max_frames - ips.len()) {
                        Ok(rest) => ips.extend(rest),
                        Err(err) => warn!("frame pointer fallback failed: {err}"),
                    }
                }
                break;
            }
        }
        Ok(ips)
    })();

    // SAFETY: context came from _UPT_create above.
    unsafe { uw::_UPT_destroy(context) };
    result
}

/// Renders instruction pointers as `symbol(0xIP)` strings.
pub fn symbolize_stacktrace(
    pid: libc::pid_t,
    ips: &[u64],
) -> Result<Vec<String>, UnwindError> {
    let map = symbols::load_symbols_map(pid)?;
    Ok(ips
        .iter()
        .map(|&ip| format!("{}({ip:#x})", symbols::symbol_at(&map, ip)))
        .collect())
}

pub fn run_unwind_and_symbolize(
    pid: libc::pid_t,
    regs: &Regs,
    mem: &RemoteMemory,
    max_frames: usize,
) -> Result<Vec<String>, UnwindError> {
    let ips = run_unwind(pid, regs, mem, max_frames)?;
    symbolize_stacktrace(pid, &ips)
}

/// The request the monitor ships to the unwinder helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindSetup {
    pub pid: libc::pid_t,
    pub max_frames: u32,
    pub regs_bytes: Vec<u8>,
}

impl UnwindSetup {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.regs_bytes.len());
        bytes.extend_from_slice(&self.pid.to_le_bytes());
        bytes.extend_from_slice(&self.max_frames.to_le_bytes());
        bytes.extend_from_slice(&self.regs_bytes);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<UnwindSetup, UnwindError> {
        if bytes.len() < 8 {
            return Err(UnwindError::MalformedSetup);
        }
        Ok(UnwindSetup {
            pid: libc::pid_t::from_le_bytes(bytes[..4].try_into().unwrap()),
            max_frames: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            regs_bytes: bytes[8..].to_vec(),
        })
    }
}

/// Helper-side service loop: one request, one response, done. Returns false
/// when the conversation broke down before a response could be sent.
pub fn serve_unwind_request(comms: &mut Comms) -> bool {
    let setup = match comms.recv_bytes().map_err(UnwindError::from).and_then(|b| {
        UnwindSetup::decode(&b)
    }) {
        Ok(setup) => setup,
        Err(_) => return false,
    };
    let mem_fd = match comms.recv_fd() {
        Ok(fd) => fd,
        Err(_) => return false,
    };

    let outcome = (|| {
        let regs =
            Regs::from_bytes(setup.pid, &setup.regs_bytes).ok_or(UnwindError::MalformedSetup)?;
        let mem = RemoteMemory::from_fd(mem_fd);
        run_unwind_and_symbolize(setup.pid, &regs, &mem, setup.max_frames as usize)
    })();

    match outcome {
        Ok(frames) => {
            if comms.send_status(Ok(())).is_err() {
                return false;
            }
            comms.send_strings(&frames).is_ok()
        }
        Err(err) => {
            let _ = comms.send_status(Err(&err.to_string()));
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_round_trip() {
        let setup = UnwindSetup {
            pid: 4321,
            max_frames: 128,
            regs_bytes: vec![1, 2, 3, 4],
        };
        assert_eq!(UnwindSetup::decode(&setup.encode()).unwrap(), setup);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(UnwindSetup::decode(&[0; 7]).is_err());
    }

    #[test]
    fn zero_max_frames_is_empty_not_error() {
        let mem = RemoteMemory::open(std::process::id() as libc::pid_t).unwrap();
        let regs = Regs::new(std::process::id() as libc::pid_t);
        let ips = run_unwind(regs.pid(), &regs, &mem, 0).unwrap();
        assert!(ips.is_empty());
    }

    #[test]
    fn reads_own_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let mem = RemoteMemory::open(std::process::id() as libc::pid_t).unwrap();
        let read = mem.read_word(&value as *const u64 as u64).unwrap();
        assert_eq!(read, value);
    }

    #[test]
    fn frame_pointer_walk_on_synthetic_frames() {
        // Two fake frames laid out in our own memory:
        // frame2 <- frame1, each [saved_fp, return_ip].
        let frame2: [u64; 2] = [0, 0xcccc];
        let frame1: [u64; 2] = [frame2.as_ptr() as u64, 0xbbbb];

        let mem = RemoteMemory::open(std::process::id() as libc::pid_t).unwrap();
        let ips =
            unwind_with_frame_pointers(&mem, frame1.as_ptr() as u64, DEFAULT_MAX_FRAMES).unwrap();
        assert_eq!(ips, vec![0xbbbb, 0xcccc]);
    }

    #[test]
    fn frame_budget_respected() {
        let frame2: [u64; 2] = [0, 0xcccc];
        let frame1: [u64; 2] = [frame2.as_ptr() as u64, 0xbbbb];
        let mem = RemoteMemory::open(std::process::id() as libc::pid_t).unwrap();
        let ips = unwind_with_frame_pointers(&mem, frame1.as_ptr() as u64, 1).unwrap();
        assert_eq!(ips, vec![0xbbbb]);
    }
}
