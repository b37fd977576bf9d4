//! The sandboxee side of the rendezvous.
//!
//! Runs in the forked child between `fork()` and `execve()`:
//!
//! 1. Receive the compiled policy over comms
//! 2. `PR_SET_DUMPABLE` + `PR_SET_PTRACER` (Yama) + `PR_SET_NO_NEW_PRIVS`
//! 3. Signal readiness, wait for the monitor to finish attaching
//! 4. Install the seccomp filter (TSYNC covers any early threads)
//! 5. `execve` the target
//!
//! The filter is installed only after the monitor's done-token: limits and
//! ptrace want to arrive at the last moment, and installing earlier would
//! have the filter tracing the rendezvous itself with no tracer attached.

use std::ffi::CString;
use std::path::PathBuf;

use thiserror::Error;
use tracebox_sys::last_errno;
use tracebox_sys::seccomp::{SockFilter, SockFprog, seccomp_set_mode_filter_tsync};

use crate::comms::{self, Comms, CommsError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("comms: {0}")]
    Comms(#[from] CommsError),

    #[error("unexpected rendezvous token {0:#x}")]
    BadToken(u32),

    #[error("policy bytes are not a filter program")]
    MalformedPolicy,

    #[error("prctl: {0}")]
    Prctl(rustix::io::Errno),

    #[error("seccomp: {0}")]
    Seccomp(rustix::io::Errno),

    #[error("path contains NUL byte")]
    BadPath,

    #[error("chdir: {0}")]
    Chdir(rustix::io::Errno),

    #[error("execve: {0}")]
    Exec(rustix::io::Errno),
}

/// Everything the child needs, gathered before the fork so the child does
/// not read executor state.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

/// Runs the rendezvous and execs. Only returns on error.
pub fn run(mut comms: Comms, spec: &ClientSpec) -> ClientError {
    match run_inner(&mut comms, spec) {
        Ok(never) => match never {},
        Err(err) => err,
    }
}

enum Never {}

fn run_inner(comms: &mut Comms, spec: &ClientSpec) -> Result<Never, ClientError> {
    let filter = decode_filter(&comms.recv_bytes()?)?;

    prepare_tracing()?;

    // Everything execve needs is allocated before the filter goes in;
    // after installation every unlisted syscall stops for the tracer.
    let path = cstring(spec.path.to_string_lossy().as_bytes())?;
    let mut argv = vec![path.clone()];
    for arg in &spec.args {
        argv.push(cstring(arg.as_bytes())?);
    }
    let envp: Vec<CString> = spec
        .env
        .iter()
        .map(|(k, v)| cstring(format!("{k}={v}").as_bytes()))
        .collect::<Result<_, _>>()?;
    let cwd = spec
        .cwd
        .as_ref()
        .map(|p| cstring(p.to_string_lossy().as_bytes()))
        .transpose()?;

    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp_ptrs: Vec<*const libc::c_char> = envp
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    if let Some(dir) = &cwd {
        // SAFETY: dir is a valid NUL-terminated path.
        if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
            return Err(ClientError::Chdir(last_errno()));
        }
    }

    comms.send_u32(comms::CLIENT_READY)?;
    let token = comms.recv_u32()?;
    if token != comms::CLIENT_DONE {
        return Err(ClientError::BadToken(token));
    }

    let fprog = SockFprog {
        len: filter.len() as u16,
        filter: filter.as_ptr(),
    };
    // SAFETY: fprog points at a live, well-formed program.
    unsafe { seccomp_set_mode_filter_tsync(&fprog) }.map_err(ClientError::Seccomp)?;

    // SAFETY: the pointer arrays are NULL-terminated and outlive the call.
    unsafe { libc::execve(path.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) };
    Err(ClientError::Exec(last_errno()))
}

fn prepare_tracing() -> Result<(), ClientError> {
    // SAFETY: plain prctl calls with integer arguments.
    unsafe {
        if libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0) != 0 {
            return Err(ClientError::Prctl(last_errno()));
        }
        // Yama may not be present; the capability check already verified the
        // scope is permissive enough, so a failure here is not fatal.
        libc::prctl(libc::PR_SET_PTRACER, libc::getppid(), 0, 0, 0);
    }
    Ok(())
}

fn cstring(bytes: &[u8]) -> Result<CString, ClientError> {
    CString::new(bytes).map_err(|_| ClientError::BadPath)
}

/// Rebuilds the filter program from the raw bytes the monitor sent.
pub fn decode_filter(bytes: &[u8]) -> Result<Vec<SockFilter>, ClientError> {
    if bytes.is_empty() || bytes.len() % std::mem::size_of::<SockFilter>() != 0 {
        return Err(ClientError::MalformedPolicy);
    }
    Ok(bytes
        .chunks_exact(std::mem::size_of::<SockFilter>())
        .map(|chunk| SockFilter {
            code: u16::from_le_bytes([chunk[0], chunk[1]]),
            jt: chunk[2],
            jf: chunk[3],
            k: u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
        })
        .collect())
}

/// Serializes a filter program for the wire.
pub fn encode_filter(filter: &[SockFilter]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(filter.len() * std::mem::size_of::<SockFilter>());
    for insn in filter {
        bytes.extend_from_slice(&insn.code.to_le_bytes());
        bytes.push(insn.jt);
        bytes.push(insn.jf);
        bytes.extend_from_slice(&insn.k.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_wire_round_trip() {
        let filter = vec![
            SockFilter::stmt(0x06, 0x7fff_0000),
            SockFilter::jump(0x15, 42, 1, 0),
        ];
        let decoded = decode_filter(&encode_filter(&filter)).unwrap();
        assert_eq!(decoded, filter);
    }

    #[test]
    fn rejects_truncated_filter() {
        assert!(decode_filter(&[1, 2, 3]).is_err());
        assert!(decode_filter(&[]).is_err());
    }
}
