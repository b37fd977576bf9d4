//! The rendezvous channel between monitor and sandboxee.
//!
//! A `Comms` is one end of an `AF_UNIX` socketpair carrying tagged,
//! length-prefixed messages plus SCM_RIGHTS file descriptors. The channel is
//! buffered, which the attach protocol relies on: the monitor can post the
//! client-done token even while the sandboxee is sitting in a ptrace stop.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use thiserror::Error;

/// Sent by the client once its seccomp filter is installed.
pub const CLIENT_READY: u32 = 0x0A0B_0C01;
/// Sent by the monitor once the whole tree is seized.
pub const CLIENT_DONE: u32 = 0x0A0B_0C02;

const TAG_U32: u32 = 1;
const TAG_BYTES: u32 = 2;
const TAG_STATUS_OK: u32 = 3;
const TAG_STATUS_ERR: u32 = 4;

/// Upper bound on a single message; /proc maps of large processes fit with
/// room to spare.
const MAX_MSG_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the channel")]
    Eof,

    #[error("protocol: expected tag {expected}, got {got}")]
    UnexpectedTag { expected: u32, got: u32 },

    #[error("protocol: message of {0} bytes exceeds limit")]
    TooLarge(u32),

    #[error("protocol: malformed payload for tag {0}")]
    Malformed(u32),

    #[error("no file descriptor attached to message")]
    NoFd,
}

pub type Result<T> = std::result::Result<T, CommsError>;

#[derive(Debug)]
pub struct Comms {
    fd: OwnedFd,
}

impl Comms {
    /// A connected pair; by convention the first end stays with the monitor.
    pub fn socketpair() -> io::Result<(Comms, Comms)> {
        let mut fds = [0i32; 2];
        // SAFETY: fds is written by the kernel on success.
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both fds are freshly created and owned here.
        Ok(unsafe {
            (
                Comms {
                    fd: OwnedFd::from_raw_fd(fds[0]),
                },
                Comms {
                    fd: OwnedFd::from_raw_fd(fds[1]),
                },
            )
        })
    }

    pub fn from_owned_fd(fd: OwnedFd) -> Comms {
        Comms { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            // SAFETY: buf is valid for buf.len() bytes.
            let ret = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    buf.as_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            buf = &buf[ret as usize..];
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            // SAFETY: the slice is valid for writes of its remaining length.
            let ret = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf[filled..].as_mut_ptr().cast::<libc::c_void>(),
                    buf.len() - filled,
                )
            };
            match ret {
                0 => return Err(CommsError::Eof),
                r if r < 0 => {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err.into());
                }
                r => filled += r as usize,
            }
        }
        Ok(())
    }

    fn send_msg(&mut self, tag: u32, payload: &[u8]) -> Result<()> {
        let len = payload.len() as u32;
        if len > MAX_MSG_LEN {
            return Err(CommsError::TooLarge(len));
        }
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&tag.to_le_bytes());
        header[4..].copy_from_slice(&len.to_le_bytes());
        self.write_all(&header)?;
        self.write_all(payload)
    }

    fn recv_msg(&mut self) -> Result<(u32, Vec<u8>)> {
        let mut header = [0u8; 8];
        self.read_exact(&mut header)?;
        let tag = u32::from_le_bytes(header[..4].try_into().unwrap());
        let len = u32::from_le_bytes(header[4..].try_into().unwrap());
        if len > MAX_MSG_LEN {
            return Err(CommsError::TooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        self.read_exact(&mut payload)?;
        Ok((tag, payload))
    }

    fn expect_msg(&mut self, expected: u32) -> Result<Vec<u8>> {
        let (tag, payload) = self.recv_msg()?;
        if tag != expected {
            return Err(CommsError::UnexpectedTag { expected, got: tag });
        }
        Ok(payload)
    }

    pub fn send_u32(&mut self, value: u32) -> Result<()> {
        self.send_msg(TAG_U32, &value.to_le_bytes())
    }

    pub fn recv_u32(&mut self) -> Result<u32> {
        let payload = self.expect_msg(TAG_U32)?;
        payload
            .as_slice()
            .try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| CommsError::Malformed(TAG_U32))
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.send_msg(TAG_BYTES, bytes)
    }

    pub fn recv_bytes(&mut self) -> Result<Vec<u8>> {
        self.expect_msg(TAG_BYTES)
    }

    pub fn send_str(&mut self, s: &str) -> Result<()> {
        self.send_bytes(s.as_bytes())
    }

    pub fn recv_str(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.recv_bytes()?).into_owned())
    }

    pub fn send_strings(&mut self, strings: &[String]) -> Result<()> {
        self.send_u32(strings.len() as u32)?;
        for s in strings {
            self.send_str(s)?;
        }
        Ok(())
    }

    pub fn recv_strings(&mut self) -> Result<Vec<String>> {
        let count = self.recv_u32()?;
        let mut strings = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            strings.push(self.recv_str()?);
        }
        Ok(strings)
    }

    /// Ships a `Result<(), String>`-shaped status.
    pub fn send_status(&mut self, status: std::result::Result<(), &str>) -> Result<()> {
        match status {
            Ok(()) => self.send_msg(TAG_STATUS_OK, &[]),
            Err(msg) => self.send_msg(TAG_STATUS_ERR, msg.as_bytes()),
        }
    }

    pub fn recv_status(&mut self) -> Result<std::result::Result<(), String>> {
        let (tag, payload) = self.recv_msg()?;
        match tag {
            TAG_STATUS_OK => Ok(Ok(())),
            TAG_STATUS_ERR => Ok(Err(String::from_utf8_lossy(&payload).into_owned())),
            got => Err(CommsError::UnexpectedTag {
                expected: TAG_STATUS_OK,
                got,
            }),
        }
    }

    /// Sends a file descriptor with SCM_RIGHTS.
    pub fn send_fd(&mut self, fd: RawFd) -> Result<()> {
        let data = [0u8; 1];
        let iov = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: 1,
        };

        let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        // SAFETY: msg points at live iov/cmsg buffers for the sendmsg call.
        unsafe {
            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_iov = &iov as *const _ as *mut _;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = cmsg_space;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as usize;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);

            if libc::sendmsg(self.fd.as_raw_fd(), &msg, 0) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Receives a file descriptor sent with [`Comms::send_fd`].
    pub fn recv_fd(&mut self) -> Result<OwnedFd> {
        let mut data = [0u8; 1];
        let iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: 1,
        };

        let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        // SAFETY: same lifetime argument as send_fd.
        unsafe {
            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_iov = &iov as *const _ as *mut _;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = cmsg_space;

            let ret = libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0);
            if ret < 0 {
                return Err(io::Error::last_os_error().into());
            }
            if ret == 0 {
                return Err(CommsError::Eof);
            }

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null()
                || (*cmsg).cmsg_level != libc::SOL_SOCKET
                || (*cmsg).cmsg_type != libc::SCM_RIGHTS
            {
                return Err(CommsError::NoFd);
            }
            let fd = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
            Ok(OwnedFd::from_raw_fd(fd))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};

    #[test]
    fn u32_round_trip() {
        let (mut a, mut b) = Comms::socketpair().unwrap();
        a.send_u32(CLIENT_READY).unwrap();
        assert_eq!(b.recv_u32().unwrap(), CLIENT_READY);
    }

    #[test]
    fn strings_round_trip() {
        let (mut a, mut b) = Comms::socketpair().unwrap();
        let frames = vec!["main+0x10(0x401000)".to_string(), "_start(0x400800)".to_string()];
        a.send_strings(&frames).unwrap();
        assert_eq!(b.recv_strings().unwrap(), frames);
    }

    #[test]
    fn status_round_trip() {
        let (mut a, mut b) = Comms::socketpair().unwrap();
        a.send_status(Ok(())).unwrap();
        assert_eq!(b.recv_status().unwrap(), Ok(()));
        a.send_status(Err("unwind failed")).unwrap();
        assert_eq!(b.recv_status().unwrap(), Err("unwind failed".to_string()));
    }

    #[test]
    fn eof_is_reported() {
        let (mut a, b) = Comms::socketpair().unwrap();
        drop(b);
        assert!(matches!(a.recv_u32(), Err(CommsError::Eof) | Err(CommsError::Io(_))));
    }

    #[test]
    fn fd_passing_transfers_open_file() {
        let (mut a, mut b) = Comms::socketpair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"over the wall").unwrap();
        file.flush().unwrap();

        a.send_fd(std::os::fd::AsRawFd::as_raw_fd(&file)).unwrap();
        let received = b.recv_fd().unwrap();

        let mut clone = std::fs::File::from(received);
        clone.seek(std::io::SeekFrom::Start(0)).unwrap();
        let mut content = String::new();
        clone.read_to_string(&mut content).unwrap();
        assert_eq!(content, "over the wall");
    }
}
