//! Master↔worker command channel.
//!
//! Each worker shares a socketpair with the master. Messages are
//! fixed-size records; when a descriptor rides along (a new sibling's
//! channel end) it travels as `SCM_RIGHTS` ancillary data. Workers learn
//! about each other through `OpenChannel`, so worker-to-worker messages
//! need not bounce through the master.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bytes::{Buf, BufMut};

pub const MSG_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    OpenChannel,
    CloseChannel,
    Quit,
    Terminate,
    Reopen,
}

impl Command {
    fn to_u32(self) -> u32 {
        match self {
            Command::OpenChannel => 1,
            Command::CloseChannel => 2,
            Command::Quit => 3,
            Command::Terminate => 4,
            Command::Reopen => 5,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Command::OpenChannel),
            2 => Some(Command::CloseChannel),
            3 => Some(Command::Quit),
            4 => Some(Command::Terminate),
            5 => Some(Command::Reopen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMsg {
    pub command: Command,
    pub pid: i32,
    /// Process-table slot the message is about (OpenChannel/CloseChannel).
    pub slot: u32,
}

/// One end of a master↔worker socketpair.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Nonblocking, close-on-exec socketpair.
    pub fn pair() -> io::Result<(Channel, Channel)> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            Ok((
                Channel {
                    fd: OwnedFd::from_raw_fd(fds[0]),
                },
                Channel {
                    fd: OwnedFd::from_raw_fd(fds[1]),
                },
            ))
        }
    }

    pub fn from_fd(fd: OwnedFd) -> Channel {
        Channel { fd }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Send a record, optionally passing a descriptor.
    pub fn send(&self, msg: ChannelMsg, fd: Option<RawFd>) -> io::Result<()> {
        let mut body = [0u8; MSG_SIZE];
        {
            let mut w = &mut body[..];
            w.put_u32_le(msg.command.to_u32());
            w.put_i32_le(msg.pid);
            w.put_u32_le(msg.slot);
            w.put_u32_le(fd.is_some() as u32);
        }

        unsafe {
            let mut iov = libc::iovec {
                iov_base: body.as_mut_ptr() as *mut libc::c_void,
                iov_len: MSG_SIZE,
            };
            let mut hdr: libc::msghdr = std::mem::zeroed();
            hdr.msg_iov = &mut iov;
            hdr.msg_iovlen = 1;

            #[repr(align(8))]
            struct CmsgBuf([u8; 64]);
            let mut cbuf = CmsgBuf([0u8; 64]);
            if let Some(pass) = fd {
                hdr.msg_control = cbuf.0.as_mut_ptr() as *mut libc::c_void;
                hdr.msg_controllen = libc::CMSG_SPACE(4) as usize;
                let cmsg = libc::CMSG_FIRSTHDR(&hdr);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(4) as usize;
                std::ptr::copy_nonoverlapping(
                    &pass as *const RawFd as *const u8,
                    libc::CMSG_DATA(cmsg),
                    4,
                );
            }

            let n = libc::sendmsg(self.fd.as_raw_fd(), &hdr, 0);
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n as usize != MSG_SIZE {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short channel write"));
            }
        }
        Ok(())
    }

    /// Receive one record; a passed descriptor is returned owned. EOF
    /// (the peer is gone) surfaces as `UnexpectedEof`.
    pub fn recv(&self) -> io::Result<(ChannelMsg, Option<OwnedFd>)> {
        let mut body = [0u8; MSG_SIZE];
        #[repr(align(8))]
        struct CmsgBuf([u8; 64]);
        let mut cbuf = CmsgBuf([0u8; 64]);

        let (n, passed) = unsafe {
            let mut iov = libc::iovec {
                iov_base: body.as_mut_ptr() as *mut libc::c_void,
                iov_len: MSG_SIZE,
            };
            let mut hdr: libc::msghdr = std::mem::zeroed();
            hdr.msg_iov = &mut iov;
            hdr.msg_iovlen = 1;
            hdr.msg_control = cbuf.0.as_mut_ptr() as *mut libc::c_void;
            hdr.msg_controllen = cbuf.0.len();

            let n = libc::recvmsg(self.fd.as_raw_fd(), &mut hdr, 0);
            if n < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut passed = None;
            let mut cmsg = libc::CMSG_FIRSTHDR(&hdr);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let mut fd: RawFd = -1;
                    std::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsg),
                        &mut fd as *mut RawFd as *mut u8,
                        4,
                    );
                    if fd >= 0 {
                        passed = Some(OwnedFd::from_raw_fd(fd));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
            }
            (n as usize, passed)
        };

        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "channel closed"));
        }
        if n != MSG_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "short channel read"));
        }

        let mut r = &body[..];
        let command = Command::from_u32(r.get_u32_le())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown channel command"))?;
        let pid = r.get_i32_le();
        let slot = r.get_u32_le();
        let has_fd = r.get_u32_le() != 0;

        let passed = if has_fd { passed } else { None };
        Ok((ChannelMsg { command, pid, slot }, passed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_roundtrip_without_fd() {
        let (a, b) = Channel::pair().expect("pair");
        let msg = ChannelMsg {
            command: Command::Quit,
            pid: 1234,
            slot: 7,
        };
        a.send(msg, None).expect("send");
        let (got, fd) = b.recv().expect("recv");
        assert_eq!(got, msg);
        assert!(fd.is_none());
    }

    #[test]
    fn test_empty_channel_would_block() {
        let (_a, b) = Channel::pair().expect("pair");
        let err = b.recv().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_closed_peer_reports_eof() {
        let (a, b) = Channel::pair().expect("pair");
        drop(a);
        let err = b.recv().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_descriptor_passing() {
        let (a, b) = Channel::pair().expect("pair");

        // Pass the write end of a pipe across the channel.
        let mut pipefds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(pipefds.as_mut_ptr()) }, 0);
        let msg = ChannelMsg {
            command: Command::OpenChannel,
            pid: 42,
            slot: 1,
        };
        a.send(msg, Some(pipefds[1])).expect("send");
        unsafe {
            libc::close(pipefds[1]);
        }

        let (got, passed) = b.recv().expect("recv");
        assert_eq!(got.command, Command::OpenChannel);
        let passed = passed.expect("descriptor arrived");

        // The received descriptor reaches the same pipe.
        let mut w = std::fs::File::from(passed);
        w.write_all(b"ping").expect("write");
        drop(w);
        let mut r = unsafe { std::fs::File::from_raw_fd(pipefds[0]) };
        let mut out = String::new();
        r.read_to_string(&mut out).expect("read");
        assert_eq!(out, "ping");
    }
}
