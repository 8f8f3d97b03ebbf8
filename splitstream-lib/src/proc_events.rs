//! Process lifecycle events from the kernel's process-connector channel.
//!
//! A `PF_NETLINK`/`NETLINK_CONNECTOR` datagram socket is subscribed to the
//! `CN_IDX_PROC` multicast group; the kernel then delivers one connector
//! message per fork/exec/exit. The engine cares about exec and exit only.
//!
//! The wire format is the kernel ABI: a netlink header followed, with no
//! padding inside the payload, by a connector header and the event body,
//! the whole message aligned to `NLMSG_ALIGNTO`. The connector payload
//! places the event struct at a 4-byte boundary, so its 64-bit timestamp
//! is not naturally aligned; messages are therefore built and parsed by
//! explicit byte copies at fixed offsets, never by casting to a struct.

use thiserror::Error;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::procfs::Pid;

const NLMSG_DONE: u16 = 0x3;

const CN_IDX_PROC: u32 = 0x1;
const CN_VAL_PROC: u32 = 0x1;

const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_CN_MCAST_IGNORE: u32 = 2;

const PROC_EVENT_NONE: u32 = 0x0000_0000;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

/// Fixed offsets inside a connector datagram.
///
/// nlmsghdr is 16 bytes, cn_msg 20; the proc_event body follows directly.
/// Within the body: `what` at +0, cpu at +4, the 64-bit timestamp at +8,
/// and the event union (whose first field is always the subject PID) at
/// +16.
const NLMSG_HDR_LEN: usize = 16;
const CN_MSG_LEN: usize = 20;
const EVENT_OFFSET: usize = NLMSG_HDR_LEN + CN_MSG_LEN;
const EVENT_WHAT_OFFSET: usize = EVENT_OFFSET;
const EVENT_PID_OFFSET: usize = EVENT_OFFSET + 16;

/// Subscription request: nlmsghdr + cn_msg + the 32-bit multicast op.
const MCAST_OP_MSG_LEN: usize = EVENT_OFFSET + 4;

const RECV_BUF_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open netlink connector socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to bind netlink connector socket: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to send multicast subscription: {0}")]
    Subscribe(#[source] io::Error),
}

/// One decoded process-connector message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcEvent {
    /// Subscription acknowledgement (`PROC_EVENT_NONE`).
    Ack,
    Exec(Pid),
    Exit(Pid),
    /// Any event code the engine does not act on.
    Other,
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// Assemble a `proc_cn_mcast_op` request for `op`.
fn mcast_op_message(pid: u32, op: u32) -> [u8; MCAST_OP_MSG_LEN] {
    let mut buf = [0u8; MCAST_OP_MSG_LEN];
    // nlmsghdr: len, type, flags, seq, pid
    put_u32(&mut buf, 0, MCAST_OP_MSG_LEN as u32);
    put_u16(&mut buf, 4, NLMSG_DONE);
    put_u16(&mut buf, 6, 0);
    put_u32(&mut buf, 8, 0);
    put_u32(&mut buf, 12, pid);
    // cn_msg: id.idx, id.val, seq, ack, len, flags
    put_u32(&mut buf, 16, CN_IDX_PROC);
    put_u32(&mut buf, 20, CN_VAL_PROC);
    put_u32(&mut buf, 24, 0);
    put_u32(&mut buf, 28, 0);
    put_u16(&mut buf, 32, 4);
    put_u16(&mut buf, 34, 0);
    // proc_cn_mcast_op
    put_u32(&mut buf, 36, op);
    buf
}

/// Decode a single datagram. `None` means the message is not a
/// well-formed proc-connector event and must be skipped silently.
fn parse_event(buf: &[u8]) -> Option<ProcEvent> {
    if buf.len() < EVENT_PID_OFFSET + 4 {
        return None;
    }
    let nlmsg_len = read_u32(buf, 0) as usize;
    let nlmsg_type = read_u16(buf, 4);
    if nlmsg_type != NLMSG_DONE || nlmsg_len > buf.len() {
        return None;
    }
    if read_u32(buf, 16) != CN_IDX_PROC || read_u32(buf, 20) != CN_VAL_PROC {
        return None;
    }

    let what = read_u32(buf, EVENT_WHAT_OFFSET);
    let pid = read_u32(buf, EVENT_PID_OFFSET) as Pid;
    Some(match what {
        PROC_EVENT_NONE => ProcEvent::Ack,
        PROC_EVENT_EXEC => ProcEvent::Exec(pid),
        PROC_EVENT_EXIT => ProcEvent::Exit(pid),
        _ => ProcEvent::Other,
    })
}

/// Subscribed, non-blocking process-connector socket.
///
/// Close-on-exec is set at creation: the daemon spawns child processes
/// that must not inherit the descriptor.
#[derive(Debug)]
pub struct ProcEventSocket {
    fd: OwnedFd,
}

impl ProcEventSocket {
    /// Open, bind and subscribe. Any failure leaves no kernel state
    /// behind; the descriptor is closed on drop.
    pub fn open_subscribed() -> Result<Self, Error> {
        let raw = unsafe {
            libc::socket(
                libc::PF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_CONNECTOR,
            )
        };
        if raw < 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }
        let socket = Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = unsafe { libc::getpid() } as u32;
        addr.nl_groups = CN_IDX_PROC;
        let rc = unsafe {
            libc::bind(
                socket.fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Bind(io::Error::last_os_error()));
        }

        socket.send_mcast_op(PROC_CN_MCAST_LISTEN).map_err(Error::Subscribe)?;
        Ok(socket)
    }

    fn send_mcast_op(&self, op: u32) -> io::Result<()> {
        let msg = mcast_op_message(unsafe { libc::getpid() } as u32, op);
        let rc = unsafe { libc::send(self.fd.as_raw_fd(), msg.as_ptr().cast(), msg.len(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Tell the kernel to stop multicasting to us. Called on teardown,
    /// before the descriptor is closed.
    pub fn unsubscribe(&self) -> io::Result<()> {
        self.send_mcast_op(PROC_CN_MCAST_IGNORE)
    }

    /// Receive and decode exactly one datagram. `WouldBlock` passes
    /// through so the caller can park on readiness again.
    pub fn recv_event(&self) -> io::Result<Option<ProcEvent>> {
        let mut buf = [0u8; RECV_BUF_LEN];
        let rc = unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(parse_event(&buf[..rc as usize]))
    }
}

impl AsRawFd for ProcEventSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Drive the socket on the runtime, forwarding exec/exit events into
/// `events` until cancelled. The task unsubscribes and closes the socket
/// on its way out.
///
/// One message is consumed per readiness notification; the kernel may
/// drop events under pressure, which the reconciler's periodic `/proc`
/// scan compensates for.
pub fn spawn_listener(
    socket: ProcEventSocket,
    events: mpsc::Sender<ProcEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let fd = match AsyncFd::with_interest(socket, Interest::READABLE) {
            Ok(fd) => fd,
            Err(error) => {
                tracing::error!(%error, "failed to register process event socket");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                guard = fd.readable() => {
                    let mut guard = match guard {
                        Ok(guard) => guard,
                        Err(error) => {
                            tracing::error!(%error, "process event socket poll failed");
                            break;
                        }
                    };
                    match fd.get_ref().recv_event() {
                        Ok(Some(ProcEvent::Ack)) => {
                            tracing::debug!("process event subscription acknowledged");
                        }
                        Ok(Some(event @ (ProcEvent::Exec(_) | ProcEvent::Exit(_)))) => {
                            if events.send(event).await.is_err() {
                                tracing::warn!("process event receiver closed");
                                break;
                            }
                        }
                        Ok(Some(ProcEvent::Other)) | Ok(None) => {}
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                            guard.clear_ready();
                        }
                        Err(error) => {
                            // transient receive errors (e.g. ENOBUFS on
                            // overflow) are survivable; keep listening
                            tracing::warn!(%error, "process event receive failed");
                        }
                    }
                }
            }
        }

        if let Err(error) = fd.get_ref().unsubscribe() {
            tracing::debug!(%error, "failed to unsubscribe from process events");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_message(what: u32, pid: Pid) -> Vec<u8> {
        let len = EVENT_PID_OFFSET + 8;
        let mut buf = vec![0u8; len];
        put_u32(&mut buf, 0, len as u32);
        put_u16(&mut buf, 4, NLMSG_DONE);
        put_u32(&mut buf, 16, CN_IDX_PROC);
        put_u32(&mut buf, 20, CN_VAL_PROC);
        put_u16(&mut buf, 32, (len - EVENT_OFFSET) as u16);
        put_u32(&mut buf, EVENT_WHAT_OFFSET, what);
        put_u32(&mut buf, EVENT_PID_OFFSET, pid as u32);
        buf
    }

    #[test]
    fn subscription_message_layout() {
        let msg = mcast_op_message(4321, PROC_CN_MCAST_LISTEN);

        assert_eq!(msg.len(), 40);
        assert_eq!(msg.len() % 4, 0, "netlink messages are NLMSG_ALIGNTO aligned");
        assert_eq!(read_u32(&msg, 0), 40, "nlmsg_len covers header and payload");
        assert_eq!(read_u16(&msg, 4), NLMSG_DONE);
        assert_eq!(read_u32(&msg, 12), 4321);
        assert_eq!(read_u32(&msg, 16), CN_IDX_PROC);
        assert_eq!(read_u32(&msg, 20), CN_VAL_PROC);
        assert_eq!(read_u16(&msg, 32), 4, "cn_msg payload is the 32-bit op");
        assert_eq!(read_u32(&msg, 36), PROC_CN_MCAST_LISTEN);
    }

    #[test]
    fn unsubscribe_message_carries_ignore_op() {
        let msg = mcast_op_message(1, PROC_CN_MCAST_IGNORE);
        assert_eq!(read_u32(&msg, 36), PROC_CN_MCAST_IGNORE);
    }

    #[test]
    fn parses_exec_and_exit_events() {
        assert_eq!(parse_event(&event_message(PROC_EVENT_EXEC, 2000)), Some(ProcEvent::Exec(2000)));
        assert_eq!(parse_event(&event_message(PROC_EVENT_EXIT, 2000)), Some(ProcEvent::Exit(2000)));
        assert_eq!(parse_event(&event_message(PROC_EVENT_NONE, 0)), Some(ProcEvent::Ack));
    }

    #[test]
    fn unhandled_event_codes_are_other() {
        // PROC_EVENT_FORK
        assert_eq!(parse_event(&event_message(0x0000_0001, 77)), Some(ProcEvent::Other));
        // PROC_EVENT_COMM
        assert_eq!(parse_event(&event_message(0x0000_0200, 77)), Some(ProcEvent::Other));
    }

    #[test]
    fn rejects_foreign_or_truncated_messages() {
        let mut msg = event_message(PROC_EVENT_EXEC, 2000);
        msg[16..20].copy_from_slice(&0xdead_u32.to_ne_bytes());
        assert_eq!(parse_event(&msg), None, "foreign connector id");

        let msg = event_message(PROC_EVENT_EXEC, 2000);
        assert_eq!(parse_event(&msg[..20]), None, "truncated datagram");
        assert_eq!(parse_event(&[]), None);
    }
}
