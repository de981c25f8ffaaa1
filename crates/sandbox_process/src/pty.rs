use std::os::fd::{AsRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;

/// Non-blocking wrapper around a PTY master fd, in the shape tokio's own
/// `AsyncFd` documentation uses for raw-fd integration: set `O_NONBLOCK`
/// once, then loop on readiness + `try_io` for every read/write.
pub struct PtyMaster {
    fd: AsyncFd<OwnedFd>,
}

impl PtyMaster {
    pub fn new(fd: OwnedFd) -> std::io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                nix::unistd::read(inner.get_ref().as_raw_fd(), buf).map_err(std::io::Error::from)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> std::io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            let written = match guard.try_io(|inner| {
                nix::unistd::write(inner.get_ref().as_raw_fd(), data).map_err(std::io::Error::from)
            }) {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            data = &data[written..];
        }
        Ok(())
    }

    /// Applies a new terminal window size (`spec.md §4.6`:
    /// `set_terminal_size`); reflected immediately since it's a plain
    /// ioctl, not buffered I/O.
    pub fn set_winsize(&self, rows: u16, cols: u16) -> std::io::Result<()> {
        let winsize = nix::pty::Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        set_window_size(self.fd.get_ref().as_raw_fd(), &winsize)
    }
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, nix::pty::Winsize);

fn set_window_size(fd: std::os::fd::RawFd, winsize: &nix::pty::Winsize) -> std::io::Result<()> {
    // SAFETY: `fd` is a valid, open PTY master for the lifetime of this call.
    unsafe { tiocswinsz(fd, winsize) }
        .map(|_| ())
        .map_err(std::io::Error::from)
}
