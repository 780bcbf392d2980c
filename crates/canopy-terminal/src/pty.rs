use std::io;
use std::io::Read;
use std::io::Write;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::Mutex;

use canopy_common::mutex_lock_or_recover;
use portable_pty::Child;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;

use crate::error::PtyError;

const FALLBACK_SHELL: &str = "/bin/sh";

/// The user's login shell, else `/bin/sh`.
pub(crate) fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    writer: Mutex<Box<dyn Write + Send>>,
    size: PtySize,
    fd: RawFd,
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.kill();
        }
    }
}

/// Read side of a PTY, shareable with a reader thread.
#[derive(Clone)]
pub struct PtyReader {
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    fd: RawFd,
}

impl PtyHandle {
    /// Run `command` through the shell, or an interactive shell when `None`.
    pub fn spawn(
        command: Option<&str>,
        cwd: Option<&str>,
        env: &[(String, String)],
        cols: u16,
        rows: u16,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(default_shell());
        if let Some(command) = command {
            cmd.args(["-c", command]);
        }
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| PtyError::Open("Failed to get master fd".to_string()))?;

        set_non_blocking(fd)?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        Ok(Self {
            master: pair.master,
            child,
            reader: Arc::new(Mutex::new(reader)),
            writer: Mutex::new(writer),
            size,
            fd,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    pub fn size(&self) -> (u16, u16) {
        (self.size.cols, self.size.rows)
    }

    pub fn reader(&self) -> PtyReader {
        PtyReader {
            reader: Arc::clone(&self.reader),
            fd: self.fd,
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.child
            .try_wait()
            .map(|status| status.is_none())
            .unwrap_or(false)
    }

    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if data.is_empty() {
            return Ok(());
        }

        let mut writer = mutex_lock_or_recover(&self.writer);
        let mut offset = 0;
        while offset < data.len() {
            match writer.write(&data[offset..]) {
                Ok(0) => {
                    return Err(PtyError::Write(
                        "write returned 0 bytes, PTY closed".to_string(),
                    ));
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_writable(self.fd)?;
                }
                Err(e) => return Err(PtyError::Write(e.to_string())),
            }
        }
        Ok(())
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .resize(self.size)
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    pub fn kill(&mut self) -> Result<(), PtyError> {
        if !self.is_running() {
            return Ok(());
        }

        self.child
            .kill()
            .map_err(|e| PtyError::Kill(e.to_string()))
    }
}

impl PtyReader {
    /// Wait up to `timeout_ms` for output. `Ok(0)` means nothing arrived.
    pub fn try_read(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, PtyError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let ready = wait_readable(self.fd, timeout_ms)?;
        if !ready {
            return Ok(0);
        }

        let mut reader = mutex_lock_or_recover(&self.reader);
        let mut total = 0;
        loop {
            match reader.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if total == buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(PtyError::Read(e.to_string())),
            }
        }

        Ok(total)
    }
}

fn set_non_blocking(fd: RawFd) -> Result<(), PtyError> {
    // SAFETY: `fd` is the open master descriptor owned by the PTY pair.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(PtyError::Open(io::Error::last_os_error().to_string()));
    }

    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }

    // SAFETY: same descriptor as above; only the status flags change.
    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(PtyError::Open(io::Error::last_os_error().to_string()));
    }

    Ok(())
}

fn wait_readable(fd: RawFd, timeout_ms: i32) -> Result<bool, PtyError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    // SAFETY: `pollfd` is a valid, initialized struct and the count is 1.
    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(PtyError::Read(err.to_string()));
    }
    if result == 0 {
        return Ok(false);
    }

    if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return Err(PtyError::Read("poll error on PTY".to_string()));
    }

    if pollfd.revents & libc::POLLHUP != 0 && pollfd.revents & libc::POLLIN == 0 {
        return Err(PtyError::Read("PTY hung up".to_string()));
    }

    Ok(pollfd.revents & libc::POLLIN != 0)
}

fn wait_writable(fd: RawFd) -> Result<(), PtyError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };

    // SAFETY: `pollfd` is a valid, initialized struct and the count is 1.
    let result = unsafe { libc::poll(&mut pollfd, 1, -1) };
    if result < 0 {
        return Err(PtyError::Write(io::Error::last_os_error().to_string()));
    }

    if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(PtyError::Write("poll error on PTY".to_string()));
    }

    Ok(())
}
