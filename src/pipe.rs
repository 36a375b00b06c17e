//! A close-on-exec pipe used to carry bootstrap errors out of a forked
//! child before it replaces itself with the tracee image.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::errors::{DebuggerError, Result};

/// A unidirectional byte channel with independently closable ends.
///
/// Both ends are owned; dropping the pipe closes whatever is still open.
pub struct Pipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl Pipe {
    /// Creates the pipe, optionally marking both ends close-on-exec so a
    /// successful `exec` in the child reports success by closing the channel.
    pub fn new(close_on_exec: bool) -> Result<Self> {
        let flags = if close_on_exec {
            OFlag::O_CLOEXEC
        } else {
            OFlag::empty()
        };
        let (read, write) = pipe2(flags)
            .map_err(|errno| DebuggerError::os_call("Pipe creation failed", errno))?;
        Ok(Pipe {
            read: Some(read),
            write: Some(write),
        })
    }

    pub fn read_fd(&self) -> Option<RawFd> {
        self.read.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn write_fd(&self) -> Option<RawFd> {
        self.write.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Detaches and returns the read end.
    pub fn release_read(&mut self) -> Option<OwnedFd> {
        self.read.take()
    }

    /// Detaches and returns the write end.
    pub fn release_write(&mut self) -> Option<OwnedFd> {
        self.write.take()
    }

    pub fn close_read(&mut self) {
        self.read = None;
    }

    pub fn close_write(&mut self) {
        self.write = None;
    }

    /// Drains up to 1 KiB from the read end.
    ///
    /// Returns the empty vector once all writers have closed their end
    /// without writing.
    pub fn read(&mut self) -> Result<Vec<u8>> {
        let fd = self.read.take().ok_or_else(|| closed_end("read"))?;
        let mut file = File::from(fd);
        let mut buf = [0u8; 1024];
        let count = file.read(&mut buf)?;
        self.read = Some(file.into());
        Ok(buf[..count].to_vec())
    }

    /// Writes the whole buffer to the write end.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let fd = self.write.take().ok_or_else(|| closed_end("write"))?;
        let mut file = File::from(fd);
        file.write_all(bytes)?;
        self.write = Some(file.into());
        Ok(())
    }
}

fn closed_end(which: &str) -> DebuggerError {
    DebuggerError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("pipe {which} end already closed"),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pipe_round_trip() {
        let mut pipe = Pipe::new(false).unwrap();
        pipe.write(b"from the deep").unwrap();
        pipe.close_write();
        assert_eq!(pipe.read().unwrap(), b"from the deep");
        assert_eq!(pipe.read().unwrap(), b"");
    }

    #[test]
    fn test_closed_end_reports_error() {
        let mut pipe = Pipe::new(true).unwrap();
        pipe.close_write();
        assert!(pipe.write(b"x").is_err());
    }
}
