//! Line-oriented pipe I/O for the task wire.
//!
//! Both directions carry one JSON document per line. Reads and writes go
//! straight to the descriptor through `nix`, retrying on EINTR so a signal
//! delivered to a worker (SIGCHLD, SIGTERM handlers in user code) never tears
//! a message.

use nix::errno::Errno;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

/// Buffer size of both ends (64KB).
const PIPE_BUFFER: usize = 64 * 1024;

/// Longest accepted line. A peer writing more without a newline is broken.
pub const MAX_LINE: usize = 64 * 1024 * 1024;

fn retry<T>(mut op: impl FnMut() -> nix::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other.map_err(io::Error::from),
        }
    }
}

/// One end of a pipe.
#[derive(Debug)]
pub struct PipeFd(OwnedFd);

impl PipeFd {
    /// Duplicate one of this process's standard streams, as a worker does
    /// with stdin and stdout.
    pub fn dup_stdio(stream: impl AsFd) -> io::Result<Self> {
        stream.as_fd().try_clone_to_owned().map(Self)
    }
}

impl From<OwnedFd> for PipeFd {
    fn from(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

impl From<std::process::ChildStdin> for PipeFd {
    fn from(stdin: std::process::ChildStdin) -> Self {
        Self(stdin.into())
    }
}

impl From<std::process::ChildStdout> for PipeFd {
    fn from(stdout: std::process::ChildStdout) -> Self {
        Self(stdout.into())
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        retry(|| nix::unistd::read(&self.0, buf))
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        retry(|| nix::unistd::write(&self.0, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads newline-terminated messages.
#[derive(Debug)]
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(PIPE_BUFFER, fd),
            line: String::new(),
        }
    }

    /// Next line without its `\n` or `\r\n`, or `None` once the writer is
    /// gone. The returned slice is valid until the next call.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line.clear();
        let limit = MAX_LINE as u64 + 1;
        let read = (&mut self.reader).take(limit).read_line(&mut self.line)?;
        if read == 0 {
            return Ok(None);
        }
        if read as u64 == limit && !self.line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {} bytes", MAX_LINE),
            ));
        }

        let len = self.line.trim_end_matches(['\n', '\r']).len();
        self.line.truncate(len);
        Ok(Some(&self.line))
    }
}

/// Writes newline-terminated messages, one flush per message so the peer
/// never waits on a half-buffered line.
#[derive(Debug)]
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(PIPE_BUFFER, fd),
        }
    }

    /// Write `line`, adding the terminator if missing, and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

/// An anonymous pipe as `(reader, writer)`.
#[cfg(test)]
pub(crate) fn pipe() -> io::Result<(LineReader, LineWriter)> {
    let (read_end, write_end) = nix::unistd::pipe()?;
    Ok((
        LineReader::new(read_end.into()),
        LineWriter::new(write_end.into()),
    ))
}
