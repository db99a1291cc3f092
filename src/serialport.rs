//! Byte-level transport to the scanner: a TTY in raw 8-N-1 mode with
//! hardware flow control, plus deadline-bounded exact-count reads and
//! writes built on poll(2).
use crate::log;
use nix::fcntl::{self, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::stat::Mode;
pub use nix::sys::termios::BaudRate;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use std::error::Error as stderr;
use std::fmt;

#[derive(Debug, Copy, Clone)]
pub enum ErrorKind {
    PortClosed,
    Errno(nix::errno::Errno),
}

#[derive(Debug)]
pub struct Error {
    /// Kind of error
    kind: ErrorKind,
    /// Long description of error
    description: String,
}

impl stderr for Error {}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        fmt.write_str(&self.description)
    }
}

impl Error {
    pub fn new(kind: ErrorKind, description: &str) -> Error {
        Error {
            kind,
            description: description.to_string(),
        }
    }
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn desc(&self) -> &String {
        &self.description
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Error {
        Error::new(ErrorKind::Errno(e), e.desc())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What the link layer needs from a serial line. `SerialPort` is the real
/// thing; tests substitute a scripted mock.
pub trait Port {
    /// Read until `buf` is full, end of file, or the deadline passes.
    /// Returns the number of bytes actually read.
    fn read_exact(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
    /// Write all of `buf`, giving up when the deadline passes. Returns the
    /// number of bytes actually written.
    fn write_exact(&self, buf: &[u8], timeout: Duration) -> Result<usize>;
    /// Discard anything queued on the input side of the line.
    fn flush_input(&self) -> Result<()>;
}

pub struct SerialPort {
    fd: Option<RawFd>,
    path: String,
    baud: BaudRate,
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl SerialPort {
    pub fn new(path: &str, baud: BaudRate) -> SerialPort {
        SerialPort {
            path: path.into(),
            fd: None,
            baud,
        }
    }

    /// Open the device and put it into raw mode.
    pub fn open(&mut self) -> Result<()> {
        use nix::fcntl::fcntl;
        use nix::fcntl::FcntlArg::F_SETFL;

        // O_NONBLOCK so a line with modem control asserted cannot hang the
        // open call; cleared again once the port is configured.
        let fd = match fcntl::open(
            Path::new(&self.path),
            OFlag::O_NOCTTY | OFlag::O_RDWR | OFlag::O_NONBLOCK,
            Mode::empty(),
        ) {
            Ok(n) => n,
            Err(e) => {
                log::error(&format!("open {}: {}", self.path, e));
                return Err(e.into());
            }
        };
        if let Err(e) = self.configure(fd) {
            let _ = nix::unistd::close(fd);
            return Err(e);
        }
        fcntl(fd, F_SETFL(OFlag::empty()))?;
        self.fd = Some(fd);
        log::debug(&format!("serial: {} open", self.path));
        Ok(())
    }

    /// Raw 8-N-1 with hardware flow control. VMIN/VTIME give reads a short
    /// inter-byte ceiling; overall pacing comes from the poll deadlines.
    fn configure(&self, fd: RawFd) -> Result<()> {
        use nix::sys::termios::{
            cfsetispeed, cfsetospeed, tcgetattr, tcsetattr, ControlFlags, InputFlags, LocalFlags,
            OutputFlags, SetArg, SpecialCharacterIndices,
        };
        let mut settings = tcgetattr(fd)?;

        settings.control_flags &= !ControlFlags::PARENB;
        settings.control_flags &= !ControlFlags::CSTOPB;
        settings.control_flags &= !ControlFlags::CSIZE;
        settings.control_flags |= ControlFlags::CS8;
        settings.control_flags |= ControlFlags::CRTSCTS;
        settings.control_flags |= ControlFlags::CREAD | ControlFlags::CLOCAL;
        settings.local_flags &= !LocalFlags::ICANON;
        settings.local_flags &= !LocalFlags::ECHO;
        settings.local_flags &= !LocalFlags::ECHOE;
        settings.local_flags &= !LocalFlags::ECHONL;
        settings.local_flags &= !LocalFlags::ISIG;
        settings.input_flags &= !(InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY);
        settings.input_flags &= !(InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::ICRNL);
        settings.output_flags &= !OutputFlags::OPOST;
        settings.output_flags &= !OutputFlags::ONLCR;
        // VTIME is in deciseconds; one tick bounds the wait between bytes
        // once poll has reported the line readable.
        settings.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
        settings.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        cfsetospeed(&mut settings, self.baud)?;
        cfsetispeed(&mut settings, self.baud)?;
        tcsetattr(fd, SetArg::TCSANOW, &settings)?;
        Ok(())
    }

    /// Close the serial port. Closing a port that is not open is a no-op.
    pub fn close(&mut self) -> Result<()> {
        use nix::unistd::close;
        match self.fd.take() {
            Some(fd) => match close(fd) {
                Ok(_) => Ok(()),
                Err(e) => Err(e.into()),
            },
            None => Ok(()),
        }
    }
}

impl Port for SerialPort {
    fn read_exact(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        use nix::unistd::read;
        let fd = match self.fd {
            Some(fd) => fd,
            None => return Err(Error::new(ErrorKind::PortClosed, "Serial port is not open")),
        };
        let deadline = Instant::now() + timeout;
        let mut nbytes = 0;
        while nbytes < buf.len() {
            // The timeout bounds the whole call, so recompute what is left
            // of the budget on every pass.
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) => d,
                None => break,
            };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, remaining.as_millis() as i32) {
                Ok(0) => break,
                Ok(_) => (),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
            match read(fd, &mut buf[nbytes..]) {
                Ok(0) => break,
                Ok(n) => nbytes += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(nbytes)
    }

    fn write_exact(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        use nix::unistd::write;
        let fd = match self.fd {
            Some(fd) => fd,
            None => return Err(Error::new(ErrorKind::PortClosed, "Serial port is not open")),
        };
        let deadline = Instant::now() + timeout;
        let mut nbytes = 0;
        while nbytes < buf.len() {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) => d,
                None => break,
            };
            let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
            match poll(&mut fds, remaining.as_millis() as i32) {
                Ok(0) => break,
                Ok(_) => (),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
            match write(fd, &buf[nbytes..]) {
                Ok(0) => break,
                Ok(n) => nbytes += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(nbytes)
    }

    fn flush_input(&self) -> Result<()> {
        use nix::sys::termios::{tcflush, FlushArg};
        match self.fd {
            Some(fd) => match tcflush(fd, FlushArg::TCIFLUSH) {
                Ok(_) => Ok(()),
                Err(e) => Err(e.into()),
            },
            None => Err(Error::new(ErrorKind::PortClosed, "Serial port is not open")),
        }
    }
}

/// Map a numeric rate from the config file onto the termios constant.
pub fn baud_from_u32(rate: u32) -> Option<BaudRate> {
    match rate {
        1200 => Some(BaudRate::B1200),
        2400 => Some(BaudRate::B2400),
        4800 => Some(BaudRate::B4800),
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115200 => Some(BaudRate::B115200),
        _ => None,
    }
}
