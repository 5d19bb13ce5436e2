use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Result, SerialError};

/// Termios speed constant for a baud rate.
pub fn speed_for_baud(baud: u32) -> Option<libc::speed_t> {
    let speed = match baud {
        50 => libc::B50,
        75 => libc::B75,
        110 => libc::B110,
        134 => libc::B134,
        150 => libc::B150,
        200 => libc::B200,
        300 => libc::B300,
        600 => libc::B600,
        1200 => libc::B1200,
        1800 => libc::B1800,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        #[cfg(target_os = "linux")]
        460800 => libc::B460800,
        #[cfg(target_os = "linux")]
        500000 => libc::B500000,
        #[cfg(target_os = "linux")]
        576000 => libc::B576000,
        #[cfg(target_os = "linux")]
        921600 => libc::B921600,
        #[cfg(target_os = "linux")]
        1000000 => libc::B1000000,
        #[cfg(target_os = "linux")]
        1152000 => libc::B1152000,
        #[cfg(target_os = "linux")]
        1500000 => libc::B1500000,
        #[cfg(target_os = "linux")]
        2000000 => libc::B2000000,
        _ => return None,
    };
    Some(speed)
}

/// Put a terminal into raw 8N1 mode without flow control.
///
/// `speed` is applied to both directions when given.
pub(crate) fn set_raw(fd: RawFd, speed: Option<libc::speed_t>) -> io::Result<()> {
    // SAFETY: termios is plain data; tcgetattr fully initialises it on success.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: fd is a live descriptor owned by the caller.
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: tio points to a valid termios.
    unsafe { libc::cfmakeraw(&mut tio) };
    tio.c_cflag &= !(libc::CSIZE | libc::PARENB | libc::CSTOPB | libc::CRTSCTS);
    tio.c_cflag |= libc::CS8 | libc::CLOCAL | libc::CREAD;
    tio.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
    tio.c_cc[libc::VMIN] = 0;
    tio.c_cc[libc::VTIME] = 0;

    if let Some(speed) = speed {
        // SAFETY: tio points to a valid termios.
        let rc = unsafe {
            libc::cfsetispeed(&mut tio, speed) | libc::cfsetospeed(&mut tio, speed)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    // SAFETY: fd is live and tio is fully initialised.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn poll_timeout_ms(timeout: Duration) -> libc::c_int {
    timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

/// Wait until any of `fds` is readable or `timeout` elapses.
///
/// Returns one flag per descriptor. Hang-up and error conditions count as
/// readable so the next read reports them. An interrupted wait reports
/// nothing ready.
pub fn wait_readable(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    // SAFETY: pollfds is a valid, correctly sized array for the call.
    let rc = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            poll_timeout_ms(timeout),
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }

    Ok(pollfds
        .iter()
        .map(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .collect())
}

fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    // SAFETY: a single valid pollfd.
    let rc = unsafe { libc::poll(&mut pollfd, 1, poll_timeout_ms(timeout)) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(())
}

/// Write all of `buf` to a non-blocking descriptor.
///
/// `WouldBlock` waits for the descriptor to drain; if it stays full for
/// longer than `timeout` the rest of `buf` is abandoned with `TimedOut`.
pub fn write_all(file: &File, mut buf: &[u8], timeout: Duration) -> io::Result<()> {
    let mut writer = file;
    let mut deadline: Option<Instant> = None;
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                deadline = None;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let now = Instant::now();
                let until = *deadline.get_or_insert(now + timeout);
                if now >= until {
                    return Err(io::Error::from(ErrorKind::TimedOut));
                }
                wait_writable(file.as_raw_fd(), until - now)?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// A serial port opened raw, non-blocking, without becoming the
/// controlling terminal.
#[derive(Debug)]
pub struct SerialDevice {
    file: File,
    path: PathBuf,
    baud: u32,
}

impl SerialDevice {
    /// Open `path` at `baud`, 8N1, no flow control.
    pub fn open(path: impl AsRef<Path>, baud: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let speed = speed_for_baud(baud).ok_or(SerialError::UnsupportedBaud(baud))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(&path)
            .map_err(|source| SerialError::Open {
                path: path.clone(),
                source,
            })?;

        set_raw(file.as_raw_fd(), Some(speed)).map_err(|source| SerialError::Configure {
            path: path.clone(),
            source,
        })?;

        // Discard whatever queued up before we took the line.
        // SAFETY: the descriptor is owned by `file`.
        if unsafe { libc::tcflush(file.as_raw_fd(), libc::TCIOFLUSH) } != 0 {
            debug!(?path, error = %io::Error::last_os_error(), "tcflush failed");
        }

        info!(?path, baud, "serial device opened");
        Ok(Self { file, path, baud })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Write all of `buf`, waiting up to `timeout` for a full output
    /// queue to drain.
    pub fn write_all_timeout(&self, buf: &[u8], timeout: Duration) -> io::Result<()> {
        write_all(&self.file, buf, timeout)
    }

    /// Duplicate the descriptor, e.g. to read and write from different threads.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
            path: self.path.clone(),
            baud: self.baud,
        })
    }
}

impl AsRawFd for SerialDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Read for SerialDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for SerialDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Read for &SerialDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }
}

impl Write for &SerialDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.file).flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn common_bauds_are_supported() {
        for baud in [1200, 9600, 19200, 38400, 57600, 115200] {
            assert!(speed_for_baud(baud).is_some(), "baud {baud}");
        }
        assert_eq!(speed_for_baud(9600), Some(libc::B9600));
        assert!(speed_for_baud(0).is_none());
        assert!(speed_for_baud(12345).is_none());
    }

    #[test]
    fn open_rejects_unsupported_baud_before_touching_device() {
        let err = SerialDevice::open("/nonexistent/ttyS99", 12345).unwrap_err();
        assert!(matches!(err, SerialError::UnsupportedBaud(12345)));
    }

    #[test]
    fn open_reports_missing_device() {
        let err = SerialDevice::open("/nonexistent/ttyS99", 9600).unwrap_err();
        match err {
            SerialError::Open { path, source } => {
                assert_eq!(path, PathBuf::from("/nonexistent/ttyS99"));
                assert_eq!(source.kind(), ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn open_rejects_non_terminal() {
        let dir = std::env::temp_dir().join(format!("consoled-serial-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("not-a-tty");
        std::fs::write(&path, b"").unwrap();

        let err = SerialDevice::open(&path, 9600).unwrap_err();
        assert!(matches!(err, SerialError::Configure { .. }));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn write_all_gives_up_when_nobody_reads() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let a = File::from(std::os::fd::OwnedFd::from(a));

        let payload = vec![0u8; 4 * 1024 * 1024];
        let err = write_all(&a, &payload, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn wait_readable_times_out() {
        let (a, _b) = UnixStream::pair().unwrap();
        let start = Instant::now();
        let ready = wait_readable(&[a.as_raw_fd()], Duration::from_millis(20)).unwrap();
        assert_eq!(ready, vec![false]);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn wait_readable_reports_each_fd() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();

        let ready =
            wait_readable(&[c.as_raw_fd(), a.as_raw_fd()], Duration::from_millis(100)).unwrap();
        assert_eq!(ready, vec![false, true]);
    }

    #[test]
    fn wait_readable_reports_hangup() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let ready = wait_readable(&[a.as_raw_fd()], Duration::from_millis(100)).unwrap();
        assert_eq!(ready, vec![true]);
    }

    #[test]
    fn write_all_survives_full_buffer() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let a = File::from(std::os::fd::OwnedFd::from(a));

        let payload = vec![0x5Au8; 512 * 1024];
        let expected = payload.len();
        let reader = std::thread::spawn(move || {
            let mut total = 0usize;
            let mut buf = [0u8; 8192];
            while total < expected {
                let n = b.read(&mut buf).unwrap();
                assert!(n > 0);
                total += n;
            }
            total
        });

        write_all(&a, &payload, Duration::from_secs(5)).unwrap();
        assert_eq!(reader.join().unwrap(), expected);
    }
}
