use std::ffi::CStr;
use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::device::set_raw;
use crate::error::{Result, SerialError};

fn set_fd_flags(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    set_cloexec(fd)
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn tty_name(fd: RawFd) -> io::Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: buf is writable for its full length.
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    // SAFETY: ttyname_r NUL-terminates on success.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(PathBuf::from(name.to_string_lossy().into_owned()))
}

/// A pseudo-terminal pair.
///
/// The master side is non-blocking and carries the console traffic. The
/// slave is held open for the lifetime of the pair so the master never
/// sees a hang-up while no user is attached.
#[derive(Debug)]
pub struct Pty {
    master: File,
    _slave: File,
    slave_path: PathBuf,
}

impl Pty {
    pub fn open() -> Result<Self> {
        let mut master: libc::c_int = -1;
        let mut slave: libc::c_int = -1;
        // SAFETY: out-pointers are valid; name/termios/winsize are optional.
        let rc = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut::<libc::c_char>(),
                std::ptr::null_mut::<libc::termios>(),
                std::ptr::null_mut::<libc::winsize>(),
            )
        };
        if rc != 0 {
            return Err(SerialError::Pty(io::Error::last_os_error()));
        }

        // SAFETY: openpty returned two fresh descriptors that nothing else owns.
        let (master, slave) = unsafe { (File::from_raw_fd(master), File::from_raw_fd(slave)) };

        let slave_path = tty_name(slave.as_raw_fd()).map_err(SerialError::Pty)?;
        set_raw(slave.as_raw_fd(), None).map_err(SerialError::Pty)?;
        set_cloexec(slave.as_raw_fd()).map_err(SerialError::Pty)?;
        set_fd_flags(master.as_raw_fd()).map_err(SerialError::Pty)?;

        debug!(slave = ?slave_path, "pty allocated");
        Ok(Self {
            master,
            _slave: slave,
            slave_path,
        })
    }

    /// Device node users attach to (e.g. `/dev/pts/3`).
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    pub fn master(&self) -> &File {
        &self.master
    }

    pub fn master_mut(&mut self) -> &mut File {
        &mut self.master
    }
}

impl AsRawFd for Pty {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

/// Operator-facing symlink to a pty slave (e.g. `/dev/VC0-1 -> /dev/pts/3`).
///
/// Removed on drop, unless something else has repointed it since.
#[derive(Debug)]
pub struct PtySymlink {
    link: PathBuf,
    target: PathBuf,
}

impl PtySymlink {
    /// Create `link` pointing at `target`.
    ///
    /// A leftover symlink at `link` is replaced; any other file is left
    /// alone and reported as an error.
    pub fn create(target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<Self> {
        let target = target.as_ref().to_path_buf();
        let link = link.as_ref().to_path_buf();
        let symlink_err = |source| SerialError::Symlink {
            path: link.clone(),
            source,
        };

        match std::fs::symlink_metadata(&link) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                debug!(?link, "removing stale symlink");
                std::fs::remove_file(&link).map_err(symlink_err)?;
            }
            Ok(_) => {
                return Err(symlink_err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    "existing path is not a symlink",
                )));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(symlink_err(err)),
        }

        std::os::unix::fs::symlink(&target, &link).map_err(symlink_err)?;
        info!(?link, ?target, "pty symlink created");
        Ok(Self { link, target })
    }

    pub fn link(&self) -> &Path {
        &self.link
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for PtySymlink {
    fn drop(&mut self) {
        match std::fs::read_link(&self.link) {
            Ok(current) if current == self.target => {
                debug!(link = ?self.link, "removing pty symlink");
                let _ = std::fs::remove_file(&self.link);
            }
            Ok(_) => debug!(link = ?self.link, "symlink repointed; skipping cleanup"),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::wait_readable;
    use std::io::{Read, Write};
    use std::time::Duration;

    fn unique_temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "consoled-pty-{tag}-{}-{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn pty_carries_bytes_from_slave_to_master() {
        let mut pty = Pty::open().unwrap();
        assert!(pty.slave_path().exists());

        let mut user = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(pty.slave_path())
            .unwrap();
        user.write_all(b"show version\r").unwrap();

        let ready = wait_readable(&[pty.as_raw_fd()], Duration::from_secs(2)).unwrap();
        assert_eq!(ready, vec![true]);

        let mut buf = [0u8; 64];
        let n = pty.master_mut().read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"show version\r");
    }

    #[test]
    fn idle_master_would_block() {
        let mut pty = Pty::open().unwrap();
        let mut buf = [0u8; 8];
        let err = pty.master_mut().read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn symlink_create_and_cleanup() {
        let dir = unique_temp_dir("link");
        let target = dir.join("pts-1");
        std::fs::write(&target, b"").unwrap();
        let link_path = dir.join("VC0-1");

        let link = PtySymlink::create(&target, &link_path).unwrap();
        assert_eq!(std::fs::read_link(&link_path).unwrap(), target);
        assert_eq!(link.link(), link_path.as_path());

        drop(link);
        assert!(std::fs::symlink_metadata(&link_path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn symlink_replaces_stale_link() {
        let dir = unique_temp_dir("stale");
        let link_path = dir.join("VC0-2");
        std::os::unix::fs::symlink(dir.join("old"), &link_path).unwrap();

        let _link = PtySymlink::create(dir.join("new"), &link_path).unwrap();
        assert_eq!(std::fs::read_link(&link_path).unwrap(), dir.join("new"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn symlink_refuses_regular_file() {
        let dir = unique_temp_dir("regular");
        let link_path = dir.join("VC0-3");
        std::fs::write(&link_path, b"keep me").unwrap();

        let err = PtySymlink::create(dir.join("pts"), &link_path).unwrap_err();
        assert!(matches!(err, SerialError::Symlink { .. }));
        assert_eq!(std::fs::read(&link_path).unwrap(), b"keep me");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn repointed_symlink_is_left_alone() {
        let dir = unique_temp_dir("repoint");
        let link_path = dir.join("VC0-4");

        let link = PtySymlink::create(dir.join("a"), &link_path).unwrap();
        std::fs::remove_file(&link_path).unwrap();
        std::os::unix::fs::symlink(dir.join("b"), &link_path).unwrap();

        drop(link);
        assert_eq!(std::fs::read_link(&link_path).unwrap(), dir.join("b"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
