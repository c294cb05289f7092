use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Free-space probe for the filesystem holding the bag.
///
/// The writer disables itself when free space falls under 1 GiB, so the
/// probe must be cheap; it runs at most once per 20 wall-clock seconds.
pub trait DiskSpace: Send + Sync + 'static {
    /// Returns the number of bytes available to unprivileged writers on
    /// the filesystem containing `path`.
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// `statvfs`-backed probe: block size times blocks available.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsDiskSpace;

#[cfg(unix)]
impl DiskSpace for StatvfsDiskSpace {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stat.f_bsize as u64 * stat.f_bavail as u64)
    }
}

#[cfg(not(unix))]
impl DiskSpace for StatvfsDiskSpace {
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }
}

/// Wall-clock source pacing the probe and the dropped-message warning
/// throttle. Whole seconds are enough resolution: the shortest interval
/// the writer measures is five seconds.
pub trait WallClock: Send + Sync + 'static {
    /// Seconds since the UNIX epoch.
    fn now_secs(&self) -> u64;
}

/// `SystemTime`-backed clock. A clock set before the epoch reads as
/// zero, which at worst makes the next probe come early.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}
