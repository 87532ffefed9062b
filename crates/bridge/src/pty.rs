//! Pseudo-terminal bridge
//!
//! Owns the pty master. The slave side is the product's entire external
//! contract: the print-management process opens it exactly as it would a
//! native serial port. A stable symlink can be installed over the volatile
//! `/dev/pts/N` name so the consumer always opens the same path.
//!
//! A dedicated reader thread drains what the consumer writes, runs it
//! through the incremental frame decoder, and hands each frame to the
//! manager. The return path is [`PtyWriter::deliver_bytes`]: raw bytes into
//! the master, verbatim and in order, no framing applied.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::fd::{AsFd, FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use common::{Error, Result, WorkerTx};
use framing::{FrameDecoder, SerialFrame};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use tracing::{debug, error, info, warn};

/// Reader poll interval; bounds shutdown latency and the EIO backoff while
/// no consumer holds the slave open.
const READER_POLL_MS: u16 = 200;

const READ_CHUNK: usize = 4096;

/// Destination for bytes flowing physical-port-to-consumer. The pty writer
/// is the production implementation; tests substitute their own.
pub trait ByteSink: Send {
    fn deliver_bytes(&self, data: &[u8]) -> Result<()>;
}

/// Write half of the pty master, handed to the connection manager.
#[derive(Clone)]
pub struct PtyWriter {
    master: Arc<File>,
}

impl ByteSink for PtyWriter {
    fn deliver_bytes(&self, data: &[u8]) -> Result<()> {
        (&*self.master).write_all(data).map_err(Error::Io)
    }
}

pub struct PtyBridge {
    master: Arc<File>,
    slave_path: PathBuf,
    link_path: Option<PathBuf>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl PtyBridge {
    /// Allocate the pty pair and, when configured, install a stable symlink
    /// to the slave.
    pub fn open(link_path: Option<PathBuf>) -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
            .map_err(|e| Error::Pty(format!("posix_openpt: {}", e)))?;
        grantpt(&master).map_err(|e| Error::Pty(format!("grantpt: {}", e)))?;
        unlockpt(&master).map_err(|e| Error::Pty(format!("unlockpt: {}", e)))?;
        let slave_path = PathBuf::from(
            ptsname_r(&master).map_err(|e| Error::Pty(format!("ptsname: {}", e)))?,
        );

        // The fd came straight from posix_openpt, so File may own it
        let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };

        // Raw line discipline: the slave must carry bytes untouched, no
        // echo, no CR/LF translation
        let mut attrs = tcgetattr(&master).map_err(|e| Error::Pty(format!("tcgetattr: {}", e)))?;
        cfmakeraw(&mut attrs);
        tcsetattr(&master, SetArg::TCSANOW, &attrs)
            .map_err(|e| Error::Pty(format!("tcsetattr: {}", e)))?;

        if let Some(link) = &link_path {
            install_link(link, &slave_path)?;
        }

        info!(slave = %slave_path.display(), "pty allocated");

        Ok(Self {
            master: Arc::new(master),
            slave_path,
            link_path,
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        })
    }

    /// Path of the slave device the consumer opens.
    #[allow(dead_code)]
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Path to advertise to the consumer: the stable symlink when one was
    /// installed, the raw slave path otherwise.
    pub fn public_path(&self) -> &Path {
        self.link_path.as_deref().unwrap_or(&self.slave_path)
    }

    /// Handle for the return byte path.
    pub fn writer(&self) -> PtyWriter {
        PtyWriter {
            master: self.master.clone(),
        }
    }

    /// Start the master read loop. Decoded frames go to `frames`; malformed
    /// input is logged and skipped, one frame at a time.
    pub fn spawn_reader(&mut self, frames: WorkerTx<SerialFrame>) {
        let master = self.master.clone();
        let stop = self.stop.clone();

        let reader = std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || read_loop(master, frames, stop))
            .expect("failed to spawn pty reader thread");

        self.reader = Some(reader);
    }

    /// Stop the reader, join it, and remove the symlink.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(link) = self.link_path.take() {
            if let Err(e) = fs::remove_file(&link) {
                warn!(link = %link.display(), error = %e, "failed to remove pty symlink");
            }
        }
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Replace `link` with a symlink to `slave`. Refuses to clobber anything
/// that is not a symlink.
fn install_link(link: &Path, slave: &Path) -> Result<()> {
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(link).map_err(Error::Io)?;
        }
        Ok(_) => {
            return Err(Error::Pty(format!(
                "{} exists and is not a symlink",
                link.display()
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }
    std::os::unix::fs::symlink(slave, link).map_err(Error::Io)?;
    info!(link = %link.display(), slave = %slave.display(), "pty symlink installed");
    Ok(())
}

fn read_loop(master: Arc<File>, frames: WorkerTx<SerialFrame>, stop: Arc<AtomicBool>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_CHUNK];
    let idle = Duration::from_millis(READER_POLL_MS as u64);

    while !stop.load(Ordering::Acquire) && !frames.is_closed() {
        let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(READER_POLL_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "pty poll failed");
                break;
            }
        }

        match (&*master).read(&mut buf) {
            Ok(0) => {
                std::thread::sleep(idle);
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                if !drain_frames(&mut decoder, &frames) {
                    break;
                }
            }
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => {
                // No consumer holds the slave open right now; idle, the
                // device stays available for the next open
                std::thread::sleep(idle);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
                ) =>
            {
                continue;
            }
            Err(e) => {
                error!(error = %e, "pty read failed");
                break;
            }
        }
    }

    debug!("pty reader stopped");
}

/// Forward every complete frame; returns false when the manager side is
/// gone and the loop should exit.
fn drain_frames(decoder: &mut FrameDecoder, frames: &WorkerTx<SerialFrame>) -> bool {
    loop {
        match decoder.next_frame() {
            Ok(Some(frame)) => {
                if frames.send_blocking(frame).is_err() {
                    return false;
                }
            }
            Ok(None) => return true,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
            }
        }
    }
}
