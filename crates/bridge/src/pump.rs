//! Per-session I/O pump
//!
//! One pump exists per open port session: a dedicated thread doing blocking
//! reads on its own clone of the serial link, forwarding every chunk
//! unmodified and in arrival order to the manager. Reads are bounded by a
//! short timeout purely so the loop can observe its stop flag; the write
//! path is the only place with a meaningful deadline.
//!
//! Each pump is tagged with the generation of the session it serves. The
//! manager discards events from retired generations, so a pump that dies
//! reporting a stale error cannot poison the session that replaced it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use common::{PumpEvent, WorkerTx};
use tracing::{debug, trace, warn};

use crate::host::SerialLink;

/// Read buffer size; firmware responses are line-oriented and small
const READ_CHUNK: usize = 4096;

/// Running pump owned by a `PortSession`.
pub struct PumpHandle {
    generation: u64,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PumpHandle {
    /// Session generation this pump serves.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ask the pump to exit at its next timeout tick.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether the pump thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Wait for the pump thread to exit. The caller must keep draining the
    /// pump channel until [`is_finished`](Self::is_finished) before joining,
    /// or a pump blocked on a full channel can never observe the stop flag.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Start a pump for one session generation.
///
/// `poll_interval` is the read timeout that doubles as the stop-flag check
/// cadence; it bounds how long a close can take.
pub fn spawn_pump(
    mut link: Box<dyn SerialLink>,
    events: WorkerTx<PumpEvent>,
    generation: u64,
    poll_interval: Duration,
) -> PumpHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();

    let thread = std::thread::Builder::new()
        .name(format!("pump-{}", generation))
        .spawn(move || {
            if let Err(e) = link.set_timeout(poll_interval) {
                warn!(generation, error = %e, "pump could not set read timeout");
            }
            run_pump(link.as_mut(), &events, generation, &flag);
        })
        .expect("failed to spawn pump thread");

    PumpHandle {
        generation,
        stop,
        thread: Some(thread),
    }
}

fn run_pump(
    link: &mut dyn SerialLink,
    events: &WorkerTx<PumpEvent>,
    generation: u64,
    stop: &AtomicBool,
) {
    trace!(generation, "pump started");
    let mut buf = [0u8; READ_CHUNK];

    loop {
        if stop.load(Ordering::Acquire) || events.is_closed() {
            break;
        }

        match link.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                let event = PumpEvent::Data {
                    generation,
                    data: Bytes::copy_from_slice(&buf[..n]),
                };
                if events.send_blocking(event).is_err() {
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!(generation, error = %e, "pump read failed");
                let _ = events.try_send(PumpEvent::Failed {
                    generation,
                    error: e.to_string(),
                });
                return;
            }
        }
    }

    debug!(generation, "pump stopped");
    let _ = events.try_send(PumpEvent::Stopped { generation });
}
