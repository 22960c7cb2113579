use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::models::device::DeviceId;
use crate::models::diagnostics::TargetDiagnostics;
use crate::models::error::RelayError;
use crate::traits::endpoint::{CaptureEndpoint, RenderEndpoint};

/// Delivery counters for one target, updated only by the relay thread.
#[derive(Debug)]
pub(crate) struct TargetCounters {
    pub(crate) id: DeviceId,
    delivered: AtomicU64,
    dropped: AtomicU64,
    write_errors: AtomicU64,
}

impl TargetCounters {
    fn new(id: DeviceId) -> Self {
        Self {
            id,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    pub(crate) fn snapshot(&self) -> TargetDiagnostics {
        TargetDiagnostics {
            id: self.id.clone(),
            packets_delivered: self.delivered.load(Ordering::Relaxed),
            packets_dropped: self.dropped.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Lock-free counters shared between the relay thread and observers.
#[derive(Debug)]
pub(crate) struct SessionCounters {
    pub(crate) packets: AtomicU64,
    pub(crate) frames: AtomicU64,
    pub(crate) discontinuities: AtomicU64,
    pub(crate) faulted: AtomicBool,
    /// One per render endpoint, same order.
    pub(crate) targets: Vec<TargetCounters>,
}

impl SessionCounters {
    pub(crate) fn new(targets: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            packets: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            discontinuities: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
            targets: targets.into_iter().map(TargetCounters::new).collect(),
        }
    }
}

/// Move one captured packet to every render endpoint that has room for it.
///
/// Returns `Ok(false)` when no packet was ready. A target whose free space is
/// smaller than the packet skips it; other targets are unaffected. The packet
/// is released back to the capture endpoint whatever the targets did.
pub(crate) fn pump_once(
    capture: &mut dyn CaptureEndpoint,
    renders: &mut [Box<dyn RenderEndpoint>],
    counters: &SessionCounters,
) -> Result<bool, RelayError> {
    let Some(packet) = capture.next_packet()? else {
        return Ok(false);
    };
    let frames = packet.frames;
    if packet.flags.discontinuity {
        counters.discontinuities.fetch_add(1, Ordering::Relaxed);
        log::debug!("capture discontinuity after {} packets", counters.packets.load(Ordering::Relaxed));
    }

    for (render, target) in renders.iter_mut().zip(&counters.targets) {
        let free = match render.free_frames() {
            Ok(free) => free,
            Err(e) => {
                write_failed(target, &e);
                continue;
            }
        };

        if free < frames {
            target.dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("overrun on {}: {} free < {} frames", target.id, free, frames);
            continue;
        }

        match render.write_frames(packet.data, frames, packet.flags) {
            Ok(()) => {
                target.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => write_failed(target, &e),
        }
    }

    capture.release_packet(frames)?;
    counters.packets.fetch_add(1, Ordering::Relaxed);
    counters.frames.fetch_add(frames as u64, Ordering::Relaxed);
    Ok(true)
}

/// Poll, copy, repeat until `running` clears.
///
/// Sleeps `poll_interval` whenever the capture endpoint has nothing ready.
/// Returns early only if the capture endpoint fails.
pub(crate) fn run_loop(
    running: &AtomicBool,
    capture: &mut dyn CaptureEndpoint,
    renders: &mut [Box<dyn RenderEndpoint>],
    counters: &SessionCounters,
    poll_interval: Duration,
) -> Result<(), RelayError> {
    while running.load(Ordering::Acquire) {
        if !pump_once(capture, renders, counters)? {
            thread::sleep(poll_interval);
        }
    }
    Ok(())
}

fn write_failed(target: &TargetCounters, error: &RelayError) {
    target.dropped.fetch_add(1, Ordering::Relaxed);
    // Warn on the first failure only; a vanished device fails every packet.
    if target.write_errors.fetch_add(1, Ordering::Relaxed) == 0 {
        log::warn!("render to {} failed: {}", target.id, error);
    }
}
