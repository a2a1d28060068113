//! Per-session reader thread that moves PTY output to the data channels.
//!
//! Each session gets its own OS thread because PTY reads are blocking. The
//! thread owns the PTY reader directly, so a blocked read never holds the
//! registry lock. Pausing a session means this thread stops reading: the
//! kernel buffer fills and the child blocks on its next write.
//!
//! A session's output is ordered across the two delivery paths. A fallback
//! `data` event that follows frames still unread in the visual ring carries
//! the ring cursor it must be shown after, and while fallback output is
//! unacknowledged later output follows it over the fallback.

use std::io::{ErrorKind, Read};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use termhost_pty::session::{lock_info, now_ms};
use termhost_pty::{PauseGate, PauseHolder, SessionId, SessionInfo, TerminalKind};
use termhost_shm::{frame, Channel, DataChannels, RingBuffer, MAX_PAYLOAD_LEN};

use crate::backpressure::{BackpressureController, ResumeReason};
use crate::bus::{artifact_links, BusEvent, EventBus};
use crate::ipc::EventSink;

/// Agent output notifications are published at most this often.
const AGENT_OUTPUT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderSignal {
    /// Exit without reading further.
    Stop,
    /// Send a frame parked on a full ring over the message fallback.
    Flush,
}

/// Sent by a reader whose PTY closed without being told to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderExit {
    pub id: SessionId,
    /// Generation of the session the reader belonged to.
    pub generation: u64,
}

/// Everything a reader thread needs, cloned out of the host state.
pub struct ReaderContext {
    pub id: SessionId,
    pub generation: u64,
    pub kind: TerminalKind,
    pub info: Arc<Mutex<SessionInfo>>,
    pub gate: Arc<PauseGate>,
    pub channels: Arc<DataChannels>,
    pub controller: BackpressureController,
    pub sink: EventSink,
    pub bus: EventBus,
    pub exits: mpsc::UnboundedSender<ReaderExit>,
    /// How often a parked frame is retried, and how often a closed gate is
    /// re-checked for signals.
    pub poll_interval: Duration,
    /// Longest a frame stays parked, and longest an acknowledgement hold lasts.
    pub max_pause: Duration,
    /// Unacknowledged fallback bytes at which the reader pauses itself.
    pub ack_high_water: u64,
}

enum Flow {
    Continue,
    Stop,
}

/// Delivery state a reader carries between chunks.
#[derive(Default)]
struct Delivery {
    /// The visual ring and its write cursor just past this session's last frame.
    last_frame: Option<(Arc<RingBuffer>, u64)>,
    /// When this reader took its acknowledgement hold.
    ack_held_since: Option<Instant>,
}

impl Delivery {
    /// Ring cursor the consumer must reach before showing fallback output.
    fn fallback_after(&self, channels: &DataChannels) -> Option<u64> {
        let (ring, end) = self.last_frame.as_ref()?;
        let unread = channels.is_current(Channel::Visual, ring) && ring.read_position() < *end;
        unread.then_some(*end)
    }
}

/// Start the read loop for a session on a dedicated OS thread.
///
/// A reader that panics is reported as closed so its session gets reaped;
/// the panic itself is reported by the process panic hook.
pub fn start_io_thread(
    ctx: ReaderContext,
    reader: Box<dyn Read + Send>,
    signals: mpsc::UnboundedReceiver<ReaderSignal>,
) -> std::io::Result<()> {
    let exit = ReaderExit {
        id: ctx.id.clone(),
        generation: ctx.generation,
    };
    let exits = ctx.exits.clone();
    std::thread::Builder::new()
        .name(format!("pty-io-{}", ctx.id))
        .spawn(move || {
            let run = AssertUnwindSafe(|| io_loop(ctx, reader, signals));
            if std::panic::catch_unwind(run).is_err() {
                let _ = exits.send(exit);
            }
        })?;
    Ok(())
}

fn poll_signal(signals: &mut mpsc::UnboundedReceiver<ReaderSignal>) -> Option<ReaderSignal> {
    match signals.try_recv() {
        Ok(signal) => Some(signal),
        Err(mpsc::error::TryRecvError::Disconnected) => Some(ReaderSignal::Stop),
        Err(mpsc::error::TryRecvError::Empty) => None,
    }
}

/// Whether a stop is pending, discarding any other queued signal.
fn stop_requested(signals: &mut mpsc::UnboundedReceiver<ReaderSignal>) -> bool {
    while let Some(signal) = poll_signal(signals) {
        if signal == ReaderSignal::Stop {
            return true;
        }
    }
    false
}

pub(crate) fn io_loop(
    ctx: ReaderContext,
    mut reader: Box<dyn Read + Send>,
    mut signals: mpsc::UnboundedReceiver<ReaderSignal>,
) {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
    let mut last_agent_output: Option<Instant> = None;
    let mut delivery = Delivery::default();

    loop {
        if let Flow::Stop = wait_open(&ctx, &mut delivery, &mut signals) {
            log::debug!("reader for {} stopped", ctx.id);
            return;
        }

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // EIO once the child side closes.
            Err(_) => break,
        };
        let chunk = &buf[..n];

        let analysis_enabled = {
            let mut info = lock_info(&ctx.info);
            info.record_output(chunk);
            info.analysis_enabled
        };

        let framed = frame(&ctx.id, chunk);
        let flow = deliver_visual(&ctx, chunk, framed.as_deref(), &mut delivery, &mut signals);
        if let Flow::Stop = flow {
            log::debug!("reader for {} stopped while parked", ctx.id);
            return;
        }
        if analysis_enabled {
            deliver_analysis(&ctx, framed.as_deref());
        }

        if ctx.kind.is_agent()
            && last_agent_output.map_or(true, |at| at.elapsed() >= AGENT_OUTPUT_INTERVAL)
        {
            last_agent_output = Some(Instant::now());
            ctx.bus.publish(BusEvent::AgentOutput {
                id: ctx.id.clone(),
                timestamp: now_ms(),
            });
        }
        for uri in artifact_links(chunk) {
            ctx.bus.publish(BusEvent::ArtifactDetected {
                id: ctx.id.clone(),
                uri,
            });
        }
    }

    // A killed session's PTY closes too; that is not a natural exit.
    if stop_requested(&mut signals) {
        log::debug!("reader for {} stopped at EOF", ctx.id);
        return;
    }
    log::debug!("PTY for {} reached EOF", ctx.id);
    let _ = ctx.exits.send(ReaderExit {
        id: ctx.id.clone(),
        generation: ctx.generation,
    });
}

/// Wait out any pause, still answering signals.
///
/// The reader's own acknowledgement hold is dropped once it has lasted
/// `max_pause`, so a consumer that never acknowledges cannot stall it.
fn wait_open(
    ctx: &ReaderContext,
    delivery: &mut Delivery,
    signals: &mut mpsc::UnboundedReceiver<ReaderSignal>,
) -> Flow {
    loop {
        if let Some(ReaderSignal::Stop) = poll_signal(signals) {
            return Flow::Stop;
        }
        if ctx.gate.wait_open(ctx.poll_interval) {
            delivery.ack_held_since = None;
            return Flow::Continue;
        }
        let expired = delivery
            .ack_held_since
            .is_some_and(|since| since.elapsed() >= ctx.max_pause);
        if expired {
            delivery.ack_held_since = None;
            if ctx.gate.release(PauseHolder::Acknowledgement) {
                log::debug!("terminal {} resumed without acknowledgement", ctx.id);
                ctx.controller.refresh(&ctx.id);
            }
        }
    }
}

fn fallback(ctx: &ReaderContext, chunk: &[u8], delivery: &mut Delivery) {
    let after = delivery.fallback_after(&ctx.channels);
    ctx.sink.data(&ctx.id, chunk, after);
    let unacked = {
        let mut info = lock_info(&ctx.info);
        info.unacked_bytes += chunk.len() as u64;
        info.unacked_bytes
    };
    if unacked >= ctx.ack_high_water && ctx.gate.hold(PauseHolder::Acknowledgement) {
        delivery.ack_held_since = Some(Instant::now());
        log::debug!("terminal {} paused: {unacked} fallback bytes unacknowledged", ctx.id);
        ctx.controller.refresh(&ctx.id);
    }
}

/// Put one chunk on the visual channel, or on the fallback when it cannot go
/// there. A frame refused by a full ring is parked and retried; the reader
/// reads nothing else until it is delivered.
fn deliver_visual(
    ctx: &ReaderContext,
    chunk: &[u8],
    framed: Option<&[u8]>,
    delivery: &mut Delivery,
    signals: &mut mpsc::UnboundedReceiver<ReaderSignal>,
) -> Flow {
    let Some(framed) = framed else {
        log::debug!("chunk for {} cannot be framed, using fallback", ctx.id);
        fallback(ctx, chunk, delivery);
        return Flow::Continue;
    };
    let Some(ring) = ctx.channels.get(Channel::Visual) else {
        fallback(ctx, chunk, delivery);
        return Flow::Continue;
    };
    let fallback_pending = lock_info(&ctx.info).unacked_bytes > 0;
    if framed.len() > ring.capacity() || fallback_pending {
        fallback(ctx, chunk, delivery);
        return Flow::Continue;
    }
    if let Some(end) = ring.try_write(framed) {
        delivery.last_frame = Some((ring, end));
        return Flow::Continue;
    }

    ctx.controller.on_buffer_full(&ctx.id, framed.len());
    park(ctx, &ring, chunk, framed, delivery, signals)
}

fn park(
    ctx: &ReaderContext,
    ring: &Arc<RingBuffer>,
    chunk: &[u8],
    framed: &[u8],
    delivery: &mut Delivery,
    signals: &mut mpsc::UnboundedReceiver<ReaderSignal>,
) -> Flow {
    let parked_at = Instant::now();
    loop {
        match poll_signal(signals) {
            Some(ReaderSignal::Stop) => return Flow::Stop,
            Some(ReaderSignal::Flush) => {
                log::debug!("flushing parked frame for {}", ctx.id);
                ctx.controller.resume(&ctx.id, ResumeReason::Flushed);
                fallback(ctx, chunk, delivery);
                return Flow::Continue;
            }
            None => {}
        }
        std::thread::sleep(ctx.poll_interval);

        if !ctx.channels.is_current(Channel::Visual, ring) {
            ctx.controller.resume(&ctx.id, ResumeReason::RingGone);
            fallback(ctx, chunk, delivery);
            return Flow::Continue;
        }
        if let Some(end) = ring.try_write(framed) {
            delivery.last_frame = Some((Arc::clone(ring), end));
            return Flow::Continue;
        }
        if parked_at.elapsed() >= ctx.max_pause {
            log::debug!("parked frame for {} timed out, using fallback", ctx.id);
            ctx.controller.resume(&ctx.id, ResumeReason::Timeout);
            fallback(ctx, chunk, delivery);
            return Flow::Continue;
        }
        if !ctx.gate.is_held_by(PauseHolder::Backpressure) {
            // Resumed while the frame still does not fit.
            ctx.controller.on_buffer_full(&ctx.id, framed.len());
        }
    }
}

/// Best effort: a full or missing analysis ring drops the frame.
fn deliver_analysis(ctx: &ReaderContext, framed: Option<&[u8]>) {
    let Some(ring) = ctx.channels.get(Channel::Analysis) else {
        return;
    };
    let written = framed.map_or(0, |f| ring.write(f));
    if written == 0 {
        lock_info(&ctx.info).analysis_frames_dropped += 1;
    }
}
