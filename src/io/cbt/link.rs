// src/io/cbt/link.rs
//
// Transport engine for the CAN Bus Triple.
//
// The link owns the byte channel. While open, a dedicated reader thread feeds
// every received byte through the frame classifier: CAN notifications are
// published to subscribers, busy or not, and responses resolve the single
// pending command through a one-shot completion slot.
//
// At most one correlated command (JSON / OK / line / any) is in flight. The
// busy flag and the pending slot are set together when the command is issued
// and cleared by the command's guard on every exit path (reply, timeout,
// cancellation, write failure). A command that had to open the channel closes
// it again before the guard clears busy.
//
// Lock order: lifecycle -> state -> channel. The reader thread never holds the
// channel lock while taking the state lock.

use chrono::{DateTime, Local};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{broadcast, oneshot};

use super::framer::{Frame, FrameClassifier};
use super::{Command, Expect, JsonReply, Reply};
use crate::config::LinkConfig;
use crate::io::channel::{is_idle_read, ByteChannel};
use crate::io::{CanMessage, IoError, LinkEvent, TraceDirection};

const READ_BUFFER_SIZE: usize = 512;

// =============================================================================
// Internal State
// =============================================================================

type ReplyResult = Result<Reply, IoError>;

struct Pending {
    expect: Expect,
    reply_tx: oneshot::Sender<ReplyResult>,
}

struct ReaderHandle {
    stop: Arc<AtomicBool>,
    done_rx: std_mpsc::Receiver<()>,
}

#[derive(Default)]
struct LinkState {
    /// Response kind awaited by the command in flight
    busy: Option<Expect>,
    /// Completion slot of the command in flight, until a reply fills it
    pending: Option<Pending>,
    /// Present while the channel is open
    reader: Option<ReaderHandle>,
}

struct LinkShared {
    name: Mutex<String>,
    channel: Mutex<Box<dyn ByteChannel>>,
    state: Mutex<LinkState>,
    lifecycle: Mutex<()>,
    events: broadcast::Sender<LinkEvent>,
    /// Set by cancel: the reader drops any partially read response frame
    interrupt: AtomicBool,
    config: LinkConfig,
}

fn relock<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LinkShared {
    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        relock(self.state.lock())
    }

    fn lock_channel(&self) -> MutexGuard<'_, Box<dyn ByteChannel>> {
        relock(self.channel.lock())
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        relock(self.lifecycle.lock())
    }

    fn name(&self) -> String {
        relock(self.name.lock()).clone()
    }

    fn emit(&self, event: LinkEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn trace(&self, direction: TraceDirection, bytes: &[u8]) {
        if self.config.trace {
            self.emit(LinkEvent::Trace {
                direction,
                text: hex::encode_upper(bytes),
            });
        }
    }

    /// Route one classified frame.
    fn dispatch(&self, frame: Frame, clock: &LinkClock) {
        match frame {
            Frame::Can(record) => {
                let message = CanMessage::new(record.bus, record.id, record.data, record.status, clock.now());
                self.emit(LinkEvent::CanMessage(message));
            }
            response => self.resolve(response),
        }
    }

    /// Hand a response frame to the pending command if it waits for that kind.
    fn resolve(&self, frame: Frame) {
        let mut state = self.lock_state();
        let Some(expect) = state.pending.as_ref().map(|p| p.expect) else {
            tlog!("[cbt_link] Unsolicited {} ignored", frame.kind());
            return;
        };
        if !expect.accepts(&frame) {
            tlog!("[cbt_link] {} ignored while waiting for {}", frame.kind(), expect.describe());
            return;
        }

        if let (Some(pending), Some(reply)) = (state.pending.take(), frame.into_reply()) {
            // The issuer may have just timed out and dropped its receiver
            let _ = pending.reply_tx.send(Ok(reply));
        }
    }

    /// Reader hit an unrecoverable channel error: fail the pending command and
    /// mark the link closed.
    fn reader_failed(&self, stop: &Arc<AtomicBool>, error: IoError) {
        self.lock_channel().close();

        let own_handle = {
            let mut state = self.lock_state();
            if let Some(pending) = state.pending.take() {
                let _ = pending.reply_tx.send(Err(error));
            }
            match &state.reader {
                Some(handle) if Arc::ptr_eq(&handle.stop, stop) => state.reader.take(),
                _ => None,
            }
        };

        if own_handle.is_some() {
            self.emit(LinkEvent::StatusChanged(false));
        }
    }
}

/// Capture clock: open-time wall clock plus monotonic elapsed time.
struct LinkClock {
    opened_at: DateTime<Local>,
    opened_mono: Instant,
}

impl LinkClock {
    fn start() -> Self {
        Self {
            opened_at: Local::now(),
            opened_mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Local> {
        let elapsed = chrono::Duration::from_std(self.opened_mono.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.opened_at + elapsed
    }
}

// =============================================================================
// Reader Thread
// =============================================================================

fn run_reader(shared: Arc<LinkShared>, stop: Arc<AtomicBool>, clock: LinkClock) {
    let mut framer = FrameClassifier::new(shared.config.max_frame_len);
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let poll = shared.config.poll_interval();

    while !stop.load(Ordering::Acquire) {
        if shared.interrupt.swap(false, Ordering::AcqRel) {
            framer.abandon_partial();
        }

        // Hold the channel only for an actual read so writers are never starved
        let read = {
            let mut channel = shared.lock_channel();
            match channel.bytes_available() {
                Ok(0) => Ok(0),
                Ok(available) => {
                    let n = available.min(buf.len());
                    channel.read(&mut buf[..n])
                }
                Err(e) => Err(e),
            }
        };

        match read {
            Ok(0) => std::thread::sleep(poll),
            Ok(n) => {
                shared.trace(TraceDirection::Rx, &buf[..n]);
                for result in framer.feed(&buf[..n]) {
                    match result {
                        Ok(frame) => shared.dispatch(frame, &clock),
                        Err(e) => tlog!("[cbt_link] Dropped frame: {}", e),
                    }
                }
            }
            Err(e) if is_idle_read(&e) => {}
            Err(e) => {
                let name = shared.name();
                tlog!("[cbt_link] Read error on {}: {}", name, e);
                shared.reader_failed(&stop, IoError::read(&name, e.to_string()));
                break;
            }
        }
    }
}

// =============================================================================
// Link
// =============================================================================

/// Driver-side connection to one CAN Bus Triple.
///
/// Cloning is cheap and every clone drives the same channel, so one task can
/// cancel a command another task is waiting on.
#[derive(Clone)]
pub struct CbtLink {
    shared: Arc<LinkShared>,
}

/// Restores link state when a correlated command ends, however it ends.
struct CommandGuard<'a> {
    link: &'a CbtLink,
    opened: bool,
}

impl CommandGuard<'_> {
    /// Normal exit: the reader is joined on the blocking pool so the runtime
    /// worker is not held up.
    async fn release(mut self) {
        self.link.shared.lock_state().pending = None;
        if std::mem::take(&mut self.opened) {
            self.link.close_off_runtime().await;
        }
    }
}

impl Drop for CommandGuard<'_> {
    // Also runs when the issuing future is dropped mid-command. Closing here
    // blocks for at most one command timeout while the reader stops.
    fn drop(&mut self) {
        self.link.shared.lock_state().pending = None;
        if self.opened {
            self.link.close_link();
        }
        self.link.shared.lock_state().busy = None;
    }
}

impl CbtLink {
    pub fn new(channel: Box<dyn ByteChannel>, config: LinkConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let name = channel.name().to_string();

        Self {
            shared: Arc::new(LinkShared {
                name: Mutex::new(name),
                channel: Mutex::new(channel),
                state: Mutex::new(LinkState::default()),
                lifecycle: Mutex::new(()),
                events,
                interrupt: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Link over the serial port named in `config`.
    #[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
    pub fn serial(config: LinkConfig) -> Self {
        let channel = crate::io::channel::SerialChannel::new(config.port.clone(), config.baud_rate);
        Self::new(Box::new(channel), config)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Device name of the underlying channel
    pub fn name(&self) -> String {
        self.shared.name()
    }

    /// Receive status changes, CAN frames and (when enabled) traces.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock_state().reader.is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.lock_state().busy.is_some()
    }

    /// Response kind the command in flight waits for.
    pub fn awaiting(&self) -> Option<Expect> {
        self.shared.lock_state().busy
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the channel and start the reader. No-op when already open.
    pub fn open(&self) -> Result<(), IoError> {
        let _lifecycle = self.shared.lock_lifecycle();
        self.open_locked()
    }

    /// Stop the reader and release the channel.
    ///
    /// Fails with `Busy` while a command is in flight; cancel it first.
    pub fn close(&self) -> Result<(), IoError> {
        let _lifecycle = self.shared.lock_lifecycle();
        if self.is_busy() {
            return Err(IoError::busy(&self.name(), "close"));
        }
        self.shutdown_reader();
        Ok(())
    }

    /// Point the link at another device. Closes the link if it is open.
    pub fn set_port(&self, name: &str) -> Result<(), IoError> {
        let _lifecycle = self.shared.lock_lifecycle();
        if self.is_busy() {
            return Err(IoError::busy(&self.name(), "set port name"));
        }
        self.shutdown_reader();

        self.shared.lock_channel().set_name(name);
        *relock(self.shared.name.lock()) = name.to_string();
        tlog!("[cbt_link] Port set to {}", name);
        Ok(())
    }

    fn open_locked(&self) -> Result<(), IoError> {
        if self.is_open() {
            return Ok(());
        }
        let name = self.name();

        {
            let mut channel = self.shared.lock_channel();
            channel
                .set_read_timeout(self.shared.config.poll_interval())
                .map_err(|e| IoError::connection(&name, e.to_string()))?;
            channel
                .open()
                .map_err(|e| IoError::connection(&name, e.to_string()))?;
        }

        self.shared.interrupt.store(false, Ordering::Release);
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = std_mpsc::channel();

        let shared = Arc::clone(&self.shared);
        let reader_stop = Arc::clone(&stop);
        let clock = LinkClock::start();
        let spawned = std::thread::Builder::new()
            .name(format!("cbt-reader {}", name))
            .spawn(move || {
                run_reader(shared, reader_stop, clock);
                let _ = done_tx.send(());
            });

        if let Err(e) = spawned {
            self.shared.lock_channel().close();
            return Err(IoError::connection(&name, format!("failed to start reader: {}", e)));
        }

        self.shared.lock_state().reader = Some(ReaderHandle { stop, done_rx });
        tlog!("[cbt_link] Opened {}", name);
        self.shared.emit(LinkEvent::StatusChanged(true));
        Ok(())
    }

    /// Open if closed; returns whether this call opened the link.
    fn ensure_open(&self) -> Result<bool, IoError> {
        let _lifecycle = self.shared.lock_lifecycle();
        if self.is_open() {
            return Ok(false);
        }
        self.open_locked()?;
        Ok(true)
    }

    fn close_link(&self) {
        let _lifecycle = self.shared.lock_lifecycle();
        self.shutdown_reader();
    }

    /// `close_link` from async code.
    async fn close_off_runtime(&self) {
        let link = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || link.close_link()).await {
            tlog!("[cbt_link] Close task failed: {:?}", e);
        }
    }

    /// Stop the reader, waiting at most one command timeout, then close the
    /// channel. Caller holds the lifecycle lock.
    fn shutdown_reader(&self) {
        let Some(handle) = self.shared.lock_state().reader.take() else {
            return;
        };

        handle.stop.store(true, Ordering::Release);
        let timeout = self.shared.config.command_timeout();
        if let Err(std_mpsc::RecvTimeoutError::Timeout) = handle.done_rx.recv_timeout(timeout) {
            tlog!("[cbt_link] Reader did not stop within {:?}", timeout);
        }

        self.shared.lock_channel().close();
        tlog!("[cbt_link] Closed {}", self.name());
        self.shared.emit(LinkEvent::StatusChanged(false));
    }

    fn write_command(&self, command: &Command) -> Result<(), IoError> {
        let bytes = command.as_bytes();
        self.shared.trace(TraceDirection::Tx, bytes);

        let mut channel = self.shared.lock_channel();
        channel
            .write_all(bytes)
            .and_then(|_| channel.flush())
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotConnected => IoError::not_open(&self.name()),
                _ => IoError::write(&self.name(), e.to_string()),
            })
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Write a command that gets no response, waiting only for the flush.
    ///
    /// Blind writes may interleave with each other but not with a pending
    /// correlated command.
    pub async fn blind(&self, command: &Command) -> Result<(), IoError> {
        let awaiting = self.shared.lock_state().busy;
        if let Some(expect) = awaiting {
            tlog!("[cbt_link] {} rejected, waiting for {}", command.name(), expect.describe());
            return Err(IoError::busy(&self.name(), command.name()));
        }

        let opened = self.ensure_open()?;
        let result = self.write_command(command);
        if opened {
            self.close_off_runtime().await;
        }
        result
    }

    /// Write a command and wait for the first frame of kind `expect`.
    ///
    /// Fails immediately with `Busy` when another command is in flight, with
    /// `Timeout` when nothing matching arrives within the command timeout and
    /// with `Cancelled` when `cancel` is called meanwhile. On every outcome the
    /// link is idle again and open only if it was open before.
    pub async fn issue(&self, command: &Command, expect: Expect) -> Result<Reply, IoError> {
        if expect == Expect::Blind {
            return Err(IoError::validation(format!(
                "{} expects no response, send it blind",
                command.name()
            )));
        }

        let reply_rx = {
            let mut state = self.shared.lock_state();
            if let Some(current) = state.busy {
                tlog!("[cbt_link] {} rejected, waiting for {}", command.name(), current.describe());
                return Err(IoError::busy(&self.name(), command.name()));
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            state.busy = Some(expect);
            state.pending = Some(Pending { expect, reply_tx });
            reply_rx
        };

        let mut guard = CommandGuard {
            link: self,
            opened: false,
        };
        guard.opened = self.ensure_open()?;

        let timeout = self.shared.config.command_timeout();
        let result = match self.write_command(command) {
            Err(e) => Err(e),
            Ok(()) => match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(IoError::cancelled(&self.name(), command.name())),
                Err(_) => {
                    tlog!("[cbt_link] {} timed out after {:?}", command.name(), timeout);
                    Err(IoError::timeout(&self.name(), expect.describe()))
                }
            },
        };

        guard.release().await;
        result
    }

    /// Send a command the way its encoder intended: blind or correlated.
    pub async fn execute(&self, command: &Command) -> Result<Option<Reply>, IoError> {
        match command.expect() {
            Expect::Blind => self.blind(command).await.map(|_| None),
            expect => self.issue(command, expect).await.map(Some),
        }
    }

    pub async fn json(&self, command: &Command) -> Result<JsonReply, IoError> {
        match self.issue(command, Expect::Json).await? {
            Reply::Json(map) => Ok(map),
            other => Err(IoError::protocol(&self.name(), format!("expected JSON, got {:?}", other))),
        }
    }

    /// `true` for OK, `false` for ERROR.
    pub async fn ok(&self, command: &Command) -> Result<bool, IoError> {
        match self.issue(command, Expect::Ok).await? {
            Reply::Ack(ok) => Ok(ok),
            other => Err(IoError::protocol(&self.name(), format!("expected OK/ERROR, got {:?}", other))),
        }
    }

    pub async fn line(&self, command: &Command) -> Result<String, IoError> {
        match self.issue(command, Expect::Line).await? {
            Reply::Line(line) => Ok(line),
            other => Err(IoError::protocol(&self.name(), format!("expected text line, got {:?}", other))),
        }
    }

    /// Whichever response arrives first.
    pub async fn any(&self, command: &Command) -> Result<Reply, IoError> {
        self.issue(command, Expect::Any).await
    }

    /// Abandon the pending command, if any, and optionally close the link.
    ///
    /// The waiting issuer wakes at once with `Cancelled`. A partially read
    /// response frame is discarded by the reader.
    pub fn cancel(&self, close: bool) {
        let pending = self.shared.lock_state().pending.take();
        if let Some(pending) = pending {
            tlog!("[cbt_link] Cancelled command waiting for {}", pending.expect.describe());
            self.shared.interrupt.store(true, Ordering::Release);
        }
        if close {
            self.close_link();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
