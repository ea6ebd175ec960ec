use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{Decoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::device::{DeviceEntry, SerialSettings, Slot};
use crate::error::Error;
use crate::router::Router;
use crate::trace_log::DeviceTrace;

pub(crate) mod codec;

use codec::RecordCodec;

/// How long a link waits after a failed open or a lost connection before
/// trying the port again. Retries continue until the link is closed.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// MAC-address-shaped tokens, as printed by `cat /sys/class/net/*/address`.
const MAC_TOKEN_PATTERN: &str = r"(?:[0-9a-fA-F]:?){12}";

#[derive(Debug)]
enum LinkCommand {
    Write(Vec<u8>),
}

#[derive(Debug, Default)]
struct LinkFlags {
    open: AtomicBool,
    last_error: AtomicBool,
    discover: AtomicBool,
}

/// A handle to one supervised serial connection.
///
/// The worker task behind it keeps the port open (retrying forever on
/// failure) until [`LinkHandle::close`] is called. Handles are cheap to
/// clone; the router and the supervisor share one worker this way.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    entry: DeviceEntry,
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
    flags: Arc<LinkFlags>,
    cancel: CancellationToken,
}

impl LinkHandle {
    /// The slot this link serves.
    pub fn slot(&self) -> Slot {
        self.entry.id
    }

    /// The mapping entry this link was spawned for.
    pub fn entry(&self) -> &DeviceEntry {
        &self.entry
    }

    /// Whether the port is currently open.
    pub fn is_open(&self) -> bool {
        self.flags.open.load(Ordering::Relaxed)
    }

    /// Whether the most recent read or write on this link failed.
    pub fn last_error(&self) -> bool {
        self.flags.last_error.load(Ordering::Relaxed)
    }

    /// Whether the link is intercepting output for discovery.
    pub fn discover_mode(&self) -> bool {
        self.flags.discover.load(Ordering::Relaxed)
    }

    /// Switch discovery interception on or off without writing a probe.
    pub fn set_discover(&self, on: bool) {
        self.flags.discover.store(on, Ordering::Relaxed);
    }

    /// Write a text message. A line terminator is appended when the caller's
    /// text carries none.
    pub fn send_text(&self, message: &str) -> Result<(), Error> {
        let mut bytes = message.as_bytes().to_vec();
        if !message.contains('\n') {
            bytes.extend_from_slice(b"\r\n");
        }
        self.send(LinkCommand::Write(bytes))
    }

    /// Write raw bytes with no framing added.
    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<(), Error> {
        self.send(LinkCommand::Write(bytes))
    }

    /// Decode hex text and write the raw bytes, with no framing added.
    pub fn send_hex(&self, hex_text: &str) -> Result<(), Error> {
        let bytes = hex::decode(hex_text.trim())
            .map_err(|e| Error::InvalidEncoding(format!("`{hex_text}`: {e}")))?;
        self.send_binary(bytes)
    }

    /// Put the link in discover mode, then write the probe plus terminator.
    pub fn send_discover_probe(&self, message: &str) -> Result<(), Error> {
        self.set_discover(true);

        let mut bytes = message.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        self.send(LinkCommand::Write(bytes))
    }

    /// Ask the worker to release the port and exit. The read loop observes
    /// this at its next iteration boundary.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn send(&self, command: LinkCommand) -> Result<(), Error> {
        self.cmd_tx.send(command).map_err(|_| {
            Error::DeviceIo(format!("The link worker for slot {} is gone", self.slot()))
        })
    }
}

/// Spawn a worker for one mapping entry.
///
/// The returned join handle completes once the worker has observed a close
/// request and released the port.
pub(crate) fn spawn(
    entry: DeviceEntry,
    router: Router,
    log_dir: &Path,
) -> (LinkHandle, JoinHandle<()>) {
    let settings = SerialSettings::resolve(&entry);
    let slot = entry.id;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let flags = Arc::new(LinkFlags::default());
    let cancel = CancellationToken::new();

    let handle = LinkHandle {
        entry: entry.clone(),
        cmd_tx,
        flags: flags.clone(),
        cancel: cancel.clone(),
    };

    let span = info_span!("link", %slot, port = %entry.connection_properties.port);

    let worker = LinkWorker {
        trace: DeviceTrace::new(log_dir, slot),
        mac_tokens: Regex::new(MAC_TOKEN_PATTERN).expect("The MAC pattern is well formed"),
        entry,
        settings,
        slot,
        router,
        cmd_rx,
        flags,
        cancel,
    };

    let join = tokio::spawn(worker.run().instrument(span));

    (handle, join)
}

enum PumpEnd {
    /// Close was requested, or every handle is gone.
    Closed,

    /// The connection died; reopen after the backoff.
    ConnectionLost,
}

struct LinkWorker {
    entry: DeviceEntry,
    settings: SerialSettings,
    slot: Slot,
    router: Router,
    cmd_rx: mpsc::UnboundedReceiver<LinkCommand>,
    flags: Arc<LinkFlags>,
    cancel: CancellationToken,
    trace: DeviceTrace,
    mac_tokens: Regex,
}

impl LinkWorker {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let stream = match open_stream(&self.entry, &self.settings) {
                Ok(stream) => stream,
                Err(e) => {
                    self.note_error(&e.to_string());
                    if self.backoff().await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            info!("Connected");
            self.flags.open.store(true, Ordering::Relaxed);
            self.flags.last_error.store(false, Ordering::Relaxed);

            let end = self.pump(RecordCodec::default().framed(stream)).await;

            self.flags.open.store(false, Ordering::Relaxed);

            match end {
                PumpEnd::Closed => break,
                PumpEnd::ConnectionLost => {
                    if self.backoff().await.is_err() {
                        break;
                    }
                }
            }
        }

        self.flags.open.store(false, Ordering::Relaxed);
        debug!("Link worker exited");
    }

    /// Read records and serve write commands until the connection dies or
    /// close is requested.
    async fn pump(&mut self, mut framed: Framed<tokio_serial::SerialStream, RecordCodec>) -> PumpEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return PumpEnd::Closed,

                command = self.cmd_rx.recv() => match command {
                    Some(LinkCommand::Write(bytes)) => {
                        if let Err(e) = framed.send(bytes).await {
                            self.note_error(&format!("Write failed: {e}"));
                            return PumpEnd::ConnectionLost;
                        }
                    }
                    // Every handle dropped; nobody can route to us anymore.
                    None => return PumpEnd::Closed,
                },

                record = framed.next() => match record {
                    Some(Ok(record)) => self.handle_record(record).await,
                    Some(Err(e)) => {
                        self.note_error(&format!("Read failed: {e}"));
                        return PumpEnd::ConnectionLost;
                    }
                    None => {
                        self.note_error("Port closed underneath us");
                        return PumpEnd::ConnectionLost;
                    }
                },
            }
        }
    }

    async fn handle_record(&mut self, record: Vec<u8>) {
        match String::from_utf8(record) {
            Ok(line) => {
                let line = line.trim_end();

                if self.flags.discover.load(Ordering::Relaxed) {
                    self.handle_discover_line(line);
                } else {
                    self.trace.line(line);
                    self.router.broadcast(self.slot, line).await;
                    self.flags.last_error.store(false, Ordering::Relaxed);
                }
            }
            Err(e) => {
                // A bad decode usually means a wrong baud rate. Tell the
                // clients once and keep the connection open.
                let report = format!(
                    "Could not decode serial output. Check the baud rate setting; currently {}. ({e})",
                    self.settings.baud
                );

                error!(%report);
                self.trace.error(&report);
                self.router.broadcast(self.slot, &report).await;
                self.flags.last_error.store(true, Ordering::Relaxed);
            }
        }
    }

    /// In discover mode output is not forwarded; MAC-shaped tokens are
    /// pulled out of it and logged instead.
    fn handle_discover_line(&self, line: &str) {
        let macs = self
            .mac_tokens
            .find_iter(line)
            .map(|token| token.as_str())
            .collect::<Vec<_>>();

        if !macs.is_empty() {
            info!(slot = %self.slot, macs = macs.join(" "), "Discovered hardware addresses");
        }
    }

    fn note_error(&mut self, message: &str) {
        warn!("{message}");
        self.trace.error(message);
        self.flags.last_error.store(true, Ordering::Relaxed);
    }

    /// Wait out the retry backoff; `Err` means close was requested.
    async fn backoff(&self) -> Result<(), ()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(()),
            _ = tokio::time::sleep(RETRY_BACKOFF) => Ok(()),
        }
    }
}

fn open_stream(
    entry: &DeviceEntry,
    settings: &SerialSettings,
) -> Result<tokio_serial::SerialStream, Error> {
    let path = &entry.connection_properties.port;

    tokio_serial::new(path, settings.baud)
        .parity(settings.parity.into())
        .data_bits(data_bits(settings.data_bits))
        .stop_bits(stop_bits(settings.stop_bits))
        .open_native_async()
        .map_err(|e| Error::DeviceIo(format!("Could not open port at {path}: {e}")))
}

fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            warn!("{other} is not a data bits setting, using 8");
            tokio_serial::DataBits::Eight
        }
    }
}

fn stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => {
            warn!("{other} is not a stop bits setting, using 1");
            tokio_serial::StopBits::One
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionProperties;

    fn entry_for_missing_port() -> DeviceEntry {
        DeviceEntry {
            id: Slot::new(5, 0).unwrap(),
            device_type: "DTA".into(),
            connection_properties: ConnectionProperties::new("/dev/ttyO-does-not-exist"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_backoff_ends_the_worker() {
        let router = Router::new();
        let dir = std::env::temp_dir().join(format!("slotline-test-{}", uuid::Uuid::new_v4()));

        let (handle, join) = spawn(entry_for_missing_port(), router, &dir);

        // The open fails immediately, putting the worker in its backoff.
        tokio::task::yield_now().await;
        assert!(!handle.is_open());

        handle.close();
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("Worker should observe close within the backoff")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn open_failures_keep_retrying_until_closed() {
        let router = Router::new();
        let dir = std::env::temp_dir().join(format!("slotline-test-{}", uuid::Uuid::new_v4()));

        let (handle, join) = spawn(entry_for_missing_port(), router, &dir);

        // Let several backoff rounds elapse; the worker must still be there.
        tokio::time::sleep(RETRY_BACKOFF * 4).await;
        assert!(!join.is_finished());
        assert!(handle.last_error());

        handle.close();
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("Worker should exit after close")
            .unwrap();
    }

    #[tokio::test]
    async fn text_writes_gain_a_terminator_only_when_missing() {
        let (handle, mut written) = testing::detached_handle(entry_for_missing_port());

        handle.send_text("hello").unwrap();
        assert_eq!(written.recv().await.unwrap(), b"hello\r\n");

        handle.send_text("hello\n").unwrap();
        assert_eq!(written.recv().await.unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn hex_writes_decode_first_and_reject_bad_input() {
        let (handle, mut written) = testing::detached_handle(entry_for_missing_port());

        handle.send_hex("48656c6c6f").unwrap();
        assert_eq!(written.recv().await.unwrap(), b"Hello");

        assert!(matches!(
            handle.send_hex("zz"),
            Err(Error::InvalidEncoding(_))
        ));
    }
}
