//! Upload protocol engine.
//!
//! This module drives the display's native firmware-upload protocol over a
//! [`Port`]: baud-rate discovery, the multi-attempt prepare sequence that
//! resets the display, negotiates a transfer speed and announces the
//! incoming image, and the chunked packet-transfer loop with per-packet
//! acknowledgement and retry.
//!
//! The link is half-duplex in practice and the display's behavior (echoes,
//! silent drops, baud switch-over, reset chatter) is only approximately
//! specified, so every step tolerates stray bytes, drains aggressively
//! between commands, and retries within fixed budgets.
//!
//! ## Example
//!
//! ```rust,no_run
//! use nexflash::{NativePort, Uploader};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let firmware = std::fs::read("ui.tft")?;
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!
//!     let mut uploader = Uploader::new(port);
//!     uploader.prepare(firmware.len() as u64)?;
//!
//!     for packet in firmware.chunks(nexflash::protocol::MAX_PACKET_SIZE) {
//!         uploader.send_packet(packet)?;
//!     }
//!     uploader.finish()?;
//!
//!     Ok(())
//! }
//! ```

use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::CancelToken;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::command::{
    ACK_BYTE, BAUD_CANDIDATES, Command, DEFAULT_BAUD, ERR_BYTE, MAX_PACKET_SIZE, UPLOAD_BAUD,
    WRITE_CHUNK_SIZE, is_probe_hit,
};
use crate::session::{PrepareState, SessionHandle, UpgradeState};

/// Timing and retry parameters for the upload engine.
///
/// The defaults match the display hardware's observed requirements; lift
/// individual values only when a specific peer needs different pacing.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Attempt budget for the prepare sequence.
    pub prepare_attempts: u32,
    /// Settle time after reconfiguring the channel during discovery.
    pub probe_settle: Duration,
    /// Window during which a probe response is collected.
    pub probe_window: Duration,
    /// Settle time after reset and after each side of the baud switch.
    pub reset_settle: Duration,
    /// Wait budget for the handshake acknowledgement.
    pub handshake_timeout: Duration,
    /// Wait budget for a packet acknowledgement.
    pub ack_timeout: Duration,
    /// Attempt budget per packet.
    pub packet_retries: u32,
    /// Write chunk size within a packet.
    pub chunk_size: usize,
    /// Pacing delay between chunks, matching the display's drain rate.
    pub chunk_pacing: Duration,
    /// Pause before retrying after a short write.
    pub short_write_pause: Duration,
    /// Pause before retrying after a rejected packet.
    pub reject_pause: Duration,
    /// Pause between prepare attempts.
    pub retry_pause: Duration,
    /// Granularity of blocking waits; also the port read timeout.
    pub poll_interval: Duration,
    /// High-speed rate targeted on the first prepare attempt.
    pub upload_baud: u32,
    /// Fallback rate targeted on later attempts.
    pub default_baud: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            prepare_attempts: 5,
            probe_settle: Duration::from_millis(200),
            probe_window: Duration::from_millis(300),
            reset_settle: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            packet_retries: 3,
            chunk_size: WRITE_CHUNK_SIZE,
            chunk_pacing: Duration::from_micros(500),
            short_write_pause: Duration::from_millis(100),
            reject_pause: Duration::from_millis(200),
            retry_pause: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            upload_baud: UPLOAD_BAUD,
            default_baud: DEFAULT_BAUD,
        }
    }
}

impl UploadConfig {
    /// Set the high-speed transfer rate targeted on the first attempt.
    #[must_use]
    pub fn with_upload_baud(mut self, baud: u32) -> Self {
        self.upload_baud = baud;
        self
    }

    /// Set the prepare attempt budget.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.prepare_attempts = attempts;
        self
    }

    /// Set the per-packet retry budget.
    #[must_use]
    pub fn with_packet_retries(mut self, retries: u32) -> Self {
        self.packet_retries = retries;
        self
    }
}

/// Outcome of one handshake wait.
enum HandshakeOutcome {
    Ack,
    Rejected(u8),
    Timeout,
}

/// Outcome of one packet-acknowledgement wait.
enum PacketOutcome {
    Ack,
    Rejected,
    Timeout,
}

/// Upload protocol engine.
///
/// Generic over the port type `P`, which must implement the [`Port`] trait.
/// The engine owns the port exclusively for the duration of a session; no
/// other component may touch the channel while a prepare or transfer is in
/// flight.
#[derive(Debug)]
pub struct Uploader<P: Port> {
    port: P,
    config: UploadConfig,
    session: SessionHandle,
    cancel: CancelToken,
}

impl<P: Port> Uploader<P> {
    /// Create an uploader with default timing over an opened port.
    pub fn new(port: P) -> Self {
        Self::with_config(port, UploadConfig::default())
    }

    /// Create an uploader with custom timing.
    pub fn with_config(port: P, config: UploadConfig) -> Self {
        Self {
            port,
            config,
            session: SessionHandle::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Handle for polling session progress from another context.
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    /// Token for cancelling the engine cooperatively.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the uploader and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Probe the candidate rates to find the one the display listens on.
    ///
    /// Candidates are visited in list order and the first hit wins. Each
    /// cycle reconfigures the channel, lets it settle, discards buffered
    /// bytes, sends the probe and query commands and collects the response
    /// window. `Ok(None)` means no candidate answered.
    pub fn discover_baud(&mut self) -> Result<Option<u32>> {
        self.port.set_timeout(self.config.poll_interval)?;

        for &baud in BAUD_CANDIDATES {
            self.checkpoint()?;
            debug!("Probing {baud} bps");

            self.port.set_baud_rate(baud)?;
            self.pause(self.config.probe_settle)?;
            self.port.clear_buffers()?;

            self.send_command(&Command::baud_probe(baud))?;
            self.pause(self.config.probe_settle)?;
            self.send_command(&Command::baud_query())?;

            if self.collect_probe_window()? {
                info!("Display answered at {baud} bps");
                return Ok(Some(baud));
            }
            trace!("No response at {baud} bps");
        }

        Ok(None)
    }

    /// Negotiate a transfer speed and announce the incoming image.
    ///
    /// Runs up to the configured number of attempts. The first attempt
    /// targets the high-speed upload rate; later attempts fall back to the
    /// default rate on the assumption that the display failed to switch.
    /// On success the channel is left configured at the negotiated rate and
    /// the session reads `Done`/`Ready`. There is no partial success: the
    /// handshake is fully ready or the session is in error.
    pub fn prepare(&mut self, expected_file_size: u64) -> Result<()> {
        self.session.begin(expected_file_size);

        match self.run_prepare(expected_file_size) {
            Ok(negotiated) => {
                self.session.update(|state| {
                    state.prepare = PrepareState::Done;
                    state.upgrade = UpgradeState::Ready;
                });
                info!("Display ready for transfer at {negotiated} bps");
                Ok(())
            },
            Err(err) => {
                if matches!(err, Error::Cancelled) {
                    // Leave the channel drained at a known rate so the next
                    // session starts from a predictable link state.
                    let _ = self.port.set_baud_rate(self.config.default_baud);
                    let _ = self.port.clear_buffers();
                }
                self.session.fail_prepare();
                Err(err)
            },
        }
    }

    fn run_prepare(&mut self, expected_file_size: u64) -> Result<u32> {
        self.port.set_timeout(self.config.poll_interval)?;
        let attempts = self.config.prepare_attempts.max(1);

        for attempt in 0..attempts {
            debug!("Prepare attempt {}/{attempts}", attempt + 1);

            let Some(detected) = self.discover_baud()? else {
                return Err(Error::DiscoveryFailed);
            };
            debug!("Display detected at {detected} bps, resetting");

            self.port.clear_buffers()?;
            self.send_command(&Command::reset())?;
            self.pause(self.config.reset_settle)?;
            self.drain_input()?;

            // Two-sided baud switch: tell the display first, then follow
            // with the local end. The settle delays absorb both UARTs'
            // reconfiguration latency.
            let target = if attempt == 0 {
                self.config.upload_baud
            } else {
                self.config.default_baud
            };
            debug!("Requesting display baud {target}");
            self.send_command(&Command::set_baud(target))?;
            self.pause(self.config.reset_settle)?;
            self.drain_input()?;

            self.port.set_baud_rate(target)?;
            self.pause(self.config.reset_settle)?;
            self.drain_input()?;

            info!("Announcing upload: {expected_file_size} bytes at {target} bps");
            self.send_command(&Command::announce(expected_file_size, target))?;

            match self.wait_handshake()? {
                HandshakeOutcome::Ack => return Ok(target),
                HandshakeOutcome::Rejected(byte) => {
                    warn!(
                        "Handshake rejected (0x{byte:02X}) on attempt {}/{attempts}",
                        attempt + 1
                    );
                    if attempt + 1 == attempts {
                        return Err(Error::PeerRejected);
                    }
                },
                HandshakeOutcome::Timeout => {
                    warn!("Handshake timed out on attempt {}/{attempts}", attempt + 1);
                    if attempt + 1 == attempts {
                        return Err(Error::HandshakeTimeout);
                    }
                },
            }

            self.pause(self.config.retry_pause)?;
        }

        Err(Error::HandshakeTimeout)
    }

    /// Send one firmware packet and wait for its acknowledgement.
    ///
    /// The packet is written in paced chunks; a short write, a rejection or
    /// a missing acknowledgement each consume one attempt of the retry
    /// budget before the corresponding error surfaces. Unrecognized bytes
    /// during the wait are ignored; the display occasionally emits stray
    /// chatter between acknowledgements.
    pub fn send_packet(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(Error::Protocol(format!(
                "packet of {} bytes exceeds the {MAX_PACKET_SIZE}-byte maximum",
                data.len()
            )));
        }

        let snapshot = self.session.snapshot();
        let len = data.len() as u64;
        if snapshot.total_received + len > snapshot.expected_file_size {
            return Err(Error::Protocol(format!(
                "packet would exceed the announced file size ({} + {len} > {})",
                snapshot.total_received, snapshot.expected_file_size
            )));
        }

        self.port.set_timeout(self.config.poll_interval)?;
        self.session.update(|state| {
            state.upgrade = UpgradeState::Transferring;
            state.current_packet_size = data.len() as u32;
        });

        let retries = self.config.packet_retries.max(1);
        for attempt in 1..=retries {
            self.checkpoint()?;
            self.port.clear_buffers()?;

            let written = self.write_chunked(data)?;
            if written != data.len() {
                warn!(
                    "Short write ({written}/{} bytes) on attempt {attempt}/{retries}",
                    data.len()
                );
                if attempt < retries {
                    self.pause(self.config.short_write_pause)?;
                    continue;
                }
                self.session.update(|state| state.upgrade = UpgradeState::Error);
                return Err(Error::ShortWrite {
                    written,
                    expected: data.len(),
                });
            }

            match self.wait_packet_ack()? {
                PacketOutcome::Ack => {
                    self.session.update(|state| state.total_received += len);
                    trace!("Packet of {} bytes acknowledged", data.len());
                    return Ok(());
                },
                PacketOutcome::Rejected => {
                    warn!("Packet rejected on attempt {attempt}/{retries}");
                    if attempt < retries {
                        self.pause(self.config.reject_pause)?;
                        continue;
                    }
                    self.session.update(|state| state.upgrade = UpgradeState::Error);
                    return Err(Error::TransferRejected);
                },
                PacketOutcome::Timeout => {
                    warn!("No acknowledgement on attempt {attempt}/{retries}");
                },
            }
        }

        self.session.update(|state| state.upgrade = UpgradeState::Error);
        Err(Error::TransferTimeout)
    }

    /// Mark the upload complete once every announced byte was delivered.
    pub fn finish(&mut self) -> Result<()> {
        let snapshot = self.session.snapshot();
        if snapshot.total_received != snapshot.expected_file_size {
            return Err(Error::Protocol(format!(
                "transfer incomplete: {}/{} bytes delivered",
                snapshot.total_received, snapshot.expected_file_size
            )));
        }

        self.session.update(|state| state.upgrade = UpgradeState::Complete);
        info!("Upload complete: {} bytes", snapshot.total_received);
        Ok(())
    }

    fn send_command(&mut self, command: &Command) -> Result<()> {
        trace!("Sending command: {}", command.text());
        self.port.write_all_bytes(&command.encode())
    }

    /// Collect the probe response window and apply the hit test.
    fn collect_probe_window(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.config.probe_window;
        let mut window = Vec::new();
        let mut buf = [0u8; 64];

        while Instant::now() < deadline {
            self.checkpoint()?;
            match self.port.read(&mut buf) {
                Ok(n) if n > 0 => window.extend_from_slice(&buf[..n]),
                Ok(_) => {},
                Err(e) if is_poll_timeout(&e) => {},
                Err(e) => return Err(e.into()),
            }
        }

        if !window.is_empty() {
            trace!("Probe window: {:02X?}", window);
        }
        Ok(is_probe_hit(&window))
    }

    /// Wait for the single-byte handshake verdict.
    ///
    /// The first byte decides: anything other than ACK is a rejection.
    fn wait_handshake(&mut self) -> Result<HandshakeOutcome> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut buf = [0u8; 1];

        while Instant::now() < deadline {
            self.checkpoint()?;
            match self.port.read(&mut buf) {
                Ok(1) => {
                    trace!("Handshake byte: 0x{:02X}", buf[0]);
                    return Ok(if buf[0] == ACK_BYTE {
                        HandshakeOutcome::Ack
                    } else {
                        HandshakeOutcome::Rejected(buf[0])
                    });
                },
                Ok(_) => {},
                Err(e) if is_poll_timeout(&e) => {},
                Err(e) => return Err(e.into()),
            }
        }

        Ok(HandshakeOutcome::Timeout)
    }

    /// Wait for a packet acknowledgement; stray bytes keep the wait alive.
    fn wait_packet_ack(&mut self) -> Result<PacketOutcome> {
        let deadline = Instant::now() + self.config.ack_timeout;
        let mut buf = [0u8; 1];

        while Instant::now() < deadline {
            self.checkpoint()?;
            match self.port.read(&mut buf) {
                Ok(1) => match buf[0] {
                    ACK_BYTE => return Ok(PacketOutcome::Ack),
                    ERR_BYTE => return Ok(PacketOutcome::Rejected),
                    other => trace!("Ignoring stray byte 0x{other:02X}"),
                },
                Ok(_) => {},
                Err(e) if is_poll_timeout(&e) => {},
                Err(e) => return Err(e.into()),
            }
        }

        Ok(PacketOutcome::Timeout)
    }

    /// Write a packet in paced chunks, returning the byte count that
    /// actually reached the channel.
    fn write_chunked(&mut self, data: &[u8]) -> Result<usize> {
        let chunk_size = self.config.chunk_size.max(1);
        let mut written = 0;

        for chunk in data.chunks(chunk_size) {
            self.checkpoint()?;
            written += self.port.write(chunk)?;
            thread::sleep(self.config.chunk_pacing);
        }
        self.port.flush()?;

        Ok(written)
    }

    /// Read and discard whatever the display buffered.
    ///
    /// The display emits diagnostic bytes after a reset; they are logged
    /// and discarded, never interpreted.
    fn drain_input(&mut self) -> Result<usize> {
        let mut drained = 0;
        let mut buf = [0u8; 64];

        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    trace!("Drained: {:02X?}", &buf[..n]);
                    drained += n;
                },
                Err(e) if is_poll_timeout(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }

        if drained > 0 {
            debug!("Discarded {drained} bytes of display chatter");
        }
        Ok(drained)
    }

    /// Sleep cooperatively, honoring cancellation at poll granularity.
    fn pause(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let slice = self.config.poll_interval.max(Duration::from_millis(1));

        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(slice));
        }
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn is_poll_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    /// In-memory display simulator.
    ///
    /// Writes are accumulated until `flush`; a flushed unit ending in the
    /// three-byte terminator is parsed as a command, anything else counts
    /// as packet data. Replies are scripted per command kind.
    struct MockPort {
        baud: u32,
        timeout: Duration,
        read_buf: VecDeque<u8>,
        pending: Vec<u8>,
        /// Flushed units with the baud they were sent at.
        wire_log: Vec<(u32, Vec<u8>)>,
        baud_history: Vec<u32>,
        /// Baud at which the display answers the probe query.
        responds_at: Option<u32>,
        /// Bytes pushed back for a successful probe query.
        probe_reply: Vec<u8>,
        /// One scripted verdict per announce command; `None` stays silent.
        handshake_replies: VecDeque<Option<u8>>,
        /// One scripted verdict per fully-flushed packet; `None` stays silent.
        packet_replies: VecDeque<Option<u8>>,
        /// Chatter bytes delivered ahead of every packet verdict.
        chatter_before_verdict: Vec<u8>,
        /// Cap on bytes accepted per write call, to simulate short writes.
        write_cap: usize,
    }

    impl MockPort {
        fn new() -> Self {
            Self {
                baud: DEFAULT_BAUD,
                timeout: Duration::from_millis(1),
                read_buf: VecDeque::new(),
                pending: Vec::new(),
                wire_log: Vec::new(),
                baud_history: Vec::new(),
                responds_at: None,
                probe_reply: vec![0x66, 0x02, 0xFF, 0xFF, 0xFF],
                handshake_replies: VecDeque::new(),
                packet_replies: VecDeque::new(),
                chatter_before_verdict: Vec::new(),
                write_cap: usize::MAX,
            }
        }

        fn responding_at(baud: u32) -> Self {
            let mut port = Self::new();
            port.responds_at = Some(baud);
            port
        }

        fn commands_sent(&self, prefix: &str) -> usize {
            self.wire_log
                .iter()
                .filter(|(_, unit)| {
                    unit.ends_with(&[0xFF, 0xFF, 0xFF])
                        && unit.starts_with(prefix.as_bytes())
                })
                .count()
        }

        fn packets_sent(&self) -> usize {
            self.wire_log
                .iter()
                .filter(|(_, unit)| !unit.ends_with(&[0xFF, 0xFF, 0xFF]))
                .count()
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.read_buf.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.read_buf.len());
            for b in buf.iter_mut().take(n) {
                *b = self.read_buf.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.write_cap);
            self.pending.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if self.pending.is_empty() {
                return Ok(());
            }
            let unit = std::mem::take(&mut self.pending);
            self.wire_log.push((self.baud, unit.clone()));

            if unit.ends_with(&[0xFF, 0xFF, 0xFF]) {
                let text = String::from_utf8_lossy(&unit[..unit.len() - 3]).into_owned();
                if text == "get baud" {
                    if self.responds_at == Some(self.baud) {
                        let reply = self.probe_reply.clone();
                        self.read_buf.extend(reply);
                    }
                } else if text.starts_with("whmi-wri") {
                    if let Some(Some(verdict)) = self.handshake_replies.pop_front() {
                        self.read_buf.push_back(verdict);
                    }
                }
                // Probe, baud-set and reset commands draw no reply here.
            } else {
                let chatter = self.chatter_before_verdict.clone();
                if let Some(Some(verdict)) = self.packet_replies.pop_front() {
                    self.read_buf.extend(chatter);
                    self.read_buf.push_back(verdict);
                }
            }

            Ok(())
        }
    }

    impl Port for MockPort {
        fn set_timeout(&mut self, timeout: Duration) -> crate::Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_baud_rate(&mut self, baud_rate: u32) -> crate::Result<()> {
            self.baud = baud_rate;
            self.baud_history.push(baud_rate);
            Ok(())
        }

        fn baud_rate(&self) -> u32 {
            self.baud
        }

        fn bytes_to_read(&mut self) -> crate::Result<u32> {
            Ok(self.read_buf.len() as u32)
        }

        fn clear_buffers(&mut self) -> crate::Result<()> {
            self.read_buf.clear();
            Ok(())
        }

        fn name(&self) -> &str {
            "mock"
        }

        fn close(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    fn fast_config() -> UploadConfig {
        UploadConfig {
            probe_settle: Duration::from_millis(1),
            probe_window: Duration::from_millis(5),
            reset_settle: Duration::from_millis(1),
            handshake_timeout: Duration::from_millis(20),
            ack_timeout: Duration::from_millis(20),
            chunk_pacing: Duration::from_micros(10),
            short_write_pause: Duration::from_millis(1),
            reject_pause: Duration::from_millis(1),
            retry_pause: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            ..UploadConfig::default()
        }
    }

    fn ready_uploader(port: MockPort, expected: u64) -> Uploader<MockPort> {
        let uploader = Uploader::with_config(port, fast_config());
        let session = uploader.session();
        session.begin(expected);
        session.update(|state| {
            state.prepare = PrepareState::Done;
            state.upgrade = UpgradeState::Ready;
        });
        uploader
    }

    // ---- baud discovery ----

    #[test]
    fn test_discovery_returns_responding_rate() {
        for &rate in &[9_600u32, 115_200, 921_600] {
            let port = MockPort::responding_at(rate);
            let mut uploader = Uploader::with_config(port, fast_config());

            let found = uploader.discover_baud().unwrap();
            assert_eq!(found, Some(rate), "discovery should find {rate}");
        }
    }

    #[test]
    fn test_discovery_visits_candidates_in_order_and_stops_at_hit() {
        let port = MockPort::responding_at(57_600);
        let mut uploader = Uploader::with_config(port, fast_config());

        uploader.discover_baud().unwrap();

        let probed: Vec<u32> = uploader.port().baud_history.clone();
        assert_eq!(probed, vec![9_600, 19_200, 38_400, 57_600]);
    }

    #[test]
    fn test_discovery_silent_peer_probes_every_candidate() {
        let port = MockPort::new();
        let mut uploader = Uploader::with_config(port, fast_config());

        let found = uploader.discover_baud().unwrap();

        assert_eq!(found, None);
        assert_eq!(
            uploader.port().commands_sent("bauds="),
            BAUD_CANDIDATES.len()
        );
        assert_eq!(
            uploader.port().commands_sent("get baud"),
            BAUD_CANDIDATES.len()
        );
    }

    #[test]
    fn test_discovery_response_leading_with_terminator_is_a_miss() {
        let mut port = MockPort::responding_at(9_600);
        port.probe_reply = vec![0xFF, 0xFF, 0xFF];
        let mut uploader = Uploader::with_config(port, fast_config());

        // Bytes arrive at 9600, but the window leads with 0xFF: a miss.
        let found = uploader.discover_baud().unwrap();
        assert_eq!(found, None);
    }

    // ---- prepare sequence ----

    #[test]
    fn test_prepare_ack_on_first_attempt_targets_upload_speed() {
        let mut port = MockPort::responding_at(9_600);
        port.handshake_replies = VecDeque::from([Some(ACK_BYTE)]);
        let mut uploader = Uploader::with_config(port, fast_config());

        uploader.prepare(1024).unwrap();

        let state = uploader.session().snapshot();
        assert_eq!(state.prepare, PrepareState::Done);
        assert_eq!(state.upgrade, UpgradeState::Ready);
        assert_eq!(state.expected_file_size, 1024);
        assert_eq!(uploader.port().baud_rate(), UPLOAD_BAUD);
        assert_eq!(uploader.port().commands_sent("whmi-wri"), 1);
    }

    #[test]
    fn test_prepare_falls_back_to_default_speed_on_fifth_attempt() {
        let mut port = MockPort::responding_at(9_600);
        port.handshake_replies = VecDeque::from([
            Some(ERR_BYTE),
            Some(ERR_BYTE),
            Some(ERR_BYTE),
            Some(ERR_BYTE),
            Some(ACK_BYTE),
        ]);
        let mut uploader = Uploader::with_config(port, fast_config());

        uploader.prepare(4096).unwrap();

        let state = uploader.session().snapshot();
        assert_eq!(state.upgrade, UpgradeState::Ready);
        assert_eq!(uploader.port().baud_rate(), DEFAULT_BAUD);
        assert_eq!(uploader.port().commands_sent("whmi-wri"), 5);
    }

    #[test]
    fn test_prepare_persistent_rejection_fails_after_five_attempts() {
        let mut port = MockPort::responding_at(9_600);
        port.handshake_replies = VecDeque::from(vec![Some(ERR_BYTE); 5]);
        let mut uploader = Uploader::with_config(port, fast_config());

        let err = uploader.prepare(512).unwrap_err();

        assert!(matches!(err, Error::PeerRejected));
        let state = uploader.session().snapshot();
        assert_eq!(state.prepare, PrepareState::Error);
        assert_eq!(state.upgrade, UpgradeState::Error);
        assert_eq!(uploader.port().commands_sent("whmi-wri"), 5);
    }

    #[test]
    fn test_prepare_silent_handshake_times_out_after_five_attempts() {
        let port = MockPort::responding_at(9_600);
        let mut uploader = Uploader::with_config(port, fast_config());

        let err = uploader.prepare(512).unwrap_err();

        assert!(matches!(err, Error::HandshakeTimeout));
        assert_eq!(uploader.port().commands_sent("whmi-wri"), 5);
        assert_eq!(uploader.session().snapshot().upgrade, UpgradeState::Error);
    }

    #[test]
    fn test_prepare_discovery_failure_is_terminal() {
        let port = MockPort::new();
        let mut uploader = Uploader::with_config(port, fast_config());

        let err = uploader.prepare(512).unwrap_err();

        assert!(matches!(err, Error::DiscoveryFailed));
        // One discovery pass only; the sequence terminates rather than retry.
        assert_eq!(
            uploader.port().commands_sent("bauds="),
            BAUD_CANDIDATES.len()
        );
        assert_eq!(uploader.port().commands_sent("whmi-wri"), 0);
        assert_eq!(uploader.session().snapshot().prepare, PrepareState::Error);
    }

    #[test]
    fn test_prepare_sends_reset_before_baud_switch() {
        let mut port = MockPort::responding_at(9_600);
        port.handshake_replies = VecDeque::from([Some(ACK_BYTE)]);
        let mut uploader = Uploader::with_config(port, fast_config());

        uploader.prepare(64).unwrap();

        let texts: Vec<String> = uploader
            .port()
            .wire_log
            .iter()
            .filter(|(_, unit)| unit.ends_with(&[0xFF, 0xFF, 0xFF]))
            .map(|(_, unit)| String::from_utf8_lossy(&unit[..unit.len() - 3]).into_owned())
            .collect();

        let rest = texts.iter().position(|t| t == "rest").unwrap();
        let baud_set = texts
            .iter()
            .position(|t| t == &format!("baud={UPLOAD_BAUD}"))
            .unwrap();
        let announce = texts
            .iter()
            .position(|t| t == &format!("whmi-wri 64,{UPLOAD_BAUD},0"))
            .unwrap();
        assert!(rest < baud_set && baud_set < announce);
    }

    #[test]
    fn test_prepare_again_resets_session_counters() {
        let mut port = MockPort::responding_at(9_600);
        port.handshake_replies = VecDeque::from([Some(ACK_BYTE)]);
        port.packet_replies = VecDeque::from([Some(ACK_BYTE)]);
        let mut uploader = Uploader::with_config(port, fast_config());

        uploader.prepare(8).unwrap();
        uploader.send_packet(&[0u8; 8]).unwrap();
        uploader.finish().unwrap();
        assert_eq!(uploader.session().snapshot().total_received, 8);

        uploader.port_mut().handshake_replies = VecDeque::from([Some(ACK_BYTE)]);
        uploader.prepare(16).unwrap();

        let state = uploader.session().snapshot();
        assert_eq!(state.total_received, 0);
        assert_eq!(state.current_packet_size, 0);
        assert_eq!(state.expected_file_size, 16);
        assert_eq!(state.prepare, PrepareState::Done);
        assert_eq!(state.upgrade, UpgradeState::Ready);
    }

    #[test]
    fn test_prepare_cancelled_at_settle_boundary() {
        let mut port = MockPort::responding_at(9_600);
        port.handshake_replies = VecDeque::from([Some(ACK_BYTE)]);
        let mut uploader = Uploader::with_config(port, fast_config());

        uploader.cancel_token().cancel();
        let err = uploader.prepare(64).unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(uploader.session().snapshot().upgrade, UpgradeState::Error);
        // The channel is handed back drained at the fallback rate.
        assert_eq!(uploader.port().baud_rate(), DEFAULT_BAUD);
    }

    // ---- packet transfer ----

    #[test]
    fn test_send_packet_ack_on_first_write_pass() {
        let mut port = MockPort::new();
        port.packet_replies = VecDeque::from([Some(ACK_BYTE)]);
        let mut uploader = ready_uploader(port, 100);

        uploader.send_packet(&[0x42; 100]).unwrap();

        assert_eq!(uploader.port().packets_sent(), 1);
        let state = uploader.session().snapshot();
        assert_eq!(state.total_received, 100);
        assert_eq!(state.current_packet_size, 100);
        assert_eq!(state.upgrade, UpgradeState::Transferring);
    }

    #[test]
    fn test_send_packet_rejected_twice_then_acknowledged() {
        let mut port = MockPort::new();
        port.packet_replies = VecDeque::from([Some(ERR_BYTE), Some(ERR_BYTE), Some(ACK_BYTE)]);
        let mut uploader = ready_uploader(port, 50);

        uploader.send_packet(&[0x55; 50]).unwrap();

        assert_eq!(uploader.port().packets_sent(), 3);
        assert_eq!(uploader.session().snapshot().total_received, 50);
    }

    #[test]
    fn test_send_packet_silent_peer_exhausts_retry_budget() {
        let mut port = MockPort::new();
        port.packet_replies = VecDeque::from(vec![None; 3]);
        let mut uploader = ready_uploader(port, 32);

        let err = uploader.send_packet(&[0xAA; 32]).unwrap_err();

        assert!(matches!(err, Error::TransferTimeout));
        assert_eq!(uploader.port().packets_sent(), 3);
        let state = uploader.session().snapshot();
        assert_eq!(state.upgrade, UpgradeState::Error);
        assert_eq!(state.total_received, 0);
    }

    #[test]
    fn test_send_packet_persistent_rejection_fails() {
        let mut port = MockPort::new();
        port.packet_replies = VecDeque::from(vec![Some(ERR_BYTE); 3]);
        let mut uploader = ready_uploader(port, 32);

        let err = uploader.send_packet(&[0xAA; 32]).unwrap_err();

        assert!(matches!(err, Error::TransferRejected));
        assert_eq!(uploader.port().packets_sent(), 3);
    }

    #[test]
    fn test_send_packet_ignores_stray_bytes_while_waiting() {
        let mut port = MockPort::new();
        // Stray chatter arrives ahead of the verdict; it must not be read
        // as a rejection.
        port.chatter_before_verdict = vec![0x1A, 0x00, 0x71];
        port.packet_replies = VecDeque::from([Some(ACK_BYTE)]);
        let mut uploader = ready_uploader(port, 16);

        uploader.send_packet(&[0x01; 16]).unwrap();
        assert_eq!(uploader.port().packets_sent(), 1);
        assert_eq!(uploader.session().snapshot().total_received, 16);
    }

    #[test]
    fn test_send_packet_short_write_surfaces_after_retries() {
        let mut port = MockPort::new();
        port.write_cap = 10;
        let mut uploader = ready_uploader(port, 64);

        let err = uploader.send_packet(&[0x77; 64]).unwrap_err();

        match err {
            Error::ShortWrite { written, expected } => {
                assert!(written < expected);
                assert_eq!(expected, 64);
            },
            other => panic!("expected ShortWrite, got {other:?}"),
        }
        assert_eq!(uploader.session().snapshot().upgrade, UpgradeState::Error);
    }

    #[test]
    fn test_send_packet_writes_in_chunks() {
        let mut port = MockPort::new();
        port.packet_replies = VecDeque::from([Some(ACK_BYTE)]);
        let mut uploader = ready_uploader(port, 1000);

        uploader.send_packet(&[0x33; 1000]).unwrap();

        // One flushed unit carrying the full packet regardless of chunking.
        assert_eq!(uploader.port().packets_sent(), 1);
        let (_, unit) = uploader
            .port()
            .wire_log
            .iter()
            .find(|(_, unit)| !unit.ends_with(&[0xFF, 0xFF, 0xFF]))
            .unwrap();
        assert_eq!(unit.len(), 1000);
    }

    #[test]
    fn test_send_packet_rejects_oversize_packet() {
        let port = MockPort::new();
        let mut uploader = ready_uploader(port, 10_000);

        let err = uploader.send_packet(&vec![0u8; MAX_PACKET_SIZE + 1]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(uploader.port().packets_sent(), 0);
    }

    #[test]
    fn test_send_packet_enforces_announced_size() {
        let port = MockPort::new();
        let mut uploader = ready_uploader(port, 10);

        let err = uploader.send_packet(&[0u8; 20]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(uploader.port().packets_sent(), 0);
    }

    #[test]
    fn test_send_packet_empty_is_a_no_op() {
        let port = MockPort::new();
        let mut uploader = ready_uploader(port, 10);

        uploader.send_packet(&[]).unwrap();
        assert_eq!(uploader.port().packets_sent(), 0);
        assert_eq!(uploader.session().snapshot().total_received, 0);
    }

    // ---- finish ----

    #[test]
    fn test_finish_requires_full_delivery() {
        let mut port = MockPort::new();
        port.packet_replies = VecDeque::from([Some(ACK_BYTE)]);
        let mut uploader = ready_uploader(port, 100);

        uploader.send_packet(&[0x11; 60]).unwrap();
        assert!(matches!(uploader.finish(), Err(Error::Protocol(_))));

        uploader.port_mut().packet_replies = VecDeque::from([Some(ACK_BYTE)]);
        uploader.send_packet(&[0x11; 40]).unwrap();
        uploader.finish().unwrap();

        assert_eq!(uploader.session().snapshot().upgrade, UpgradeState::Complete);
    }

    // ---- configuration ----

    #[test]
    fn test_upload_config_defaults() {
        let config = UploadConfig::default();
        assert_eq!(config.prepare_attempts, 5);
        assert_eq!(config.packet_retries, 3);
        assert_eq!(config.chunk_size, WRITE_CHUNK_SIZE);
        assert_eq!(config.upload_baud, UPLOAD_BAUD);
        assert_eq!(config.default_baud, DEFAULT_BAUD);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_upload_config_builders() {
        let config = UploadConfig::default()
            .with_upload_baud(115_200)
            .with_attempts(2)
            .with_packet_retries(1);
        assert_eq!(config.upload_baud, 115_200);
        assert_eq!(config.prepare_attempts, 2);
        assert_eq!(config.packet_retries, 1);
    }
}
