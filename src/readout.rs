// The readout worker: owns the data socket for the lifetime of a run, parses
// the framed word stream, drives the correlation engine, and pushes HSI
// frames to the output channels. Runs on its own thread, spawned at `start`
// and joined at `stop`.

use crate::calibration::CalibrationSink;
use crate::correlate::TriggerMatcher;
use crate::error::CtbError;
use crate::hsi::{HsiEvent, HsiFrame};
use crate::module::HsiOutputs;
use crate::stats::RunCounters;
use crate::word::{self, ReadError, Word, WordKind};
use crossbeam_channel::{Sender, TrySendError};
use std::io::ErrorKind;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

// Back-off while waiting for the stop handshake in the exit epilogue.
const EPILOGUE_POLL: Duration = Duration::from_micros(100);

pub(crate) struct ReadoutWorker {
    pub port: u16,
    pub accept_poll: Duration,
    pub run_number: u32,
    pub counters: Arc<RunCounters>,
    pub outputs: HsiOutputs,
    pub stop_requested: Arc<AtomicBool>,
    pub is_running: Arc<AtomicBool>,
    pub error_state: Arc<AtomicBool>,
    pub calibration: Option<CalibrationSink>,
}

impl ReadoutWorker {
    pub fn run(mut self) {
        let Some(mut stream) = self.accept_data_connection() else {
            return;
        };
        self.read_loop(&mut stream);
        self.epilogue(stream);
        debug!("end of readout loop: stop receiving data from the CTB");
    }

    // Bind the acceptor and poll it at the configured cadence so an external
    // stop can cancel the wait before any peer connects.
    fn accept_data_connection(&self) -> Option<TcpStream> {
        let listener = match TcpListener::bind(("0.0.0.0", self.port)) {
            Ok(l) => l,
            Err(e) => {
                error!(port = self.port, error = %e, "cannot bind data acceptor");
                return None;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            error!(error = %e, "cannot make data acceptor non-blocking");
            return None;
        }
        info!(port = self.port, "waiting for an incoming connection");

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                debug!("stop requested while waiting for the data connection");
                return None;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    info!(%peer, "connection received: start reading");
                    if let Err(e) = stream.set_nonblocking(false) {
                        error!(error = %e, "cannot make data socket blocking");
                        return None;
                    }
                    return Some(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(self.accept_poll);
                }
                Err(e) => {
                    error!(error = %e, "data accept failed");
                    return None;
                }
            }
        }
    }

    fn read_loop(&mut self, stream: &mut TcpStream) {
        let mut matcher = TriggerMatcher::new();

        'packets: while !self.stop_requested.load(Ordering::SeqCst) {
            if let Some(cal) = self.calibration.as_mut() {
                cal.maybe_rotate();
            }

            let header = match word::read_packet_header(stream) {
                Ok(h) => h,
                Err(e) => {
                    report_read_error(&e, "packet header");
                    break;
                }
            };
            if !header.is_word_aligned() {
                warn!(packet_size = header.packet_size, "packet size not word-aligned");
            }
            let n_words = header.n_words();
            self.counters.record_buffer_count(n_words as u64);

            for _ in 0..n_words {
                // Cancellation mid-packet discards the rest of the packet.
                if self.stop_requested.load(Ordering::SeqCst) {
                    break 'packets;
                }
                let word = match word::read_word(stream) {
                    Ok(w) => w,
                    Err(e) => {
                        report_read_error(&e, "word");
                        break 'packets;
                    }
                };
                if let Some(cal) = self.calibration.as_mut() {
                    cal.append(&word);
                }
                self.dispatch(&word, &mut matcher);
            }
        }
    }

    fn dispatch(&self, word: &Word, matcher: &mut TriggerMatcher) {
        match word.kind() {
            WordKind::Timestamp => {
                self.counters.ts_words.fetch_add(1, Ordering::Relaxed);
                trace!(ts = word.timestamp(), "received timestamp word");
                matcher.record_timestamp(word.timestamp());
            }
            WordKind::Feedback => self.handle_feedback(word),
            WordKind::Hlt => self.handle_hlt(word, matcher),
            WordKind::Llt => self.handle_llt(word, matcher),
            WordKind::ChannelStatus => {
                self.counters.run_channel_status.fetch_add(1, Ordering::Relaxed);
                trace!("received channel status word");
                matcher.record_channel_status(&word.channel_status());
            }
            // Checksum and unknown tags only pass through the calibration
            // stream; nothing else to do.
            WordKind::Checksum | WordKind::Unknown(_) => {
                trace!(word_type = word.word_type(), "ignoring word");
            }
        }
    }

    fn handle_feedback(&self, word: &Word) {
        self.error_state.store(true, Ordering::SeqCst);
        let fb = word.feedback();
        let issue = CtbError::FeedbackObserved {
            code: fb.code,
            source_id: fb.source,
        };
        error!(
            ts = fb.timestamp,
            padding = fb.padding,
            error = %issue,
            "feedback word: run latched into error state"
        );
    }

    fn handle_hlt(&self, word: &Word, matcher: &mut TriggerMatcher) {
        debug!("received HLT word");
        let timestamp = word.timestamp();
        let trigger_word = word.trigger_word();
        let sequence = self.counters.run_hlt.fetch_add(1, Ordering::Relaxed) as u32 + 1;
        self.counters
            .last_readout_hlt_timestamp
            .store(timestamp, Ordering::Relaxed);

        // Find the LLT which caused this trigger.
        let llt_payload = match matcher.match_hlt(timestamp) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "HLT correlation miss");
                0
            }
        };

        let frame = HsiFrame::hlt(timestamp, llt_payload, trigger_word, sequence);
        trace!(?frame, "formed HSI frame for HLT");
        self.push_frame(&self.outputs.hlt, frame, "HLT");

        let event = HsiEvent {
            device_id: 0x1,
            trigger_map: trigger_word as u32,
            timestamp,
            sequence,
            run_number: self.run_number,
        };
        self.push_event(event);

        self.counters.total_hlt.fetch_add(1, Ordering::Relaxed);
        self.counters.count_hlt_bits(trigger_word);
    }

    fn handle_llt(&self, word: &Word, matcher: &mut TriggerMatcher) {
        debug!("received LLT word");
        let timestamp = word.timestamp();
        let trigger_word = word.trigger_word();
        let sequence = self.counters.run_llt.fetch_add(1, Ordering::Relaxed) as u32 + 1;

        // Find the channel-status snapshot which caused this trigger.
        let channel_payload = match matcher.match_llt(timestamp) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "LLT correlation miss");
                0
            }
        };

        let frame = HsiFrame::llt(timestamp, channel_payload, trigger_word, sequence);
        trace!(?frame, "formed HSI frame for LLT");
        self.push_frame(&self.outputs.llt, frame, "LLT");

        // Only now does this LLT become a match candidate for later HLTs.
        matcher.record_llt(timestamp, trigger_word);
        self.counters.count_llt_bits(trigger_word);
    }

    fn push_frame(&self, sender: &Sender<HsiFrame>, frame: HsiFrame, label: &str) {
        match sender.try_send(frame) {
            Ok(()) => {
                self.counters
                    .last_sent_timestamp
                    .store(frame.timestamp, Ordering::Relaxed);
            }
            Err(e) => {
                let cause = match e {
                    TrySendError::Full(_) => "full",
                    TrySendError::Disconnected(_) => "disconnected",
                };
                let issue =
                    CtbError::BufferOverflow(format!("{label} output channel {cause}"));
                warn!(error = %issue, "dropping HSI frame");
                self.counters.failed_sends.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn push_event(&self, event: HsiEvent) {
        if self.outputs.events.try_send(event).is_err() {
            let issue = CtbError::BufferOverflow("event channel declined HSI event".to_string());
            warn!(error = %issue, "dropping HSI event");
            self.counters.failed_sends.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Hold the data socket until the board has acknowledged the stop, then
    // release it; a latched error state half-closes the send direction first.
    fn epilogue(&self, stream: TcpStream) {
        while self.is_running.load(Ordering::SeqCst) {
            thread::sleep(EPILOGUE_POLL);
        }
        if self.error_state.load(Ordering::SeqCst) {
            if let Err(e) = stream.shutdown(Shutdown::Write) {
                error!(error = %e, "error in data socket shutdown");
            }
        }
        drop(stream);
    }
}

fn report_read_error(err: &ReadError, what: &str) {
    let issue = CtbError::DataCommunication(format!("reading {what}: {err}"));
    error!(error = %issue, "data stream terminated");
}
