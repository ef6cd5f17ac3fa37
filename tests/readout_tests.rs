//! End-to-end tests of the module lifecycle against a mock board: a control
//! server answering JSON commands on one socket, and the test itself playing
//! the board's data side on the other.

use crossbeam_channel::{bounded, Receiver};
use ctb_driver::word::Word;
use ctb_driver::{CtbModule, HsiEvent, HsiFrame, HsiOutputs};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ctb_driver=debug")),
        )
        .with_test_writer()
        .try_init();
}

// --- Test Helpers ---

/// Minimal control-side board: accepts one connection and answers every
/// request with an empty feedback array, recording what it received.
struct MockBoard {
    port: u16,
    received: Arc<Mutex<Vec<String>>>,
}

impl MockBoard {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock board");
        let port = listener.local_addr().expect("local addr").port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        thread::spawn(move || {
            let (mut stream, _) = match listener.accept() {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let mut buf = [0u8; 8192];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 {
                    break;
                }
                received_clone
                    .lock()
                    .expect("received lock")
                    .push(String::from_utf8_lossy(&buf[..n]).to_string());
                if stream.write_all(br#"{"feedback":[]}"#).is_err() {
                    break;
                }
            }
        });
        MockBoard { port, received }
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().expect("received lock").clone()
    }
}

/// A free TCP port for the data acceptor.
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("probe port")
        .local_addr()
        .expect("local addr")
        .port()
}

fn make_outputs() -> (
    HsiOutputs,
    Receiver<HsiFrame>,
    Receiver<HsiFrame>,
    Receiver<HsiEvent>,
) {
    let (llt_tx, llt_rx) = bounded(64);
    let (hlt_tx, hlt_rx) = bounded(64);
    let (ev_tx, ev_rx) = bounded(64);
    (
        HsiOutputs {
            llt: llt_tx,
            hlt: hlt_tx,
            events: ev_tx,
        },
        llt_rx,
        hlt_rx,
        ev_rx,
    )
}

fn make_conf(control_port: u16, receiver_port: u16, calib_dir: &str, report_dir: &str) -> Value {
    json!({
        "ctb_hostname": "127.0.0.1",
        "control_connection_port": control_port,
        "receiver_connection_timeout": 5000,
        "calibration_stream_output": calib_dir,
        "calibration_update": 60,
        "run_trigger_output": report_dir,
        "board_config": {
            "ctb": {
                "sockets": {
                    "receiver": { "port": receiver_port, "host": "", "rollover": 50000 }
                },
                "misc": {
                    "randomtrigger_1": { "enable": true },
                    "randomtrigger_2": { "enable": true }
                },
                "HLT": {
                    "trigger": [
                        { "id": "HLT_1", "enable": true },
                        { "id": "HLT_2", "enable": false }
                    ]
                },
                "subsystems": {
                    "crt": { "triggers": [ { "id": "LLT_2", "enable": true } ] },
                    "beam": { "triggers": [ { "id": "LLT_3", "enable": true } ] }
                }
            }
        }
    })
}

/// Dial the driver's data acceptor, retrying while the worker binds it.
fn connect_as_board(port: u16) -> TcpStream {
    let deadline = Instant::now() + RECV_TIMEOUT;
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(e) => {
                if Instant::now() >= deadline {
                    panic!("data acceptor never came up on port {port}: {e}");
                }
                thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

/// One framed packet: 4-byte size header followed by the raw words.
fn send_packet(stream: &mut TcpStream, words: &[Word]) {
    let size = (words.len() * Word::SIZE) as u32;
    let mut packet = size.to_le_bytes().to_vec();
    for word in words {
        packet.extend_from_slice(word.raw());
    }
    stream.write_all(&packet).expect("send packet");
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

// --- Scenarios ---

#[test]
fn hlt_correlates_with_preceding_llt() {
    init_tracing();
    let board = MockBoard::start();
    let receiver_port = free_port();
    let report_dir = tempfile::tempdir().expect("tempdir");

    let (outputs, llt_rx, hlt_rx, ev_rx) = make_outputs();
    let mut module = CtbModule::new();
    module.init(outputs);
    module
        .conf(&make_conf(
            board.port,
            receiver_port,
            "",
            report_dir.path().to_str().expect("utf8 path"),
        ))
        .expect("conf");
    module.start(7).expect("start");

    let mut data = connect_as_board(receiver_port);
    send_packet(
        &mut data,
        &[
            Word::timestamp_word(0x0F00_0000_0000_0000),
            Word::channel_status_word(0x0A, 0x1, 0x2, 0x3),
            Word::llt(0x0B, 0x5),
            Word::hlt(0x0C, 0x3),
        ],
    );

    let llt_frame = llt_rx.recv_timeout(RECV_TIMEOUT).expect("LLT frame");
    assert_eq!(llt_frame.header, 0x0000_0041);
    assert_eq!(llt_frame.timestamp, 0x0B);
    assert_eq!(llt_frame.payload, (0x3 << 48) | (0x2 << 16) | 0x1);
    assert_eq!(llt_frame.trigger_map, 0x5);
    assert_eq!(llt_frame.sequence, 1);

    let hlt_frame = hlt_rx.recv_timeout(RECV_TIMEOUT).expect("HLT frame");
    assert_eq!(hlt_frame.header, 0x0400_0041);
    assert_eq!(hlt_frame.timestamp, 0x0C);
    assert_eq!(hlt_frame.payload, 0x5);
    assert_eq!(hlt_frame.trigger_map, 0x3);
    assert_eq!(hlt_frame.sequence, 1);

    let event = ev_rx.recv_timeout(RECV_TIMEOUT).expect("HSI event");
    assert_eq!(event.device_id, 0x1);
    assert_eq!(event.trigger_map, 0x3);
    assert_eq!(event.timestamp, 0x0C);
    assert_eq!(event.sequence, 1);
    assert_eq!(event.run_number, 7);

    // The board closes the data link once told to stop.
    drop(data);
    module.stop().expect("stop");

    let info = module.telemetry();
    assert_eq!(info.counters.total_hlt_count, 1);
    assert_eq!(info.counters.ts_word_count, 1);
    assert_eq!(info.counters.last_readout_timestamp, 0x0C);
    // HLT trigger word 0x3: bits 0 and 1, both tracked.
    assert_eq!(info.counters.hlt_counts.get(&0), Some(&1));
    assert_eq!(info.counters.hlt_counts.get(&1), Some(&1));
    // LLT trigger word 0x5: bits 0 and 2, both tracked.
    assert_eq!(info.counters.llt_counts.get(&0), Some(&1));
    assert_eq!(info.counters.llt_counts.get(&2), Some(&1));
    assert!(!info.ctb_hardware_run_status);
    assert!(info.ctb_hardware_configuration_status);

    // Control traffic: configuration blob, StartRun, StopRun.
    let received = board.received();
    assert_eq!(received.len(), 3);
    assert!(received[0].contains("\"ctb\""));
    assert_eq!(received[1], r#"{"command":"StartRun"}"#);
    assert_eq!(received[2], r#"{"command":"StopRun"}"#);

    // Run-trigger report written with the pre-reset counters.
    let report = std::fs::read_to_string(report_dir.path().join("run_7_triggers.txt"))
        .expect("read report");
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines[0], "Good Part\t 0");
    assert_eq!(lines[1], "Total HLT\t 1");
    assert_eq!(lines[2], "HLT 0 \t 1");
    assert_eq!(lines[3], "HLT 1 \t 1");
}

#[test]
fn adjacency_miss_yields_zero_payload() {
    init_tracing();
    let board = MockBoard::start();
    let receiver_port = free_port();

    let (outputs, _llt_rx, hlt_rx, _ev_rx) = make_outputs();
    let mut module = CtbModule::new();
    module.init(outputs);
    module
        .conf(&make_conf(board.port, receiver_port, "", ""))
        .expect("conf");
    module.start(1).expect("start");

    let mut data = connect_as_board(receiver_port);
    // HLT two ticks after the LLT: outside the adjacency rule.
    send_packet(
        &mut data,
        &[
            Word::timestamp_word(0),
            Word::llt(100, 0x1),
            Word::hlt(102, 0x1),
        ],
    );

    let hlt_frame = hlt_rx.recv_timeout(RECV_TIMEOUT).expect("HLT frame");
    assert_eq!(hlt_frame.payload, 0);
    assert_eq!(hlt_frame.trigger_map, 0x1);

    drop(data);
    module.stop().expect("stop");
    assert_eq!(module.telemetry().counters.total_hlt_count, 1);
}

#[test]
fn feedback_word_latches_error_state() {
    init_tracing();
    let board = MockBoard::start();
    let receiver_port = free_port();

    let (outputs, _llt_rx, _hlt_rx, _ev_rx) = make_outputs();
    let mut module = CtbModule::new();
    module.init(outputs);
    module
        .conf(&make_conf(board.port, receiver_port, "", ""))
        .expect("conf");
    module.start(2).expect("start");

    let mut data = connect_as_board(receiver_port);
    send_packet(
        &mut data,
        &[
            Word::timestamp_word(10),
            Word::feedback_word(11, 0xBEEF, 0x0002),
        ],
    );

    assert!(
        wait_until(RECV_TIMEOUT, || module.error_state()),
        "feedback word never latched the error state"
    );

    // Board side drops the link; the worker holds position until stop.
    drop(data);
    module.stop().expect("stop");
    assert!(module.error_state());
    assert!(!module.is_running());
}

#[test]
fn stop_during_accept_returns_promptly() {
    init_tracing();
    let board = MockBoard::start();
    let receiver_port = free_port();

    let (outputs, _llt_rx, _hlt_rx, _ev_rx) = make_outputs();
    let mut module = CtbModule::new();
    module.init(outputs);
    module
        .conf(&make_conf(board.port, receiver_port, "", ""))
        .expect("conf");
    module.start(3).expect("start");

    // No peer ever connects; stop must cancel the pending accept.
    let begin = Instant::now();
    module.stop().expect("stop");
    assert!(begin.elapsed() < Duration::from_secs(1));

    let received = board.received();
    assert_eq!(received.len(), 3);
    assert_eq!(received[1], r#"{"command":"StartRun"}"#);
    assert_eq!(received[2], r#"{"command":"StopRun"}"#);
}

#[test]
fn unknown_tags_pass_through_calibration_only() {
    init_tracing();
    let board = MockBoard::start();
    let receiver_port = free_port();
    let calib_dir = tempfile::tempdir().expect("tempdir");

    let (outputs, llt_rx, hlt_rx, _ev_rx) = make_outputs();
    let mut module = CtbModule::new();
    module.init(outputs);
    module
        .conf(&make_conf(
            board.port,
            receiver_port,
            calib_dir.path().to_str().expect("utf8 path"),
            "",
        ))
        .expect("conf");
    module.start(4).expect("start");

    let mut data = connect_as_board(receiver_port);
    let words = [
        Word::timestamp_word(1),
        Word::with_tag(0x5, 2),
        Word::with_tag(0x4, 3), // checksum
    ];
    send_packet(&mut data, &words);

    // The calibration stream is the progress probe: all three words land in
    // it verbatim, in order.
    let expected: Vec<u8> = words.iter().flat_map(|w| w.raw().to_vec()).collect();
    let calib_content = || -> Vec<u8> {
        std::fs::read_dir(calib_dir.path())
            .expect("read dir")
            .filter_map(|e| std::fs::read(e.expect("entry").path()).ok())
            .flatten()
            .collect()
    };
    assert!(
        wait_until(RECV_TIMEOUT, || calib_content() == expected),
        "calibration stream never received the words"
    );

    drop(data);
    module.stop().expect("stop");

    // No frames, no trigger counters for the unrecognized tags.
    assert!(llt_rx.try_recv().is_err());
    assert!(hlt_rx.try_recv().is_err());
    let info = module.telemetry();
    assert_eq!(info.counters.total_hlt_count, 0);
    assert_eq!(info.counters.ts_word_count, 1);
}

#[test]
fn sequence_numbers_count_per_run() {
    init_tracing();
    let board = MockBoard::start();
    let receiver_port = free_port();

    let (outputs, llt_rx, hlt_rx, _ev_rx) = make_outputs();
    let mut module = CtbModule::new();
    module.init(outputs);
    module
        .conf(&make_conf(board.port, receiver_port, "", ""))
        .expect("conf");
    module.start(5).expect("start");

    let mut data = connect_as_board(receiver_port);
    // Two LLT/HLT pairs across two packets.
    send_packet(
        &mut data,
        &[Word::llt(100, 0x1), Word::hlt(101, 0x1)],
    );
    send_packet(
        &mut data,
        &[Word::llt(200, 0x4), Word::hlt(201, 0x2)],
    );

    let first_llt = llt_rx.recv_timeout(RECV_TIMEOUT).expect("LLT frame 1");
    let second_llt = llt_rx.recv_timeout(RECV_TIMEOUT).expect("LLT frame 2");
    assert_eq!((first_llt.sequence, second_llt.sequence), (1, 2));

    let first_hlt = hlt_rx.recv_timeout(RECV_TIMEOUT).expect("HLT frame 1");
    let second_hlt = hlt_rx.recv_timeout(RECV_TIMEOUT).expect("HLT frame 2");
    assert_eq!((first_hlt.sequence, second_hlt.sequence), (1, 2));
    // Each HLT matched the LLT one tick earlier.
    assert_eq!(first_hlt.payload, 0x1);
    assert_eq!(second_hlt.payload, 0x4);

    drop(data);
    module.stop().expect("stop");
    assert_eq!(module.telemetry().counters.total_hlt_count, 2);
}
