// Typed view of the configuration blob delivered by the framework at `conf`.
// The blob is decoded once into these records; the `board_config` subtree is
// forwarded back to the board verbatim (unknown fields survive through the
// flattened maps), with `receiver.host` overwritten by the local hostname.

use crate::error::CtbError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Number of per-bit HLT counters carried in the run-trigger report.
pub const HLT_REPORT_SLOTS: usize = 8;

// Per-bit counters only make sense for bits that fit the 32-bit trigger map.
const MAX_TRIGGER_SLOT: u32 = 32;

fn default_receiver_timeout() -> u64 {
    10_000
}

fn default_calibration_update() -> u64 {
    5
}

/// Module configuration, mirroring the framework's JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conf {
    /// Control-channel endpoint of the board.
    pub ctb_hostname: String,
    pub control_connection_port: u16,
    /// Poll cadence for the pending data-socket accept, in microseconds.
    #[serde(default = "default_receiver_timeout")]
    pub receiver_connection_timeout: u64,
    /// Directory for the raw calibration stream; empty disables it.
    #[serde(default)]
    pub calibration_stream_output: String,
    /// Calibration file rotation interval, in minutes.
    #[serde(default = "default_calibration_update")]
    pub calibration_update: u64,
    /// Directory for per-run trigger reports; empty disables them.
    #[serde(default)]
    pub run_trigger_output: String,
    pub board_config: BoardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    pub ctb: Ctb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ctb {
    pub sockets: Sockets,
    pub misc: Misc,
    #[serde(rename = "HLT")]
    pub hlt: HltConfig,
    pub subsystems: Subsystems,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sockets {
    pub receiver: ReceiverSocket,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverSocket {
    /// Local listen port for the data stream; also forwarded to the board.
    pub port: u16,
    /// Filled in with the local hostname before forwarding.
    #[serde(default)]
    pub host: String,
    /// Board clock rollover parameter; informational.
    #[serde(default)]
    pub rollover: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Misc {
    /// Random HLT generator; when enabled its counts land in HLT slot 0.
    pub randomtrigger_1: TriggerEnable,
    /// Random LLT generator; when enabled its counts land in LLT slot 0.
    pub randomtrigger_2: TriggerEnable,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEnable {
    pub enable: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HltConfig {
    #[serde(default)]
    pub trigger: Vec<TriggerEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subsystems {
    pub crt: Subsystem,
    pub beam: Subsystem,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subsystem {
    #[serde(default)]
    pub triggers: Vec<TriggerEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One trigger definition: a counter exists for it iff `enable` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEntry {
    pub id: String,
    pub enable: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Conf {
    pub fn receiver_timeout(&self) -> Duration {
        Duration::from_micros(self.receiver_connection_timeout)
    }

    pub fn calibration_interval(&self) -> Duration {
        Duration::from_secs(self.calibration_update * 60)
    }

    pub fn has_calibration_stream(&self) -> bool {
        !self.calibration_stream_output.is_empty()
    }

    pub fn has_run_trigger_report(&self) -> bool {
        !self.run_trigger_output.is_empty()
    }

    /// Counter slots tracked for HLTs: slot 0 for the random trigger, plus
    /// every enabled `HLT_n` entry.
    pub fn enabled_hlt_bits(&self) -> Vec<u32> {
        let ctb = &self.board_config.ctb;
        let mut bits = Vec::new();
        if ctb.misc.randomtrigger_1.enable {
            bits.push(0);
        }
        collect_trigger_bits(&ctb.hlt.trigger, "HLT_", &mut bits);
        bits
    }

    /// Counter slots tracked for LLTs: slot 0 for the random trigger, plus
    /// every enabled `LLT_n` entry of the CRT and beam subsystems.
    pub fn enabled_llt_bits(&self) -> Vec<u32> {
        let ctb = &self.board_config.ctb;
        let mut bits = Vec::new();
        if ctb.misc.randomtrigger_2.enable {
            bits.push(0);
        }
        collect_trigger_bits(&ctb.subsystems.crt.triggers, "LLT_", &mut bits);
        collect_trigger_bits(&ctb.subsystems.beam.triggers, "LLT_", &mut bits);
        bits
    }

    /// The JSON document sent to the board at `conf`: the `board_config`
    /// subtree with `receiver.host` replaced by the local hostname.
    pub fn board_config_json(&self) -> Result<String, CtbError> {
        let mut forwarded = self.board_config.clone();
        forwarded.ctb.sockets.receiver.host = local_hostname();
        serde_json::to_string(&forwarded)
            .map_err(|e| CtbError::Configuration(format!("cannot serialize board config: {e}")))
    }
}

fn collect_trigger_bits(entries: &[TriggerEntry], prefix: &str, bits: &mut Vec<u32>) {
    for entry in entries {
        if !entry.enable {
            continue;
        }
        match trigger_slot(&entry.id, prefix) {
            Some(slot) if slot < MAX_TRIGGER_SLOT => bits.push(slot),
            _ => tracing::warn!(id = %entry.id, "ignoring trigger with unrecognized id"),
        }
    }
}

// "HLT_3" -> 3 under prefix "HLT_".
fn trigger_slot(id: &str, prefix: &str) -> Option<u32> {
    id.strip_prefix(prefix)?.parse().ok()
}

/// The machine's hostname, as the board should dial it back for data.
pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes a NUL-terminated name into the buffer we
    // own; the length passed matches the buffer.
    let res = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if res != 0 {
        return "localhost".to_string();
    }
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..nul]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "ctb_hostname": "np04-ctb-1",
            "control_connection_port": 8991,
            "receiver_connection_timeout": 1000,
            "calibration_stream_output": "",
            "run_trigger_output": "",
            "board_config": {
                "ctb": {
                    "sockets": {
                        "receiver": { "port": 8992, "host": "daq-host", "rollover": 50000 }
                    },
                    "misc": {
                        "randomtrigger_1": { "enable": true, "period": 100000 },
                        "randomtrigger_2": { "enable": false }
                    },
                    "HLT": {
                        "trigger": [
                            { "id": "HLT_1", "enable": true },
                            { "id": "HLT_2", "enable": false },
                            { "id": "HLT_7", "enable": true }
                        ]
                    },
                    "subsystems": {
                        "crt": { "triggers": [ { "id": "LLT_11", "enable": true } ] },
                        "beam": { "triggers": [ { "id": "LLT_3", "enable": true },
                                                 { "id": "LLT_4", "enable": false } ] }
                    }
                }
            }
        })
    }

    #[test]
    fn parses_and_enumerates_enabled_bits() {
        let conf: Conf = serde_json::from_value(sample()).expect("conf parses");
        assert_eq!(conf.receiver_timeout(), Duration::from_micros(1000));
        assert_eq!(conf.calibration_interval(), Duration::from_secs(5 * 60));
        assert!(!conf.has_calibration_stream());
        assert!(!conf.has_run_trigger_report());
        assert_eq!(conf.enabled_hlt_bits(), vec![0, 1, 7]);
        assert_eq!(conf.enabled_llt_bits(), vec![11, 3]);
    }

    #[test]
    fn round_trips_modulo_receiver_host() {
        let original = sample();
        let conf: Conf = serde_json::from_value(original.clone()).expect("conf parses");
        let back = serde_json::to_value(&conf).expect("conf serializes");
        // The driver only rewrites receiver.host on the forwarded copy; the
        // decoded record itself round-trips the board subtree exactly.
        assert_eq!(back["ctb_hostname"], original["ctb_hostname"]);
        assert_eq!(back["board_config"], original["board_config"]);
    }

    #[test]
    fn unknown_board_fields_survive_forwarding() {
        let conf: Conf = serde_json::from_value(sample()).expect("conf parses");
        let blob = conf.board_config_json().expect("board config serializes");
        let forwarded: Value = serde_json::from_str(&blob).expect("blob is JSON");
        assert_eq!(forwarded["ctb"]["misc"]["randomtrigger_1"]["period"], json!(100000));
        assert_eq!(forwarded["ctb"]["sockets"]["receiver"]["rollover"], json!(50000));
        assert_eq!(
            forwarded["ctb"]["sockets"]["receiver"]["host"],
            json!(local_hostname())
        );
    }

    #[test]
    fn trigger_slot_parses_ids() {
        assert_eq!(trigger_slot("HLT_5", "HLT_"), Some(5));
        assert_eq!(trigger_slot("LLT_12", "LLT_"), Some(12));
        assert_eq!(trigger_slot("HLT_x", "HLT_"), None);
        assert_eq!(trigger_slot("LLT_5", "HLT_"), None);
    }
}
