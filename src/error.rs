//! Error kinds shared across the driver.

use thiserror::Error;

/// Top-level error type for lifecycle commands and the readout path.
#[derive(Debug, Error)]
pub enum CtbError {
    /// Malformed or unresolvable configuration. Fatal for `conf`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Control-socket write/read/parse failure, or the board reported an
    /// error in its feedback array. Fatal for the issuing lifecycle command.
    #[error("CTB hardware communication error: {0}")]
    ControlCommunication(String),

    /// Data-socket accept/read/shutdown failure. Terminal for the readout;
    /// the module stays configured and waits for a fresh `stop`.
    #[error("CTB data stream error: {0}")]
    DataCommunication(String),

    /// A trigger word arrived without an adjacent causing input in the
    /// two-slot window. The readout continues with payload 0.
    #[error("no {input_kind} match found for trigger TS {trigger_ts} ({input_kind} TS prev={prev_ts} prev_prev={prev_prev_ts})")]
    WordMatch {
        input_kind: &'static str,
        trigger_ts: u64,
        prev_ts: u64,
        prev_prev_ts: u64,
    },

    /// An output channel or internal buffer declined a word; the word is
    /// dropped and the failed-send counter incremented.
    #[error("CTB buffer issue: {0}")]
    BufferOverflow(String),

    /// The board pushed a feedback word; the run is latched into the error
    /// state and the data socket is half-closed on readout termination.
    #[error("board feedback: code {code:#06x} source {source_id:#06x}")]
    FeedbackObserved { code: u16, source_id: u16 },
}
