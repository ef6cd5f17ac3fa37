// Wire codec for the board's data stream: the 4-byte packet header and the
// 16-byte words it frames. Decoding is a bit-for-bit view over the raw bytes;
// all multi-byte integers are little-endian on the wire.

use std::io::{self, ErrorKind, Read};
use thiserror::Error;

/// Error returned by the blocking codec reads.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The peer closed the connection before (or while) delivering the
    /// requested bytes.
    #[error("socket closed: end of stream")]
    EndOfStream,
    /// Any other I/O failure on the data socket.
    #[error("read failure: {0}")]
    Io(#[from] io::Error),
}

// Known word_type tags. The set is open: the board may emit tags outside this
// list and the readout must tolerate them.
pub const T_FBACK: u8 = 0x0;
pub const T_LT: u8 = 0x1;
pub const T_GT: u8 = 0x2;
pub const T_CH: u8 = 0x3;
pub const T_CHKSUM: u8 = 0x4;
pub const T_TS: u8 = 0x7;

/// Classified word tag, the sole discriminator used by the readout loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordKind {
    Feedback,
    Llt,
    Hlt,
    ChannelStatus,
    Checksum,
    Timestamp,
    Unknown(u8),
}

/// TCP packet header: `packet_size` in bytes, padded to 4 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_size: u32,
}

impl PacketHeader {
    pub const SIZE: usize = 4;

    /// Number of whole words announced by the header.
    #[inline]
    pub fn n_words(&self) -> usize {
        self.packet_size as usize / Word::SIZE
    }

    /// `packet_size % word_size == 0` holds for well-formed packets.
    #[inline]
    pub fn is_word_aligned(&self) -> bool {
        self.packet_size as usize % Word::SIZE == 0
    }
}

/// One 16-byte word off the wire, kept as raw bytes; fields are decoded on
/// access through the view appropriate to the tag.
///
/// Layout (LSB-first over two little-endian `u64`s, `lo` = bytes 0..8 and
/// `hi` = bytes 8..16):
///
/// - all kinds: `word_type` = `lo[2:0]`
/// - TS / LLT / HLT / feedback: `timestamp` = `hi`
/// - LLT / HLT: `trigger_word` = `lo[63:3]` (61 bits)
/// - feedback: `code` = `lo[18:3]`, `source` = `lo[34:19]`, `padding` = `lo[63:35]`
/// - channel status: `beam` = `lo[11:3]`, `crt` = `lo[43:12]`,
///   `pds` = `hi[63:60] ++ lo[63:44]` (24 bits), `timestamp` = `hi[59:0]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Word {
    raw: [u8; 16],
}

impl Word {
    pub const SIZE: usize = 16;

    #[inline]
    pub fn from_bytes(raw: [u8; 16]) -> Self {
        Word { raw }
    }

    /// Raw wire bytes, exactly as read. This is what the calibration stream
    /// persists.
    #[inline]
    pub fn raw(&self) -> &[u8; 16] {
        &self.raw
    }

    #[inline]
    fn lo(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.raw[0..8]);
        u64::from_le_bytes(b)
    }

    #[inline]
    fn hi(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.raw[8..16]);
        u64::from_le_bytes(b)
    }

    /// The 3-bit `word_type` tag.
    #[inline]
    pub fn word_type(&self) -> u8 {
        (self.lo() & 0x7) as u8
    }

    #[inline]
    pub fn kind(&self) -> WordKind {
        match self.word_type() {
            T_FBACK => WordKind::Feedback,
            T_LT => WordKind::Llt,
            T_GT => WordKind::Hlt,
            T_CH => WordKind::ChannelStatus,
            T_CHKSUM => WordKind::Checksum,
            T_TS => WordKind::Timestamp,
            other => WordKind::Unknown(other),
        }
    }

    /// 64-bit board timestamp. Valid for every kind except channel status,
    /// which carries only 60 bits (see [`Word::channel_status`]).
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.hi()
    }

    /// Trigger bitmask of an LLT or HLT word (61 bits, zero-extended).
    #[inline]
    pub fn trigger_word(&self) -> u64 {
        self.lo() >> 3
    }

    /// Feedback-word view. Only meaningful when `kind() == Feedback`.
    #[inline]
    pub fn feedback(&self) -> Feedback {
        let lo = self.lo();
        Feedback {
            timestamp: self.hi(),
            code: ((lo >> 3) & 0xFFFF) as u16,
            source: ((lo >> 19) & 0xFFFF) as u16,
            padding: (lo >> 35) as u32,
        }
    }

    /// Channel-status view. Only meaningful when `kind() == ChannelStatus`.
    #[inline]
    pub fn channel_status(&self) -> ChannelStatus {
        let lo = self.lo();
        let hi = self.hi();
        ChannelStatus {
            timestamp: hi & 0x0FFF_FFFF_FFFF_FFFF,
            beam: (lo >> 3) & 0x1FF,
            crt: (lo >> 12) & 0xFFFF_FFFF,
            pds: ((hi >> 60) << 20) | (lo >> 44),
        }
    }

    // Constructors below mirror the decoding layout. The driver itself never
    // encodes words; they exist for board simulators and tests.

    pub fn timestamp_word(timestamp: u64) -> Self {
        Self::from_parts(u64::from(T_TS), timestamp)
    }

    pub fn llt(timestamp: u64, trigger_word: u64) -> Self {
        Self::from_parts((trigger_word << 3) | u64::from(T_LT), timestamp)
    }

    pub fn hlt(timestamp: u64, trigger_word: u64) -> Self {
        Self::from_parts((trigger_word << 3) | u64::from(T_GT), timestamp)
    }

    pub fn feedback_word(timestamp: u64, code: u16, source: u16) -> Self {
        let lo = (u64::from(source) << 19) | (u64::from(code) << 3) | u64::from(T_FBACK);
        Self::from_parts(lo, timestamp)
    }

    pub fn channel_status_word(timestamp60: u64, beam: u64, crt: u64, pds: u64) -> Self {
        let lo = ((pds & 0xF_FFFF) << 44)
            | ((crt & 0xFFFF_FFFF) << 12)
            | ((beam & 0x1FF) << 3)
            | u64::from(T_CH);
        let hi = ((pds >> 20) << 60) | (timestamp60 & 0x0FFF_FFFF_FFFF_FFFF);
        Self::from_parts(lo, hi)
    }

    /// A word with an arbitrary raw tag; payload bits above the tag are zero.
    pub fn with_tag(tag: u8, timestamp: u64) -> Self {
        Self::from_parts(u64::from(tag & 0x7), timestamp)
    }

    fn from_parts(lo: u64, hi: u64) -> Self {
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&lo.to_le_bytes());
        raw[8..16].copy_from_slice(&hi.to_le_bytes());
        Word { raw }
    }
}

/// Decoded fields of a feedback word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feedback {
    pub timestamp: u64,
    pub code: u16,
    pub source: u16,
    pub padding: u32,
}

/// Decoded fields of a channel-status word. The timestamp is only 60 bits
/// wide; [`ChannelStatus::promote_timestamp`] completes the top nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub timestamp: u64,
    pub beam: u64,
    pub crt: u64,
    pub pds: u64,
}

impl ChannelStatus {
    /// The 64-bit correlation payload: `(pds << 48) | (crt << 16) | beam`.
    #[inline]
    pub fn payload(&self) -> u64 {
        ((self.pds & 0xFFFF) << 48) | ((self.crt & 0xFFFF_FFFF) << 16) | (self.beam & 0xFFFF)
    }

    /// Fill the missing upper 4 timestamp bits from the most recent TS word.
    /// (The 60-bit field rolls over after >500 years at 62.5 MHz.)
    #[inline]
    pub fn promote_timestamp(&self, last_ts_word: u64) -> u64 {
        (last_ts_word & 0xF000_0000_0000_0000) | self.timestamp
    }
}

/// Reads exactly one packet header from the stream.
///
/// Returns `ReadError::EndOfStream` if the peer closed the connection,
/// `ReadError::Io` on any other failure. Never returns a partial header.
pub fn read_packet_header<R: Read>(reader: &mut R) -> Result<PacketHeader, ReadError> {
    let mut buf = [0u8; PacketHeader::SIZE];
    read_exact_or_eof(reader, &mut buf)?;
    Ok(PacketHeader {
        packet_size: u32::from_le_bytes(buf),
    })
}

/// Reads exactly one 16-byte word from the stream.
pub fn read_word<R: Read>(reader: &mut R) -> Result<Word, ReadError> {
    let mut buf = [0u8; Word::SIZE];
    read_exact_or_eof(reader, &mut buf)?;
    Ok(Word::from_bytes(buf))
}

// `Read::read_exact` already retries on EINTR; only the EOF case needs
// translating into the codec's error vocabulary.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ReadError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ReadError::EndOfStream),
        Err(e) => Err(ReadError::Io(e)),
    }
}
