//! Stream-negotiation header codec.
//!
//! Every connection opens with one fixed-size header describing the PCM stream
//! that follows. All multi-byte fields are little-endian on both ends. The
//! three numeric fields are carried as `value - 1` so a 1-based field whose
//! maximum is one past the wire type's range still fits (e.g. 256 channels in
//! a `u8`); decoding adds the 1 back.
//!
//! Header layout (7 bytes):
//! - sample format: u16
//! - channel count - 1: u8
//! - sample rate - 1: u16
//! - frames per block - 1: u16

/// Wire length of the stream header.
pub(crate) const HEADER_LEN: usize = 7;

/// Sample formats understood on the wire.
///
/// The values are the PortAudio format flags the capture client sends; they
/// are single bits, not sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleFormat {
    F32,
    I32,
    I24,
    I16,
    I8,
    U8,
}

impl SampleFormat {
    /// Resolve a raw wire value. `None` for formats we do not know.
    pub(crate) fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            0x01 => Some(SampleFormat::F32),
            0x02 => Some(SampleFormat::I32),
            0x04 => Some(SampleFormat::I24),
            0x08 => Some(SampleFormat::I16),
            0x10 => Some(SampleFormat::I8),
            0x20 => Some(SampleFormat::U8),
            _ => None,
        }
    }

    // The relay only receives; the sending side of the codec is exercised by
    // the tests.
    #[allow(dead_code)]
    pub(crate) fn wire_value(self) -> u16 {
        match self {
            SampleFormat::F32 => 0x01,
            SampleFormat::I32 => 0x02,
            SampleFormat::I24 => 0x04,
            SampleFormat::I16 => 0x08,
            SampleFormat::I8 => 0x10,
            SampleFormat::U8 => 0x20,
        }
    }

    /// Bytes per sample for one channel.
    pub(crate) fn sample_size(self) -> usize {
        match self {
            SampleFormat::F32 | SampleFormat::I32 => 4,
            SampleFormat::I24 => 3,
            SampleFormat::I16 => 2,
            SampleFormat::I8 | SampleFormat::U8 => 1,
        }
    }
}

/// Negotiated stream parameters in decoded (1-based) form.
///
/// `format` stays raw: decoding a correct-length header never fails, so any
/// byte pattern is carried through as-is. Resolving it to a [`SampleFormat`]
/// happens at stream setup and is the only step that can reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamHeader {
    pub(crate) format: u16,
    pub(crate) channels: u16,
    pub(crate) sample_rate: u32,
    pub(crate) frames_per_block: u32,
}

impl StreamHeader {
    #[allow(dead_code)]
    pub(crate) fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.format.to_le_bytes());
        out[2] = self.channels.saturating_sub(1) as u8;
        out[3..5].copy_from_slice(&(self.sample_rate.saturating_sub(1) as u16).to_le_bytes());
        out[5..7].copy_from_slice(&(self.frames_per_block.saturating_sub(1) as u16).to_le_bytes());
        out
    }

    pub(crate) fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            format: u16::from_le_bytes([buf[0], buf[1]]),
            channels: buf[2] as u16 + 1,
            sample_rate: u16::from_le_bytes([buf[3], buf[4]]) as u32 + 1,
            frames_per_block: u16::from_le_bytes([buf[5], buf[6]]) as u32 + 1,
        }
    }

    /// Size in bytes of one audio block as sent on the wire.
    pub(crate) fn block_len(&self, format: SampleFormat) -> usize {
        self.frames_per_block as usize * self.channels as usize * format.sample_size()
    }
}
