use serde::Serialize;

/// Sample encoding of a shared-mode stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    Float,
    Pcm,
}

/// Audio format negotiated from the Source's mix format.
///
/// Render endpoints are opened with this exact value; the relay never converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Container size of one sample.
    pub bits_per_sample: u16,
    pub valid_bits_per_sample: u16,
    /// Speaker position mask (`SPEAKER_FRONT_LEFT | ...`); 0 if unspecified.
    pub channel_mask: u32,
    pub encoding: SampleEncoding,
}

impl StreamFormat {
    /// 32-bit float interleaved, the usual shared-mode mix format.
    pub fn float32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 32,
            valid_bits_per_sample: 32,
            channel_mask: 0,
            encoding: SampleEncoding::Float,
        }
    }

    /// Bytes per interleaved frame.
    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn bytes_per_second(&self) -> usize {
        self.block_align() * self.sample_rate as usize
    }

    /// Byte length of `frames` frames.
    pub fn frames_to_bytes(&self, frames: u32) -> usize {
        frames as usize * self.block_align()
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.encoding {
            SampleEncoding::Float => "float",
            SampleEncoding::Pcm => "pcm",
        };
        write!(
            f,
            "{} Hz, {} ch, {}-bit {}",
            self.sample_rate, self.channels, self.valid_bits_per_sample, kind
        )
    }
}

/// Per-packet flags reported by the capture endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    /// The packet should be treated as silence regardless of its bytes.
    pub silent: bool,
    /// A glitch occurred before this packet.
    pub discontinuity: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_align_float_stereo() {
        let format = StreamFormat::float32(48000, 2);
        assert_eq!(format.block_align(), 8);
        assert_eq!(format.frames_to_bytes(480), 3840);
        assert_eq!(format.bytes_per_second(), 384_000);
    }

    #[test]
    fn block_align_24_in_32() {
        let format = StreamFormat {
            sample_rate: 44100,
            channels: 6,
            bits_per_sample: 32,
            valid_bits_per_sample: 24,
            channel_mask: 0x3F,
            encoding: SampleEncoding::Pcm,
        };
        assert_eq!(format.block_align(), 24);
        assert_eq!(format.to_string(), "44100 Hz, 6 ch, 24-bit pcm");
    }
}
