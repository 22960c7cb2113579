//! `WAVEFORMATEX` / `WAVEFORMATEXTENSIBLE` conversion.

use std::mem::size_of;

use windows::core::GUID;
use windows::Win32::Media::Audio::{IAudioClient, WAVEFORMATEX, WAVEFORMATEXTENSIBLE, WAVEFORMATEXTENSIBLE_0};
use windows::Win32::System::Com::CoTaskMemFree;

use audio_relay_core::{DeviceId, RelayError, SampleEncoding, StreamFormat};

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

const KSDATAFORMAT_SUBTYPE_PCM: GUID = GUID::from_u128(0x00000001_0000_0010_8000_00aa00389b71);
const KSDATAFORMAT_SUBTYPE_IEEE_FLOAT: GUID = GUID::from_u128(0x00000003_0000_0010_8000_00aa00389b71);

/// The mix format returned by `IAudioClient::GetMixFormat`, freed on drop.
pub(crate) struct MixFormat {
    ptr: *mut WAVEFORMATEX,
}

impl MixFormat {
    pub(crate) fn query(client: &IAudioClient, device: &DeviceId) -> Result<Self, RelayError> {
        let ptr = unsafe { client.GetMixFormat() }
            .map_err(|e| RelayError::activation(device, format!("GetMixFormat failed: {}", e)))?;
        Ok(Self { ptr })
    }

    pub(crate) fn as_ptr(&self) -> *const WAVEFORMATEX {
        self.ptr
    }

    /// Describe the mix format, rejecting encodings the relay cannot copy.
    pub(crate) fn to_stream_format(&self, device: &DeviceId) -> Result<StreamFormat, RelayError> {
        // SAFETY: `ptr` came from GetMixFormat and is valid until drop. The
        // extensible tail is present exactly when the tag says so.
        let base = unsafe { std::ptr::read_unaligned(self.ptr) };
        let extensible = if base.wFormatTag == WAVE_FORMAT_EXTENSIBLE {
            Some(unsafe { std::ptr::read_unaligned(self.ptr as *const WAVEFORMATEXTENSIBLE) })
        } else {
            None
        };
        stream_format_from(&base, extensible.as_ref())
            .map_err(|reason| RelayError::activation(device, reason))
    }
}

impl Drop for MixFormat {
    fn drop(&mut self) {
        unsafe {
            CoTaskMemFree(Some(self.ptr as *const _));
        }
    }
}

fn stream_format_from(
    base: &WAVEFORMATEX,
    extensible: Option<&WAVEFORMATEXTENSIBLE>,
) -> Result<StreamFormat, String> {
    let bits_per_sample = base.wBitsPerSample;
    let (encoding, valid_bits_per_sample, channel_mask) = match (base.wFormatTag, extensible) {
        (WAVE_FORMAT_IEEE_FLOAT, _) => (SampleEncoding::Float, bits_per_sample, 0),
        (WAVE_FORMAT_PCM, _) => (SampleEncoding::Pcm, bits_per_sample, 0),
        (WAVE_FORMAT_EXTENSIBLE, Some(ext)) => {
            let sub_format = ext.SubFormat;
            let encoding = if sub_format == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT {
                SampleEncoding::Float
            } else if sub_format == KSDATAFORMAT_SUBTYPE_PCM {
                SampleEncoding::Pcm
            } else {
                return Err(format!("unsupported mix subformat {:?}", sub_format));
            };
            let valid = unsafe { ext.Samples.wValidBitsPerSample };
            (encoding, valid, ext.dwChannelMask)
        }
        (tag, _) => return Err(format!("unsupported mix format tag {:#06x}", tag)),
    };

    Ok(StreamFormat {
        sample_rate: base.nSamplesPerSec,
        channels: base.nChannels,
        bits_per_sample,
        valid_bits_per_sample,
        channel_mask,
        encoding,
    })
}

/// Build the extensible descriptor render clients are initialized with.
pub(crate) fn wave_format_for(format: &StreamFormat) -> WAVEFORMATEXTENSIBLE {
    let sub_format = match format.encoding {
        SampleEncoding::Float => KSDATAFORMAT_SUBTYPE_IEEE_FLOAT,
        SampleEncoding::Pcm => KSDATAFORMAT_SUBTYPE_PCM,
    };
    WAVEFORMATEXTENSIBLE {
        Format: WAVEFORMATEX {
            wFormatTag: WAVE_FORMAT_EXTENSIBLE,
            nChannels: format.channels,
            nSamplesPerSec: format.sample_rate,
            nAvgBytesPerSec: format.bytes_per_second() as u32,
            nBlockAlign: format.block_align() as u16,
            wBitsPerSample: format.bits_per_sample,
            cbSize: (size_of::<WAVEFORMATEXTENSIBLE>() - size_of::<WAVEFORMATEX>()) as u16,
        },
        Samples: WAVEFORMATEXTENSIBLE_0 {
            wValidBitsPerSample: format.valid_bits_per_sample,
        },
        dwChannelMask: format.channel_mask,
        SubFormat: sub_format,
    }
}
