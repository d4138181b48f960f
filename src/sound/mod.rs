//! Sample layouts, decoded sound sources and sound lookup.

mod decoder;
mod theme;

pub use decoder::decode_file;
pub use theme::{ThemeResolver, ThemeState, DEFAULT_OUTPUT_PROFILE, DEFAULT_THEME};

use crate::error::{ErrorKind, Result};
use crate::proplist::Proplist;
use bytes::Bytes;

pub const MAX_RATE: u32 = 384_000;
pub const MAX_CHANNELS: u8 = 32;

/// Encoding of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Signed 16 bit, native endian.
    S16Ne,
    /// Signed 16 bit, reverse endian.
    S16Re,
    /// Unsigned 8 bit.
    U8,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Ne | SampleFormat::S16Re => 2,
            SampleFormat::U8 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    pub fn new(format: SampleFormat, rate: u32, channels: u8) -> Self {
        SampleSpec {
            format,
            rate,
            channels,
        }
    }

    pub fn is_valid(&self) -> bool {
        (1..=MAX_RATE).contains(&self.rate) && (1..=MAX_CHANNELS).contains(&self.channels)
    }

    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// Bytes consumed per second of playback.
    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }
}

/// Linear volume factor. `Volume::NORM` leaves samples untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Volume(pub f64);

impl Volume {
    pub const NORM: Volume = Volume(1.0);
    pub const MUTED: Volume = Volume(0.0);

    pub fn from_db(db: f64) -> Self {
        if db == f64::NEG_INFINITY {
            return Volume::MUTED;
        }
        Volume(10f64.powf(db / 20.0))
    }

    pub fn linear(self) -> f64 {
        self.0
    }

    pub fn is_norm(self) -> bool {
        (self.0 - 1.0).abs() < f64::EPSILON
    }

    /// Returns `data` with every sample multiplied by this factor, clamped to range.
    pub fn apply(self, format: SampleFormat, data: &[u8]) -> Vec<u8> {
        if self.is_norm() {
            return data.to_vec();
        }
        let factor = self.0;
        match format {
            SampleFormat::U8 => data
                .iter()
                .map(|&b| {
                    let centered = b as f64 - 128.0;
                    (centered * factor + 128.0).round().clamp(0.0, 255.0) as u8
                })
                .collect(),
            SampleFormat::S16Ne | SampleFormat::S16Re => {
                let reverse = format == SampleFormat::S16Re;
                let mut out = Vec::with_capacity(data.len());
                for pair in data.chunks_exact(2) {
                    let mut raw = i16::from_ne_bytes([pair[0], pair[1]]);
                    if reverse {
                        raw = raw.swap_bytes();
                    }
                    let mut scaled = (raw as f64 * factor)
                        .round()
                        .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                    if reverse {
                        scaled = scaled.swap_bytes();
                    }
                    out.extend_from_slice(&scaled.to_ne_bytes());
                }
                out
            }
        }
    }
}

/// A decoded, readable sound.
pub trait SoundFile: Send {
    fn spec(&self) -> SampleSpec;

    /// Total PCM bytes the source yields from start to end.
    fn byte_len(&self) -> usize;

    /// Reads up to `max` bytes. An empty chunk means end of data.
    fn read_chunk(&mut self, max: usize) -> Result<Bytes>;
}

/// Interleaved PCM held in memory.
#[derive(Debug, Clone)]
pub struct MemorySound {
    spec: SampleSpec,
    data: Bytes,
    position: usize,
}

impl MemorySound {
    pub fn new(spec: SampleSpec, data: impl Into<Bytes>) -> Result<Self> {
        if !spec.is_valid() {
            return Err(ErrorKind::Invalid);
        }
        let data = data.into();
        if data.len() % spec.frame_size() != 0 {
            return Err(ErrorKind::Invalid);
        }
        Ok(MemorySound {
            spec,
            data,
            position: 0,
        })
    }

    /// A silent sound of `frames` frames.
    pub fn silence(spec: SampleSpec, frames: usize) -> Result<Self> {
        let fill = match spec.format {
            SampleFormat::U8 => 0x80,
            _ => 0,
        };
        Self::new(spec, vec![fill; frames * spec.frame_size()])
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl SoundFile for MemorySound {
    fn spec(&self) -> SampleSpec {
        self.spec
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        let end = self.data.len().min(self.position.saturating_add(max));
        let chunk = self.data.slice(self.position..end);
        self.position = end;
        Ok(chunk)
    }
}

/// Finds and opens the sound for an event.
pub trait SoundResolver: Send + Sync {
    /// `base` holds the session properties, `event` the per-request ones;
    /// event keys take precedence.
    fn lookup(
        &self,
        state: &mut ThemeState,
        base: &Proplist,
        event: &Proplist,
    ) -> Result<Box<dyn SoundFile>>;
}
