//! Output sinks the local sound server plays into.

use super::error::ServerError;
use crate::sound::{SampleFormat, SampleSpec};
use alsa::nix::errno::Errno;
use alsa::pcm::{Access, Format, HwParams, State as PcmState, PCM};
use alsa::{Direction, ValueOr};
use std::ffi::CString;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const LOG_TARGET: &str = "r_chime::server::output";

/// Opens one output stream per playing instance.
pub trait OutputSink: Send + Sync {
    fn open(&self, spec: &SampleSpec) -> Result<Box<dyn OutputStream>, ServerError>;
}

pub trait OutputStream: Send {
    /// Blocks until all of `data` has been accepted.
    fn write(&mut self, data: &[u8]) -> Result<(), ServerError>;

    /// Blocks until everything written has been played.
    fn drain(&mut self) -> Result<(), ServerError>;
}

/// Discards audio, optionally sleeping for the time the audio would take to play.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutput {
    pub paced: bool,
}

impl NullOutput {
    pub fn new() -> Self {
        NullOutput { paced: false }
    }

    pub fn paced() -> Self {
        NullOutput { paced: true }
    }
}

struct NullStream {
    paced: bool,
    bytes_per_second: usize,
}

impl OutputSink for NullOutput {
    fn open(&self, spec: &SampleSpec) -> Result<Box<dyn OutputStream>, ServerError> {
        if !spec.is_valid() {
            return Err(ServerError::Invalid);
        }
        Ok(Box::new(NullStream {
            paced: self.paced,
            bytes_per_second: spec.bytes_per_second(),
        }))
    }
}

impl OutputStream for NullStream {
    fn write(&mut self, data: &[u8]) -> Result<(), ServerError> {
        if self.paced && !data.is_empty() {
            let micros = data.len() as u64 * 1_000_000 / self.bytes_per_second.max(1) as u64;
            thread::sleep(Duration::from_micros(micros));
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), ServerError> {
        Ok(())
    }
}

/// Plays through an ALSA PCM device.
#[derive(Debug, Clone)]
pub struct AlsaOutput {
    device_name: String,
}

impl AlsaOutput {
    pub fn new(device_name: &str) -> Self {
        info!(target: LOG_TARGET, "Using ALSA output device: {}", device_name);
        AlsaOutput {
            device_name: device_name.to_string(),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

fn alsa_format(format: SampleFormat) -> Format {
    match format {
        SampleFormat::U8 => Format::U8,
        SampleFormat::S16Ne => Format::s16(),
        SampleFormat::S16Re if cfg!(target_endian = "little") => Format::S16BE,
        SampleFormat::S16Re => Format::S16LE,
    }
}

impl OutputSink for AlsaOutput {
    #[instrument(skip(self, spec), fields(device = %self.device_name, rate = spec.rate, channels = spec.channels))]
    fn open(&self, spec: &SampleSpec) -> Result<Box<dyn OutputStream>, ServerError> {
        let device = CString::new(self.device_name.clone()).map_err(|_| ServerError::Invalid)?;
        let pcm = PCM::open(&device, Direction::Playback, false).map_err(|e| {
            error!(target: LOG_TARGET, "Cannot open ALSA device '{}': {}", self.device_name, e);
            ServerError::ModInitFailed
        })?;
        configure(&pcm, spec).map_err(|e| {
            error!(target: LOG_TARGET, "Cannot configure ALSA device '{}': {}", self.device_name, e);
            ServerError::ModInitFailed
        })?;
        debug!(target: LOG_TARGET, "ALSA stream opened ({:?})", spec);
        Ok(Box::new(AlsaStream {
            pcm,
            frame_size: spec.frame_size(),
        }))
    }
}

fn configure(pcm: &PCM, spec: &SampleSpec) -> Result<(), alsa::Error> {
    let hwp = HwParams::any(pcm)?;
    hwp.set_access(Access::RWInterleaved)?;
    hwp.set_format(alsa_format(spec.format))?;
    hwp.set_channels(spec.channels as u32)?;
    hwp.set_rate_near(spec.rate, ValueOr::Nearest)?;
    let actual_rate = hwp.get_rate()?;
    if actual_rate != spec.rate {
        warn!(
            target: LOG_TARGET,
            "ALSA rate negotiation: requested={}, actual={}", spec.rate, actual_rate
        );
    }
    pcm.hw_params(&hwp)?;

    let swp = pcm.sw_params_current()?;
    let buffer_size = hwp.get_buffer_size()?;
    let period_size = hwp.get_period_size()?;
    swp.set_start_threshold(buffer_size - period_size)?;
    pcm.sw_params(&swp)?;
    debug!(target: LOG_TARGET, "ALSA parameters applied (buffer={}, period={}).", buffer_size, period_size);
    Ok(())
}

struct AlsaStream {
    pcm: PCM,
    frame_size: usize,
}

impl OutputStream for AlsaStream {
    fn write(&mut self, data: &[u8]) -> Result<(), ServerError> {
        let io = self.pcm.io_bytes();
        let mut offset = 0;
        while offset + self.frame_size <= data.len() {
            match io.writei(&data[offset..]) {
                Ok(frames) => offset += frames * self.frame_size,
                Err(e) if e.errno() == Errno::EPIPE => {
                    warn!(target: LOG_TARGET, "ALSA buffer underrun (EPIPE), recovering");
                    self.pcm.recover(libc::EPIPE, true).map_err(|e| {
                        error!(target: LOG_TARGET, "ALSA recovery failed: {}", e);
                        ServerError::Internal
                    })?;
                }
                Err(e) => {
                    error!(target: LOG_TARGET, "ALSA write error: {}", e);
                    return Err(ServerError::Internal);
                }
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), ServerError> {
        match self.pcm.state() {
            PcmState::Running | PcmState::Prepared => self.pcm.drain().map_err(|e| {
                warn!(target: LOG_TARGET, "Error draining ALSA buffer: {}", e);
                ServerError::Internal
            }),
            _ => Ok(()),
        }
    }
}

impl Drop for AlsaStream {
    fn drop(&mut self) {
        if self.pcm.state() == PcmState::Running {
            if let Err(e) = self.pcm.drop() {
                warn!(target: LOG_TARGET, "Error dropping ALSA buffer during close (ignored): {}", e);
            }
        }
        debug!(target: LOG_TARGET, "ALSA stream closed.");
    }
}
