//! Sample sources feeding the decoding engine
//!
//! Every back end delivers complex baseband at 2.048 MS/s into a
//! [`SampleBuffer`]; the engine pulls from it through [`DeviceHandler`].
//! Which back end is used is a runtime choice ([`DeviceKind`]).

mod buffer;
mod file;
mod process;
mod rtl_tcp;

use std::path::PathBuf;
use std::sync::Arc;

use num_complex::Complex32;
use thiserror::Error;
use tracing::info;

use crate::config::DeviceSettings;

pub use buffer::{IqDecoder, LinearResampler, SampleBuffer, SampleFormat};
pub use file::{FileReplay, RawIqReader, WavIqReader};
pub use process::{ToolCapture, ToolCommand};
pub use rtl_tcp::RtlTcpClient;

/// DAB baseband sample rate expected by the engine
pub const SAMPLE_RATE: u32 = 2_048_000;

/// Sample buffer size (in complex samples), about a second of signal
pub const BUFFER_CAPACITY: usize = 32 * 65_536;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{tool} not found (set {env} to its location)")]
    ToolNotFound { tool: &'static str, env: &'static str },

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no input file given (use -F)")]
    MissingFile,

    #[error("cannot open {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("{0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Available sample sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DeviceKind {
    Rtlsdr,
    Airspy,
    Sdrplay,
    Hackrf,
    Lime,
    RtlTcp,
    RawFile,
    WavFile,
}

impl DeviceKind {
    /// Gain used when `-G` is not given
    pub fn default_gain(self) -> i32 {
        match self {
            DeviceKind::Rtlsdr | DeviceKind::RtlTcp => 50,
            DeviceKind::Airspy => 20,
            DeviceKind::Sdrplay => 30,
            DeviceKind::Hackrf => 40,
            DeviceKind::Lime => 70,
            DeviceKind::RawFile | DeviceKind::WavFile => 0,
        }
    }
}

/// The contract every sample source offers to the rest of the program.
///
/// Methods take `&self`: the engine pulls samples from its own threads
/// while the control loop starts and stops the reader.
pub trait DeviceHandler: Send + Sync {
    /// (Re)start sample delivery tuned to `frequency` (Hz)
    fn restart_reader(&self, frequency: u32) -> Result<(), DeviceError>;

    /// Stop sample delivery; calling it twice is harmless
    fn stop_reader(&self);

    /// Move up to `out.len()` samples into `out`, returning how many
    fn get_samples(&self, out: &mut [Complex32]) -> usize;

    /// Samples currently buffered
    fn samples(&self) -> usize;

    fn name(&self) -> &str;
}

/// Construct the configured back end
pub fn open(settings: &DeviceSettings) -> Result<Arc<dyn DeviceHandler>, DeviceError> {
    info!("Opening {:?} device", settings.kind);
    let device: Arc<dyn DeviceHandler> = match settings.kind {
        DeviceKind::RtlTcp => Arc::new(RtlTcpClient::connect(settings)?),
        DeviceKind::RawFile => {
            let path = settings.file.as_ref().ok_or(DeviceError::MissingFile)?;
            Arc::new(FileReplay::new(RawIqReader::open(path)?, settings.repeat))
        }
        DeviceKind::WavFile => {
            let path = settings.file.as_ref().ok_or(DeviceError::MissingFile)?;
            Arc::new(FileReplay::new(WavIqReader::open(path)?, settings.repeat))
        }
        kind => Arc::new(ToolCapture::new(ToolCommand::for_device(kind, settings)?)),
    };
    Ok(device)
}

/// Tuned frequency with a ppm correction folded in, for tools that lack one
pub fn corrected_frequency(frequency: u32, ppm: i32) -> u32 {
    let offset = frequency as i64 * ppm as i64 / 1_000_000;
    (frequency as i64 + offset).max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(kind: DeviceKind) -> DeviceSettings {
        DeviceSettings {
            kind,
            gain: kind.default_gain(),
            vga_gain: 40,
            lna_state: 2,
            autogain: false,
            ppm: 0,
            antenna: "Auto".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            file: None,
            repeat: true,
        }
    }

    #[test]
    fn test_corrected_frequency() {
        assert_eq!(corrected_frequency(220_352_000, 0), 220_352_000);
        assert_eq!(corrected_frequency(220_000_000, 10), 220_002_200);
        assert_eq!(corrected_frequency(220_000_000, -10), 219_997_800);
    }

    #[test]
    fn test_file_backend_requires_file() {
        let err = open(&settings(DeviceKind::RawFile)).err().unwrap();
        assert!(matches!(err, DeviceError::MissingFile));
    }

    #[test]
    fn test_missing_file_fails_construction() {
        let mut s = settings(DeviceKind::WavFile);
        s.file = Some(PathBuf::from("/nonexistent/capture.wav"));
        let err = open(&s).err().unwrap();
        assert!(matches!(err, DeviceError::Open { .. }));
    }
}
