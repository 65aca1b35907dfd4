//! Interfaces to the external DAB decoding engine
//!
//! The engine (OFDM, FIC/MSC decoding, error correction, MOT/DLS parsing)
//! lives in a separate library. The program talks to it through
//! [`DabEngine`] and receives its events through [`EventSink`], so the
//! control loop can be driven by a fake engine in tests.

mod ffi;

use thiserror::Error;

pub use ffi::{EngineOptions, LibDab};

/// ASC type value announcing HE-AAC, i.e. a DAB+ service
pub const ASC_TY_DAB_PLUS: i16 = 0o77;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot load decoding engine {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("decoding engine lacks symbol {0}")]
    MissingSymbol(&'static str),

    #[error("engine initialisation failed")]
    InitFailed,
}

/// Sub-channel assignment of an audio service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioData {
    /// False when the service has no usable sub-channel data
    pub defined: bool,
    pub sub_ch_id: i16,
    pub start_addr: i16,
    pub short_form: bool,
    pub prot_level: i16,
    pub length: i16,
    pub bit_rate: i16,
    pub asc_ty: i16,
    pub language: i16,
    pub program_type: i16,
}

impl AudioData {
    pub fn is_dab_plus(&self) -> bool {
        self.asc_ty == ASC_TY_DAB_PLUS
    }
}

/// One DL-Plus semantic tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlPlusTag {
    pub content_type: u8,
    pub start_marker: u8,
    /// Tag length minus one, as transmitted
    pub length: u8,
}

/// Transmitter identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TiiData {
    pub main_id: u8,
    pub sub_id: u8,
}

/// Engine operations, all synchronous from the caller's point of view
pub trait DabEngine {
    fn start_processing(&mut self);

    fn stop(&mut self);

    /// Release the engine; no other call may follow
    fn exit(&mut self);

    /// Drop the current audio sub-channel selection
    fn reset_msc(&mut self);

    fn set_audio_channel(&mut self, data: &AudioData);

    /// Name of the service with identifier `sid`, if the ensemble carries it
    fn service_name(&self, sid: u32) -> Option<String>;

    fn is_audio_service(&self, name: &str) -> bool;

    fn data_for_audio_service(&self, name: &str) -> AudioData;
}

/// Events delivered by the engine, possibly from threads it owns.
///
/// Implementations must return quickly and never block the engine.
pub trait EventSink: Send + Sync {
    /// Time synchronisation attempt finished with result `synced`
    fn sync_signal(&self, synced: bool);

    fn system_data(&self, synced: bool, snr: i16, freq_offset: i32);

    /// Service information decoded; the ensemble is known
    fn ensemble_name(&self, name: &str, id: u32);

    fn service_name(&self, name: &str, sid: u32, sub_ch_id: u16);

    fn fib_quality(&self, quality: i16);

    /// Interleaved 16-bit PCM; an empty buffer only announces the format
    fn audio_out(&self, samples: &[i16], rate: u32, stereo: bool);

    fn dynamic_label(&self, label: &str);

    /// `label` is passed as raw bytes; tag markers are byte offsets into it
    fn dl_plus(&self, label: &[u8], tags: &[DlPlusTag], item_toggle: bool, item_running: bool);

    /// Transparent data channel frame (type 0 or 1)
    fn bytes_out(&self, data: &[u8], frame_type: u8);

    fn program_data(&self, data: &AudioData);

    fn program_quality(&self, frame_errors: i16, rs_errors: i16, aac_errors: i16);

    fn mot_data(&self, data: &[u8], name: Option<&str>, content_subtype: i32);

    fn tii_data(&self, data: &TiiData);

    fn time(&self, hours: i32, minutes: i32);

    /// Whether label, DL-Plus and MOT events are wanted at all
    fn wants_info(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dab_plus_detection() {
        let mut data = AudioData {
            asc_ty: 63,
            ..Default::default()
        };
        assert!(data.is_dab_plus());
        data.asc_ty = 0;
        assert!(!data.is_dab_plus());
    }
}
