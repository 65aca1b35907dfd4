//! Handlers for everything the engine reports
//!
//! [`RadioSink`] turns engine events into shared state updates, files in
//! the info directory, PCM on stdout, TDC frames and status lines.

pub mod dlplus;
pub mod label;
pub mod mot;
pub mod pcm;
pub mod report;
pub mod tdc;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::engine::{AudioData, DlPlusTag, EventSink, TiiData};
use crate::state::RadioState;

use dlplus::{tag_text, DlPlusWriter};
use label::{LabelDecision, LabelWriter};
use mot::SlideWriter;
use pcm::{FormatTracker, PcmOutput};
use report::StatusReport;
use tdc::TdcServer;

pub use mot::{SavedSlide, SlideKind};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid data (size={size})")]
    InvalidSlide { size: usize },

    #[error("cannot open file {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write error {} ({written}/{size} bytes)", path.display())]
    ShortWrite {
        path: PathBuf,
        written: usize,
        size: usize,
    },
}

/// Writers for the `-i` info directory
struct InfoFiles {
    label: LabelWriter,
    dl_plus: DlPlusWriter,
    slides: SlideWriter,
}

pub struct RadioSink {
    state: Arc<RadioState>,
    report: StatusReport,
    info: Option<InfoFiles>,
    pcm: PcmOutput,
    format: Mutex<FormatTracker>,
    tdc: Option<TdcServer>,
}

impl RadioSink {
    pub fn new(state: Arc<RadioState>, pcm: PcmOutput) -> Self {
        Self {
            state,
            report: StatusReport::stderr(),
            info: None,
            pcm,
            format: Mutex::new(FormatTracker::default()),
            tdc: None,
        }
    }

    pub fn with_report(mut self, report: StatusReport) -> Self {
        self.report = report;
        self
    }

    /// Save labels, DL-Plus data and slides into `dir`
    pub fn with_info_dir(mut self, dir: &Path) -> Self {
        self.info = Some(InfoFiles {
            label: LabelWriter::new(dir),
            dl_plus: DlPlusWriter::new(dir),
            slides: SlideWriter::new(dir),
        });
        self
    }

    pub fn with_tdc(mut self, server: TdcServer) -> Self {
        self.tdc = Some(server);
        self
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl EventSink for RadioSink {
    fn sync_signal(&self, synced: bool) {
        self.state.set_time_sync(synced);
    }

    fn system_data(&self, synced: bool, snr: i16, freq_offset: i32) {
        self.state.quality.record_system(snr, freq_offset);
        debug!(
            "synced = {}, snr = {}, offset = {}",
            if synced { "on" } else { "off" },
            snr,
            freq_offset
        );
    }

    fn ensemble_name(&self, name: &str, id: u32) {
        info!("ensemble {} is ({:X}) recognized", name, id);
        self.state.set_ensemble_recognized();
    }

    fn service_name(&self, name: &str, sid: u32, _sub_ch_id: u16) {
        info!("{} ({:X}) is part of the ensemble", name, sid);
    }

    fn fib_quality(&self, quality: i16) {
        self.state.quality.record_fib(quality);
        debug!("fic quality = {}", quality);
    }

    fn audio_out(&self, samples: &[i16], rate: u32, stereo: bool) {
        let changed = match self.format.lock() {
            Ok(mut format) => format.update(rate, stereo),
            Err(poisoned) => poisoned.into_inner().update(rate, stereo),
        };
        if changed {
            info!(
                "PCM: rate={} stereo={} size={}",
                rate,
                stereo as u8,
                samples.len()
            );
            self.report.audio_format(rate, stereo);
        }

        // an empty buffer only announces the format
        if samples.is_empty() {
            return;
        }
        self.state.quality.record_pcm(samples.len());
        if let Err(e) = self.pcm.write(samples, rate, stereo) {
            error!("PCM: write error ({})", e);
        }
    }

    fn dynamic_label(&self, label: &str) {
        let Some(info) = &self.info else { return };
        if info.label.decide(label) != LabelDecision::Publish {
            return;
        }
        if let Err(e) = info.label.write(label, now()) {
            error!(
                "DLS: error writing to file {} ({})",
                info.label.path().display(),
                e
            );
        } else {
            self.state.quality.record_label();
        }
        self.report.dls(label);
    }

    fn dl_plus(&self, label: &[u8], tags: &[DlPlusTag], item_toggle: bool, item_running: bool) {
        let Some(info) = &self.info else { return };
        if tags.is_empty() {
            return;
        }
        if let Err(e) = info
            .dl_plus
            .write(label, tags, item_toggle, item_running, now())
        {
            error!(
                "DL+: error writing to {} ({})",
                info.dl_plus.path().display(),
                e
            );
            return;
        }
        self.report.dl_plus(tags.len(), item_running);
        for (i, tag) in tags.iter().enumerate() {
            if let Some(text) = tag_text(label, tag) {
                self.report.dl_plus_tag(i, tag, &text);
            }
        }
    }

    fn bytes_out(&self, data: &[u8], frame_type: u8) {
        if let Some(tdc) = &self.tdc {
            tdc.publish(data, frame_type);
        }
    }

    fn program_data(&self, data: &AudioData) {
        info!("\tstartaddress\t= {}", data.start_addr);
        info!("\tlength\t\t= {}", data.length);
        info!("\tsubChId\t\t= {}", data.sub_ch_id);
        info!("\tprotection\t= {}", data.prot_level);
        info!("\tbitrate\t\t= {}", data.bit_rate);
        self.report.bitrate(data.bit_rate);
        self.report.dab_type(data.is_dab_plus());
    }

    fn program_quality(&self, frame_errors: i16, rs_errors: i16, aac_errors: i16) {
        self.state
            .quality
            .record_msc(frame_errors, rs_errors, aac_errors);
        debug!(
            "msc quality = {} {} {}",
            frame_errors, rs_errors, aac_errors
        );
    }

    fn mot_data(&self, data: &[u8], name: Option<&str>, content_subtype: i32) {
        let Some(info) = &self.info else { return };
        match info.slides.save(data, name) {
            Ok(slide) => {
                info!(
                    "MOT: saved {} ({} bytes, {}, type={})",
                    slide.path.display(),
                    slide.size,
                    slide.kind.label(),
                    content_subtype
                );
                self.state.quality.record_slide();
                self.report.mot_image(&slide.path, slide.size, slide.kind);
            }
            Err(e @ SinkError::InvalidSlide { .. }) => warn!("MOT: {}", e),
            Err(e) => error!("MOT: {}", e),
        }
    }

    fn tii_data(&self, data: &TiiData) {
        debug!("tii {} {}", data.main_id, data.sub_id);
    }

    fn time(&self, hours: i32, minutes: i32) {
        debug!("{:2}:{:02}", hours, minutes);
    }

    fn wants_info(&self) -> bool {
        self.info.is_some()
    }
}
