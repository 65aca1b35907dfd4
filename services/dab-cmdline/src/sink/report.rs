//! Machine-readable status lines for a supervising process
//!
//! Each line is written verbatim and flushed at once; the consumer parses
//! the prefixes, so their spelling must not change.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::engine::DlPlusTag;

use super::mot::SlideKind;

pub struct StatusReport {
    out: Mutex<Box<dyn Write + Send>>,
}

impl StatusReport {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(io::stderr()))
    }

    fn line(&self, args: fmt::Arguments<'_>) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        // stderr going away leaves nobody to tell
        let _ = writeln!(out, "{}", args).and_then(|_| out.flush());
    }

    pub fn dls(&self, label: &str) {
        self.line(format_args!("DLS: {}", label));
    }

    pub fn dl_plus(&self, tag_count: usize, item_running: bool) {
        self.line(format_args!(
            "DL+: {} tags, running={}",
            tag_count,
            item_running as u8
        ));
    }

    pub fn dl_plus_tag(&self, index: usize, tag: &DlPlusTag, text: &str) {
        self.line(format_args!(
            "DL+ TAG[{}]: type={} start={} len={} text=\"{}\"",
            index, tag.content_type, tag.start_marker, tag.length, text
        ));
    }

    pub fn mot_image(&self, path: &Path, size: usize, kind: SlideKind) {
        self.line(format_args!(
            "MOT_IMAGE: path={} size={} type={}",
            path.display(),
            size,
            kind.label()
        ));
    }

    pub fn bitrate(&self, bit_rate: i16) {
        self.line(format_args!("BITRATE: {}", bit_rate));
    }

    pub fn dab_type(&self, dab_plus: bool) {
        self.line(format_args!(
            "DAB_TYPE: {}",
            if dab_plus { "DAB+" } else { "DAB" }
        ));
    }

    pub fn audio_format(&self, rate: u32, stereo: bool) {
        self.line(format_args!(
            "AUDIO_FORMAT: rate={} channels={}",
            rate,
            if stereo { 2 } else { 1 }
        ));
    }
}
