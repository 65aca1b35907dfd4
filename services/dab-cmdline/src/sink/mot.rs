//! MOT slideshow images

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use super::SinkError;

/// Larger objects are treated as corrupt
pub const MAX_SLIDE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideKind {
    Jpeg,
    Png,
    Unknown,
}

impl SlideKind {
    /// Sniff the image type from its magic bytes
    pub fn detect(data: &[u8]) -> Self {
        if data.len() >= 2 && data[..2] == [0xFF, 0xD8] {
            SlideKind::Jpeg
        } else if data.len() >= 8 && data[..4] == [0x89, 0x50, 0x4E, 0x47] {
            SlideKind::Png
        } else {
            SlideKind::Unknown
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SlideKind::Jpeg => ".jpg",
            SlideKind::Png => ".png",
            SlideKind::Unknown => ".bin",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SlideKind::Jpeg => "JPEG",
            SlideKind::Png => "PNG",
            SlideKind::Unknown => "unknown",
        }
    }
}

/// A slide written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSlide {
    pub path: PathBuf,
    pub size: usize,
    pub kind: SlideKind,
}

pub struct SlideWriter {
    dir: PathBuf,
    sequence: AtomicU32,
}

impl SlideWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            sequence: AtomicU32::new(0),
        }
    }

    /// Where a slide goes; only unnamed slides consume a sequence number.
    ///
    /// A supplied name keeps just its final path component.
    pub fn slide_path(&self, name: Option<&str>, kind: SlideKind) -> PathBuf {
        let supplied = name.and_then(|n| Path::new(n).file_name());
        match supplied {
            Some(file_name) => self.dir.join(file_name),
            None => {
                let n = self.sequence.fetch_add(1, Ordering::SeqCst);
                self.dir
                    .join(format!("slide_{:04}{}", n, kind.extension()))
            }
        }
    }

    pub fn save(&self, data: &[u8], name: Option<&str>) -> Result<SavedSlide, SinkError> {
        if data.is_empty() || data.len() > MAX_SLIDE_SIZE {
            return Err(SinkError::InvalidSlide { size: data.len() });
        }
        let kind = SlideKind::detect(data);
        let path = self.slide_path(name, kind);

        let mut file = File::create(&path).map_err(|source| SinkError::Open {
            path: path.clone(),
            source,
        })?;
        let written = write_counted(&mut file, data);
        if written != data.len() {
            return Err(SinkError::ShortWrite {
                path,
                written,
                size: data.len(),
            });
        }
        Ok(SavedSlide {
            path,
            size: data.len(),
            kind,
        })
    }
}

/// Write as much of `data` as the file accepts, returning the byte count
fn write_counted<W: Write>(out: &mut W, data: &[u8]) -> usize {
    let mut written = 0;
    while written < data.len() {
        match out.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    if out.flush().is_err() {
        return 0;
    }
    written
}
