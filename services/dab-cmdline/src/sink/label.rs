//! Dynamic label (DLS) filtering and the label file

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Labels shorter than this are partial segments
const MIN_LABEL_LEN: usize = 10;

/// A growing label replaces a stored one this long without republishing
const GROWTH_LEN: usize = 20;

pub const LABEL_FILE: &str = "DABlabel.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelDecision {
    /// Ignore the label
    Drop,
    /// Remember the longer label but do not publish it
    Replace,
    Publish,
}

/// Suppresses the repeats and fragments a station sends every few seconds
#[derive(Debug, Default)]
pub struct LabelFilter {
    last: String,
}

impl LabelFilter {
    pub fn offer(&mut self, label: &str) -> LabelDecision {
        if label.len() < MIN_LABEL_LEN || label == self.last || self.last.contains(label) {
            return LabelDecision::Drop;
        }
        let grown = label.contains(self.last.as_str()) && self.last.len() > GROWTH_LEN;
        self.last = label.to_string();
        if grown {
            LabelDecision::Replace
        } else {
            LabelDecision::Publish
        }
    }

    pub fn last(&self) -> &str {
        &self.last
    }
}

pub struct LabelWriter {
    path: PathBuf,
    filter: Mutex<LabelFilter>,
}

impl LabelWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(LABEL_FILE),
            filter: Mutex::new(LabelFilter::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn decide(&self, label: &str) -> LabelDecision {
        match self.filter.lock() {
            Ok(mut filter) => filter.offer(label),
            Err(poisoned) => poisoned.into_inner().offer(label),
        }
    }

    /// Replace the label file with `label` stamped at `timestamp`
    pub fn write(&self, label: &str, timestamp: i64) -> io::Result<()> {
        fs::write(&self.path, render(label, timestamp))
    }
}

pub fn render(label: &str, timestamp: i64) -> String {
    format!("timestamp={}\nlabel={}\n", timestamp, label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_and_repeated_labels_dropped() {
        let mut filter = LabelFilter::default();
        assert_eq!(filter.offer("Radio"), LabelDecision::Drop);
        assert_eq!(filter.offer("Now playing: Song A"), LabelDecision::Publish);
        assert_eq!(filter.offer("Now playing: Song A"), LabelDecision::Drop);
        assert_eq!(filter.offer("Now playing"), LabelDecision::Drop);
        assert_eq!(filter.last(), "Now playing: Song A");
    }

    #[test]
    fn test_long_label_growth_replaces_silently() {
        let mut filter = LabelFilter::default();
        let first = "The Morning Show with Anna";
        assert_eq!(filter.offer(first), LabelDecision::Publish);
        let longer = "The Morning Show with Anna and Bob";
        assert_eq!(filter.offer(longer), LabelDecision::Replace);
        assert_eq!(filter.last(), longer);
    }

    #[test]
    fn test_short_label_growth_is_published() {
        let mut filter = LabelFilter::default();
        assert_eq!(filter.offer("Sky Radio 1"), LabelDecision::Publish);
        assert_eq!(filter.offer("Sky Radio 101 FM"), LabelDecision::Publish);
    }

    #[test]
    fn test_label_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LabelWriter::new(dir.path());
        writer.write("Now playing: Song A", 1_700_000_000).unwrap();
        writer.write("Now playing: Song B", 1_700_000_004).unwrap();
        assert_eq!(
            fs::read_to_string(writer.path()).unwrap(),
            "timestamp=1700000004\nlabel=Now playing: Song B\n"
        );
    }
}
