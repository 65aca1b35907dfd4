//! DL-Plus (ETSI TS 102 980) tag rendering

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::engine::DlPlusTag;

pub const DL_PLUS_FILE: &str = "DABdlplus.txt";

/// Content type names; 54-58 are reserved
pub fn content_type_name(content_type: u8) -> &'static str {
    match content_type {
        0 => "DUMMY",
        1 => "ITEM.TITLE",
        2 => "ITEM.ALBUM",
        3 => "ITEM.TRACKNUMBER",
        4 => "ITEM.ARTIST",
        5 => "ITEM.COMPOSITION",
        6 => "ITEM.MOVEMENT",
        7 => "ITEM.CONDUCTOR",
        8 => "ITEM.COMPOSER",
        9 => "ITEM.BAND",
        10 => "ITEM.COMMENT",
        11 => "ITEM.GENRE",
        12 => "INFO.NEWS",
        13 => "INFO.NEWS.LOCAL",
        14 => "INFO.STOCKMARKET",
        15 => "INFO.SPORT",
        16 => "INFO.LOTTERY",
        17 => "INFO.HOROSCOPE",
        18 => "INFO.DAILY_DIVERSION",
        19 => "INFO.HEALTH",
        20 => "INFO.EVENT",
        21 => "INFO.SCENE",
        22 => "INFO.CINEMA",
        23 => "INFO.TV",
        24 => "INFO.DATE_TIME",
        25 => "INFO.WEATHER",
        26 => "INFO.TRAFFIC",
        27 => "INFO.ALARM",
        28 => "INFO.ADVERTISEMENT",
        29 => "INFO.URL",
        30 => "INFO.OTHER",
        31 => "STATIONNAME.SHORT",
        32 => "STATIONNAME.LONG",
        33 => "PROGRAMME.NOW",
        34 => "PROGRAMME.NEXT",
        35 => "PROGRAMME.PART",
        36 => "PROGRAMME.HOST",
        37 => "PROGRAMME.EDITORIAL_STAFF",
        38 => "PROGRAMME.FREQUENCY",
        39 => "PROGRAMME.HOMEPAGE",
        40 => "PROGRAMME.SUBCHANNEL",
        41 => "PHONE.HOTLINE",
        42 => "PHONE.STUDIO",
        43 => "PHONE.OTHER",
        44 => "SMS.STUDIO",
        45 => "SMS.OTHER",
        46 => "EMAIL.HOTLINE",
        47 => "EMAIL.STUDIO",
        48 => "EMAIL.OTHER",
        49 => "MMS.OTHER",
        50 => "CHAT",
        51 => "CHAT.CENTRE",
        52 => "VOTE.QUESTION",
        53 => "VOTE.CENTRE",
        59 => "DESCRIPTOR.PLACE",
        60 => "DESCRIPTOR.APPOINTMENT",
        61 => "DESCRIPTOR.IDENTIFIER",
        62 => "DESCRIPTOR.PURCHASE",
        63 => "DESCRIPTOR.GET_DATA",
        _ => "UNKNOWN",
    }
}

/// Text a tag points at, or None when it starts past the label.
///
/// The length field counts one less than the tagged bytes; the slice is
/// clamped to the end of the label.
pub fn tag_text(bytes: &[u8], tag: &DlPlusTag) -> Option<String> {
    let start = tag.start_marker as usize;
    if start >= bytes.len() {
        return None;
    }
    let end = (start + tag.length as usize + 1).min(bytes.len());
    Some(String::from_utf8_lossy(&bytes[start..end]).into_owned())
}

/// Contents of the DL-Plus file
pub fn render(
    label: &[u8],
    tags: &[DlPlusTag],
    item_toggle: bool,
    item_running: bool,
    timestamp: i64,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "timestamp={}", timestamp);
    let _ = writeln!(out, "label={}", String::from_utf8_lossy(label));
    let _ = writeln!(out, "itemToggle={}", item_toggle as u8);
    let _ = writeln!(out, "itemRunning={}", item_running as u8);
    let _ = writeln!(out, "numTags={}", tags.len());
    for (i, tag) in tags.iter().enumerate() {
        let _ = writeln!(
            out,
            "tag{}={},{},{}",
            i, tag.content_type, tag.start_marker, tag.length
        );
        if let Some(text) = tag_text(label, tag) {
            let _ = writeln!(out, "{}={}", content_type_name(tag.content_type), text);
        }
    }
    out
}

pub struct DlPlusWriter {
    path: PathBuf,
}

impl DlPlusWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(DL_PLUS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(
        &self,
        label: &[u8],
        tags: &[DlPlusTag],
        item_toggle: bool,
        item_running: bool,
        timestamp: i64,
    ) -> io::Result<()> {
        fs::write(
            &self.path,
            render(label, tags, item_toggle, item_running, timestamp),
        )
    }
}
