//! DAB band plan: channel label to centre frequency

use std::fmt;

/// Frequency band a channel label is looked up in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    BandIII,
    LBand,
}

impl Band {
    /// `L_BAND` selects L band, anything else Band III
    pub fn from_arg(s: &str) -> Self {
        if s == "L_BAND" {
            Band::LBand
        } else {
            Band::BandIII
        }
    }

    fn table(self) -> &'static [(&'static str, u32)] {
        match self {
            Band::BandIII => BAND_III,
            Band::LBand => L_BAND,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Band::BandIII => write!(f, "BAND_III"),
            Band::LBand => write!(f, "L_BAND"),
        }
    }
}

/// Band III channels, frequencies in kHz
const BAND_III: &[(&str, u32)] = &[
    ("5A", 174_928),
    ("5B", 176_640),
    ("5C", 178_352),
    ("5D", 180_064),
    ("6A", 181_936),
    ("6B", 183_648),
    ("6C", 185_360),
    ("6D", 187_072),
    ("7A", 188_928),
    ("7B", 190_640),
    ("7C", 192_352),
    ("7D", 194_064),
    ("8A", 195_936),
    ("8B", 197_648),
    ("8C", 199_360),
    ("8D", 201_072),
    ("9A", 202_928),
    ("9B", 204_640),
    ("9C", 206_352),
    ("9D", 208_064),
    ("10A", 209_936),
    ("10N", 210_096),
    ("10B", 211_648),
    ("10C", 213_360),
    ("10D", 215_072),
    ("11A", 216_928),
    ("11N", 217_088),
    ("11B", 218_640),
    ("11C", 220_352),
    ("11D", 222_064),
    ("12A", 223_936),
    ("12N", 224_096),
    ("12B", 225_648),
    ("12C", 227_360),
    ("12D", 229_072),
    ("13A", 230_784),
    ("13B", 232_496),
    ("13C", 234_208),
    ("13D", 235_776),
    ("13E", 237_488),
    ("13F", 239_200),
];

/// L band channels, frequencies in kHz
const L_BAND: &[(&str, u32)] = &[
    ("LA", 1_452_960),
    ("LB", 1_454_672),
    ("LC", 1_456_384),
    ("LD", 1_458_096),
    ("LE", 1_459_808),
    ("LF", 1_461_520),
    ("LG", 1_463_232),
    ("LH", 1_464_944),
    ("LI", 1_466_656),
    ("LJ", 1_468_368),
    ("LK", 1_470_080),
    ("LL", 1_471_792),
    ("LM", 1_473_504),
    ("LN", 1_475_216),
    ("LO", 1_476_928),
    ("LP", 1_478_640),
];

/// Centre frequency in Hz for `channel` in `band`
pub fn frequency(band: Band, channel: &str) -> Option<u32> {
    band.table()
        .iter()
        .find(|(label, _)| *label == channel)
        .map(|(_, khz)| khz * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_iii_lookup() {
        assert_eq!(frequency(Band::BandIII, "11C"), Some(220_352_000));
        assert_eq!(frequency(Band::BandIII, "5A"), Some(174_928_000));
        assert_eq!(frequency(Band::BandIII, "13F"), Some(239_200_000));
    }

    #[test]
    fn test_l_band_lookup() {
        assert_eq!(frequency(Band::LBand, "LA"), Some(1_452_960_000));
        // L band labels are not valid in Band III
        assert_eq!(frequency(Band::BandIII, "LA"), None);
    }

    #[test]
    fn test_unknown_channel() {
        assert_eq!(frequency(Band::BandIII, "99Z"), None);
        assert_eq!(frequency(Band::BandIII, "11c"), None);
    }

    #[test]
    fn test_band_from_arg() {
        assert_eq!(Band::from_arg("L_BAND"), Band::LBand);
        assert_eq!(Band::from_arg("BAND_III"), Band::BandIII);
        assert_eq!(Band::from_arg("anything"), Band::BandIII);
    }
}
