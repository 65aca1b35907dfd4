//! Configuration loaded from the command line (with environment fallbacks)

use std::ffi::OsString;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use thiserror::Error;

use crate::band::Band;
use crate::device::DeviceKind;

/// Fixed at the value the engine was tuned with
const DEFAULT_THRESHOLD: i16 = 6;

#[derive(Parser, Debug)]
#[command(
    name = "dab-cmdline",
    version,
    about = "DAB/DAB+ command-line receiver",
    after_help = "PCM audio (16-bit interleaved) is written to stdout; diagnostics go to stderr."
)]
pub struct Cli {
    /// Save dynamic label, DL-Plus tags and MOT slides to <path>
    #[arg(short = 'i', long = "info-dir", value_name = "PATH")]
    info_dir: Option<PathBuf>,

    /// Halt after <duration> minutes
    #[arg(short = 'T', long, value_name = "MINUTES", allow_negative_numbers = true)]
    duration: Option<i32>,

    /// Seconds to look for an ensemble
    #[arg(short = 'D', long = "ensemble-timeout", value_name = "SECONDS", default_value_t = 5)]
    ensemble_timeout: i32,

    /// Seconds to reach time sync
    #[arg(short = 'd', long = "sync-timeout", value_name = "SECONDS", default_value_t = 5)]
    sync_timeout: i32,

    /// Mode is 1, 2 or 4
    #[arg(short = 'M', long, default_value = "1")]
    mode: String,

    /// Band is either L_BAND or BAND_III
    #[arg(short = 'B', long, default_value = "BAND_III")]
    band: String,

    /// Channel within the band
    #[arg(short = 'C', long, default_value = "11C")]
    channel: String,

    /// Program to be selected in the ensemble
    #[arg(short = 'P', long, default_value = "Sky Radio")]
    program: String,

    /// Service identifier (hex), takes precedence over the program name
    #[arg(short = 'S', long = "sid", value_name = "HEX", value_parser = parse_sid)]
    service_id: Option<u32>,

    /// Sample source
    #[arg(long, value_enum, env = "DAB_DEVICE", default_value = "rtlsdr")]
    device: DeviceKind,

    /// Gain setting (rtlsdr/rtl_tcp 0..100, airspy 0..21, sdrplay GRdB, hackrf LNA, lime)
    #[arg(short = 'G', long, allow_negative_numbers = true)]
    gain: Option<i32>,

    /// HackRF VGA gain
    #[arg(short = 'g', long = "vga-gain", default_value_t = 40)]
    vga_gain: i32,

    /// SDRplay LNA state
    #[arg(short = 'L', long = "lna-state", default_value_t = 2)]
    lna_state: i32,

    /// Enable automatic gain
    #[arg(short = 'Q', long)]
    autogain: bool,

    /// Frequency correction in ppm
    #[arg(short = 'p', long, default_value_t = 0, allow_negative_numbers = true)]
    ppm: i32,

    /// LimeSDR antenna selection
    #[arg(short = 'X', long, default_value = "Auto")]
    antenna: String,

    /// rtl_tcp host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// rtl_tcp port
    #[arg(short = 'I', long, default_value_t = 1234)]
    port: u16,

    /// Input file for raw-file / wav-file replay
    #[arg(short = 'F', long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Switch off automatic continuation after EOF
    #[arg(short = 'R', long = "no-repeat")]
    no_repeat: bool,

    /// Verbose debug output
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Shared library providing the DAB decoding engine
    #[arg(long = "engine-lib", env = "DAB_LIBRARY", default_value = "libdab_lib.so")]
    engine_lib: PathBuf,

    /// Engine synchronisation threshold
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: i16,

    /// Serve the transparent data channel on this TCP port
    #[arg(long = "data-port", value_name = "PORT")]
    data_port: Option<u16>,

    /// Route PCM through the gap-filling streamer
    #[arg(long)]
    streamer: bool,
}

/// Parameters handed to the device back end uninterpreted
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub kind: DeviceKind,
    pub gain: i32,
    pub vga_gain: i32,
    pub lna_state: i32,
    pub autogain: bool,
    pub ppm: i32,
    pub antenna: String,
    pub host: String,
    pub port: u16,
    pub file: Option<PathBuf>,
    pub repeat: bool,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Output directory for label, DL-Plus and slide files
    pub info_dir: Option<PathBuf>,

    /// Run duration in seconds, -1 for unbounded
    pub duration_secs: i64,

    pub ensemble_timeout: i32,
    pub sync_timeout: i32,

    /// DAB transmission mode (1, 2 or 4)
    pub mode: u8,

    pub band: Band,
    pub channel: String,
    pub program: String,
    pub service_id: Option<u32>,
    pub device: DeviceSettings,
    pub verbose: bool,
    pub engine_lib: PathBuf,
    pub threshold: i16,
    pub data_port: Option<u16>,
    pub streamer: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Bad or missing arguments; the message already carries the usage text
    #[error("{0}")]
    Usage(String),

    /// `--help` / `--version` output
    #[error("{0}")]
    Info(String),
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Usage(_) => 1,
            ConfigError::Info(_) => 0,
        }
    }
}

/// Full option listing
pub fn usage() -> String {
    Cli::command().render_help().to_string()
}

/// Parse the process arguments
pub fn parse() -> Result<Config, ConfigError> {
    parse_from(std::env::args_os())
}

/// Parse an explicit argument list (first item is the program name)
pub fn parse_from<I, T>(args: I) -> Result<Config, ConfigError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    if args.len() <= 1 {
        return Err(ConfigError::Usage(usage()));
    }

    let cli = Cli::try_parse_from(&args).map_err(|e| match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ConfigError::Info(e.to_string()),
        _ => ConfigError::Usage(format!("{}\n{}", e, usage())),
    })?;

    Ok(Config::from(cli))
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let device = DeviceSettings {
            kind: cli.device,
            gain: cli.gain.unwrap_or_else(|| cli.device.default_gain()),
            vga_gain: cli.vga_gain,
            lna_state: cli.lna_state,
            autogain: cli.autogain,
            ppm: cli.ppm,
            antenna: cli.antenna,
            host: cli.host,
            port: cli.port,
            file: cli.file,
            repeat: !cli.no_repeat,
        };

        Self {
            info_dir: cli.info_dir,
            duration_secs: cli.duration.map(|m| 60 * m as i64).unwrap_or(-1),
            ensemble_timeout: cli.ensemble_timeout,
            sync_timeout: cli.sync_timeout,
            mode: parse_mode(&cli.mode),
            band: Band::from_arg(&cli.band),
            channel: cli.channel,
            program: cli.program,
            service_id: cli.service_id,
            device,
            verbose: cli.verbose,
            engine_lib: cli.engine_lib,
            threshold: cli.threshold,
            data_port: cli.data_port,
            streamer: cli.streamer,
        }
    }
}

/// Modes 1, 2 and 4 exist; everything else becomes mode 1
pub fn parse_mode(s: &str) -> u8 {
    match s.trim().parse::<u8>() {
        Ok(m @ (1 | 2 | 4)) => m,
        _ => 1,
    }
}

fn parse_sid(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16).map_err(|e| format!("'{}' is not a hex service id: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let mut full = vec!["dab-cmdline"];
        full.extend_from_slice(args);
        parse_from(full)
    }

    #[test]
    fn test_no_arguments_is_usage_error() {
        let err = parse(&[]).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_unknown_flag_is_usage_error() {
        for args in [&["-Z"][..], &["-C", "11C", "--bogus"][..], &["-q"][..]] {
            let err = parse(args).unwrap_err();
            assert!(matches!(err, ConfigError::Usage(_)));
            assert_eq!(err.exit_code(), 1);
        }
    }

    #[test]
    fn test_unknown_flag_with_any_device() {
        for device in ["rtlsdr", "airspy", "rtl-tcp", "raw-file", "wav-file"] {
            let err = parse(&["--device", device, "-Z"]).unwrap_err();
            assert_eq!(err.exit_code(), 1);
        }
    }

    #[test]
    fn test_help_exits_zero() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.exit_code(), 0);
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["-C", "12C"]).unwrap();
        assert_eq!(config.channel, "12C");
        assert_eq!(config.program, "Sky Radio");
        assert_eq!(config.mode, 1);
        assert_eq!(config.band, Band::BandIII);
        assert_eq!(config.duration_secs, -1);
        assert_eq!(config.sync_timeout, 5);
        assert_eq!(config.ensemble_timeout, 5);
        assert_eq!(config.threshold, 6);
        assert!(config.info_dir.is_none());
        assert!(config.device.repeat);
    }

    #[test]
    fn test_mode_fallback() {
        assert_eq!(parse_mode("1"), 1);
        assert_eq!(parse_mode("2"), 2);
        assert_eq!(parse_mode("4"), 4);
        assert_eq!(parse_mode("3"), 1);
        assert_eq!(parse_mode("0"), 1);
        assert_eq!(parse_mode("abc"), 1);
        assert_eq!(parse(&["-M", "3"]).unwrap().mode, 1);
        assert_eq!(parse(&["-M", "2"]).unwrap().mode, 2);
    }

    #[test]
    fn test_duration_in_minutes() {
        assert_eq!(parse(&["-T", "2"]).unwrap().duration_secs, 120);
        assert_eq!(parse(&["-T", "-1"]).unwrap().duration_secs, -60);
    }

    #[test]
    fn test_service_id_is_hex() {
        let config = parse(&["-S", "e1c238"]).unwrap();
        assert_eq!(config.service_id, Some(0xE1C238));
        let config = parse(&["-S", "0x1234"]).unwrap();
        assert_eq!(config.service_id, Some(0x1234));
        assert_eq!(parse(&["-S", "xyz"]).unwrap_err().exit_code(), 1);
    }

    #[test]
    fn test_device_defaults_and_passthrough() {
        let config = parse(&["--device", "airspy"]).unwrap();
        assert_eq!(config.device.gain, 20);

        let config = parse(&["--device", "rtl-tcp", "-H", "10.0.0.2", "-I", "1235", "-G", "300", "-p", "-3"])
            .unwrap();
        assert_eq!(config.device.kind, DeviceKind::RtlTcp);
        assert_eq!(config.device.host, "10.0.0.2");
        assert_eq!(config.device.port, 1235);
        // out of range values are not validated
        assert_eq!(config.device.gain, 300);
        assert_eq!(config.device.ppm, -3);
    }

    #[test]
    fn test_file_replay_flags() {
        let config = parse(&["--device", "raw-file", "-F", "/tmp/capture.raw", "-R"]).unwrap();
        assert_eq!(config.device.file, Some(PathBuf::from("/tmp/capture.raw")));
        assert!(!config.device.repeat);
    }

    #[test]
    fn test_band_selection() {
        let config = parse(&["-B", "L_BAND", "-C", "LA"]).unwrap();
        assert_eq!(config.band, Band::LBand);
    }
}
