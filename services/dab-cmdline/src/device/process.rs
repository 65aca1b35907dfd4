//! Hardware receivers driven through their vendor capture tools
//!
//! Spawns `rtl_sdr`, `airspy_rx`, `hackrf_transfer` or `rx_sdr` (SoapySDR,
//! used for SDRplay and LimeSDR) writing raw IQ to stdout, and feeds the
//! converted samples into the shared buffer.

use std::io::{BufRead, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use num_complex::Complex32;
use tracing::{debug, error, info, warn};

use super::buffer::{IqDecoder, SampleBuffer, SampleFormat};
use super::{
    corrected_frequency, DeviceError, DeviceHandler, DeviceKind, BUFFER_CAPACITY, SAMPLE_RATE,
};
use crate::config::DeviceSettings;

/// Airspy only offers 2.5 and 10 MS/s
const AIRSPY_RATE: u32 = 2_500_000;

/// Read size from the tool's stdout
const READ_SIZE: usize = 64 * 1024;

/// Command line for one capture tool
#[derive(Debug, Clone)]
pub struct ToolCommand {
    kind: DeviceKind,
    program: PathBuf,
    settings: DeviceSettings,
}

impl ToolCommand {
    pub fn for_device(kind: DeviceKind, settings: &DeviceSettings) -> Result<Self, DeviceError> {
        let (tool, env) = tool_for(kind);
        let program = locate_tool(tool, env).ok_or(DeviceError::ToolNotFound { tool, env })?;
        Ok(Self::with_program(kind, program, settings))
    }

    /// Use an explicit tool binary
    pub fn with_program(kind: DeviceKind, program: PathBuf, settings: &DeviceSettings) -> Self {
        Self {
            kind,
            program,
            settings: settings.clone(),
        }
    }

    pub fn format(&self) -> SampleFormat {
        match self.kind {
            DeviceKind::Hackrf => SampleFormat::I8,
            DeviceKind::Airspy | DeviceKind::Sdrplay | DeviceKind::Lime => SampleFormat::I16Le,
            _ => SampleFormat::U8,
        }
    }

    pub fn input_rate(&self) -> u32 {
        match self.kind {
            DeviceKind::Airspy => AIRSPY_RATE,
            _ => SAMPLE_RATE,
        }
    }

    pub fn args(&self, frequency: u32) -> Vec<String> {
        let s = &self.settings;
        let mut args: Vec<String> = Vec::new();
        match self.kind {
            DeviceKind::Airspy => {
                let freq = corrected_frequency(frequency, s.ppm);
                opt(&mut args, "-r", "/dev/stdout");
                opt(&mut args, "-f", format!("{:.6}", freq as f64 / 1e6));
                opt(&mut args, "-a", AIRSPY_RATE);
                // INT16_IQ
                opt(&mut args, "-t", "2");
                if !s.autogain {
                    opt(&mut args, "-g", s.gain);
                }
            }
            DeviceKind::Hackrf => {
                let freq = corrected_frequency(frequency, s.ppm);
                opt(&mut args, "-r", "-");
                opt(&mut args, "-f", freq);
                opt(&mut args, "-s", SAMPLE_RATE);
                opt(&mut args, "-l", s.gain);
                opt(&mut args, "-g", s.vga_gain);
            }
            DeviceKind::Sdrplay => {
                opt(&mut args, "-d", "driver=sdrplay");
                opt(&mut args, "-f", frequency);
                opt(&mut args, "-s", SAMPLE_RATE);
                opt(&mut args, "-F", "CS16");
                if s.ppm != 0 {
                    opt(&mut args, "-p", s.ppm);
                }
                if !s.autogain {
                    opt(&mut args, "-g", format!("IFGR={},RFGR={}", s.gain, s.lna_state));
                }
                args.push("-".to_string());
            }
            DeviceKind::Lime => {
                let freq = corrected_frequency(frequency, s.ppm);
                opt(&mut args, "-d", "driver=lime");
                opt(&mut args, "-f", freq);
                opt(&mut args, "-s", SAMPLE_RATE);
                opt(&mut args, "-F", "CS16");
                opt(&mut args, "-g", s.gain);
                if s.antenna != "Auto" {
                    opt(&mut args, "-a", &s.antenna);
                }
                args.push("-".to_string());
            }
            _ => {
                opt(&mut args, "-f", frequency);
                opt(&mut args, "-s", SAMPLE_RATE);
                if !s.autogain {
                    // rtl_sdr takes dB; the command line gain is 0..100 of the tuner range
                    opt(&mut args, "-g", format!("{:.1}", s.gain as f32 * 0.496));
                }
                if s.ppm != 0 {
                    opt(&mut args, "-p", s.ppm);
                }
                args.push("-".to_string());
            }
        }
        args
    }
}

fn opt(args: &mut Vec<String>, flag: &str, value: impl ToString) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

fn tool_for(kind: DeviceKind) -> (&'static str, &'static str) {
    match kind {
        DeviceKind::Airspy => ("airspy_rx", "AIRSPY_RX_PATH"),
        DeviceKind::Hackrf => ("hackrf_transfer", "HACKRF_TRANSFER_PATH"),
        DeviceKind::Sdrplay | DeviceKind::Lime => ("rx_sdr", "RX_SDR_PATH"),
        _ => ("rtl_sdr", "RTL_SDR_PATH"),
    }
}

/// Find a tool: explicit environment override first, then `PATH`
fn locate_tool(tool: &str, env: &str) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(env) {
        let path = PathBuf::from(path);
        return path.is_file().then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

struct Worker {
    child: Child,
    reader: JoinHandle<()>,
}

/// Capture controller for one tool-driven receiver
pub struct ToolCapture {
    command: ToolCommand,
    buffer: Arc<SampleBuffer>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
    name: String,
}

impl ToolCapture {
    pub fn new(command: ToolCommand) -> Self {
        let name = format!("{:?} ({})", command.kind, command.program.display());
        Self {
            command,
            buffer: Arc::new(SampleBuffer::new(BUFFER_CAPACITY)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            name,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl DeviceHandler for ToolCapture {
    fn restart_reader(&self, frequency: u32) -> Result<(), DeviceError> {
        self.stop_reader();
        self.buffer.clear();

        let mut cmd = Command::new(&self.command.program);
        cmd.args(self.command.args(frequency))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!("Executing: {:?}", cmd);
        let mut child = cmd.spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Protocol("failed to capture tool stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let tool = tool_for(self.command.kind).0;
            let logger = thread::Builder::new()
                .name("sdr-stderr".to_string())
                .spawn(move || {
                    let reader = std::io::BufReader::new(stderr);
                    for line in reader.lines().map_while(Result::ok) {
                        if !line.trim().is_empty() {
                            debug!("[{}] {}", tool, line.trim());
                        }
                    }
                });
            if let Err(e) = logger {
                warn!("cannot log {} output: {}", tool, e);
            }
        }

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let buffer = self.buffer.clone();
        let mut decoder = IqDecoder::new(self.command.format(), self.command.input_rate(), SAMPLE_RATE);
        let reader = thread::Builder::new()
            .name("sdr-capture".to_string())
            .spawn(move || {
                let mut raw = vec![0u8; READ_SIZE];
                let mut samples: Vec<Complex32> = Vec::with_capacity(READ_SIZE);
                let mut first_data = true;
                while running.load(Ordering::SeqCst) {
                    match stdout.read(&mut raw) {
                        Ok(0) => {
                            warn!("capture tool closed its output (EOF)");
                            break;
                        }
                        Ok(n) => {
                            if first_data {
                                info!("First IQ data received ({} bytes)", n);
                                first_data = false;
                            }
                            samples.clear();
                            decoder.feed(&raw[..n], &mut samples);
                            buffer.push(&samples);
                        }
                        Err(e) => {
                            error!("Error reading from capture tool: {}", e);
                            break;
                        }
                    }
                }
                running.store(false, Ordering::SeqCst);
            })?;

        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(Worker { child, reader });
        }
        Ok(())
    }

    fn stop_reader(&self) {
        let worker = match self.worker.lock() {
            Ok(mut w) => w.take(),
            Err(_) => None,
        };
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut worker) = worker {
            info!("Stopping {}", self.name);
            // Killing the tool closes the pipe, which unblocks the reader
            let _ = worker.child.kill();
            let _ = worker.child.wait();
            let _ = worker.reader.join();
            if self.buffer.dropped() > 0 {
                debug!("{} samples dropped while the engine was busy", self.buffer.dropped());
            }
        }
    }

    fn get_samples(&self, out: &mut [Complex32]) -> usize {
        self.buffer.pop_into(out)
    }

    fn samples(&self) -> usize {
        self.buffer.len()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ToolCapture {
    fn drop(&mut self) {
        self.stop_reader();
    }
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
            port: 1234,
            file: None,
            repeat: true,
        }
    }

    #[test]
    fn test_rtl_sdr_args() {
        let mut s = settings(DeviceKind::Rtlsdr);
        s.ppm = 12;
        let cmd = ToolCommand::with_program(DeviceKind::Rtlsdr, "rtl_sdr".into(), &s);
        let args = cmd.args(220_352_000);
        assert_eq!(
            args,
            vec!["-f", "220352000", "-s", "2048000", "-g", "24.8", "-p", "12", "-"]
        );
        assert_eq!(cmd.format(), SampleFormat::U8);
    }

    #[test]
    fn test_rtl_sdr_autogain_omits_gain() {
        let mut s = settings(DeviceKind::Rtlsdr);
        s.autogain = true;
        let cmd = ToolCommand::with_program(DeviceKind::Rtlsdr, "rtl_sdr".into(), &s);
        assert!(!cmd.args(220_352_000).contains(&"-g".to_string()));
    }

    #[test]
    fn test_airspy_resamples() {
        let s = settings(DeviceKind::Airspy);
        let cmd = ToolCommand::with_program(DeviceKind::Airspy, "airspy_rx".into(), &s);
        assert_eq!(cmd.input_rate(), 2_500_000);
        let args = cmd.args(220_352_000);
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "220.352000"));
    }

    #[test]
    fn test_soapy_driver_strings() {
        let s = settings(DeviceKind::Sdrplay);
        let cmd = ToolCommand::with_program(DeviceKind::Sdrplay, "rx_sdr".into(), &s);
        let args = cmd.args(220_352_000);
        assert!(args.contains(&"driver=sdrplay".to_string()));
        assert!(args.contains(&"IFGR=30,RFGR=2".to_string()));

        let mut s = settings(DeviceKind::Lime);
        s.antenna = "LNAW".into();
        let cmd = ToolCommand::with_program(DeviceKind::Lime, "rx_sdr".into(), &s);
        let args = cmd.args(220_352_000);
        assert!(args.contains(&"driver=lime".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-a" && w[1] == "LNAW"));
    }

    #[test]
    fn test_hackrf_format() {
        let s = settings(DeviceKind::Hackrf);
        let cmd = ToolCommand::with_program(DeviceKind::Hackrf, "hackrf_transfer".into(), &s);
        assert_eq!(cmd.format(), SampleFormat::I8);
        let args = cmd.args(220_352_000);
        assert!(args.windows(2).any(|w| w[0] == "-g" && w[1] == "40"));
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_from_tool_output() {
        // echo stands in for rtl_sdr: it writes its own arguments as "IQ" bytes
        let s = settings(DeviceKind::Rtlsdr);
        let cmd = ToolCommand::with_program(DeviceKind::Rtlsdr, "/bin/echo".into(), &s);
        let expected = (cmd.args(220_352_000).join(" ").len() + 1) / 2;
        let capture = ToolCapture::new(cmd);

        capture.restart_reader(220_352_000).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while capture.samples() < expected && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(capture.samples(), expected);

        let mut out = vec![Complex32::new(0.0, 0.0); 4];
        assert_eq!(capture.get_samples(&mut out), 4);
        capture.stop_reader();
        capture.stop_reader();
        assert!(!capture.is_running());
    }
}
