//! rtl_tcp network tuner client

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use num_complex::Complex32;
use tracing::{debug, error, info, warn};

use super::buffer::{IqDecoder, SampleBuffer, SampleFormat};
use super::{DeviceError, DeviceHandler, BUFFER_CAPACITY, SAMPLE_RATE};
use crate::config::DeviceSettings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// rtl_tcp command opcodes
mod cmd {
    pub const SET_FREQUENCY: u8 = 0x01;
    pub const SET_SAMPLE_RATE: u8 = 0x02;
    pub const SET_GAIN_MODE: u8 = 0x03;
    pub const SET_GAIN: u8 = 0x04;
    pub const SET_FREQ_CORRECTION: u8 = 0x05;
    pub const SET_AGC_MODE: u8 = 0x08;
}

/// Five byte command: opcode followed by a big-endian argument
pub fn command(opcode: u8, value: u32) -> [u8; 5] {
    let v = value.to_be_bytes();
    [opcode, v[0], v[1], v[2], v[3]]
}

/// Tuner description sent by the server on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DongleInfo {
    pub tuner_type: u32,
    pub gain_count: u32,
}

pub fn parse_greeting(header: &[u8; 12]) -> Result<DongleInfo, DeviceError> {
    if &header[..4] != b"RTL0" {
        return Err(DeviceError::Protocol(format!(
            "unexpected rtl_tcp greeting {}",
            hex::encode(&header[..4])
        )));
    }
    Ok(DongleInfo {
        tuner_type: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        gain_count: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
    })
}

pub struct RtlTcpClient {
    addr: String,
    control: Mutex<TcpStream>,
    settings: DeviceSettings,
    buffer: Arc<SampleBuffer>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RtlTcpClient {
    pub fn connect(settings: &DeviceSettings) -> Result<Self, DeviceError> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let connect_err = |source| DeviceError::Connect {
            addr: addr.clone(),
            source,
        };
        let socket = addr
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| DeviceError::Protocol(format!("{} does not resolve", addr)))?;

        info!("Connecting to rtl_tcp at {}", addr);
        let mut stream = TcpStream::connect_timeout(&socket, CONNECT_TIMEOUT).map_err(connect_err)?;
        stream.set_nodelay(true)?;

        let mut header = [0u8; 12];
        stream.read_exact(&mut header)?;
        let dongle = parse_greeting(&header)?;
        info!(
            "rtl_tcp tuner type {} with {} gain steps",
            dongle.tuner_type, dongle.gain_count
        );

        let client = Self {
            addr,
            control: Mutex::new(stream),
            settings: settings.clone(),
            buffer: Arc::new(SampleBuffer::new(BUFFER_CAPACITY)),
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        };
        client.configure()?;
        Ok(client)
    }

    fn send(&self, opcode: u8, value: u32) -> Result<(), DeviceError> {
        let mut stream = self
            .control
            .lock()
            .map_err(|_| DeviceError::Protocol("control stream poisoned".into()))?;
        stream.write_all(&command(opcode, value))?;
        Ok(())
    }

    fn configure(&self) -> Result<(), DeviceError> {
        let s = &self.settings;
        self.send(cmd::SET_SAMPLE_RATE, SAMPLE_RATE)?;
        if s.autogain {
            self.send(cmd::SET_GAIN_MODE, 0)?;
            self.send(cmd::SET_AGC_MODE, 1)?;
        } else {
            self.send(cmd::SET_GAIN_MODE, 1)?;
            // gain is given in dB, the server wants tenths
            self.send(cmd::SET_GAIN, (s.gain * 10) as u32)?;
        }
        if s.ppm != 0 {
            self.send(cmd::SET_FREQ_CORRECTION, s.ppm as u32)?;
        }
        Ok(())
    }
}

impl DeviceHandler for RtlTcpClient {
    fn restart_reader(&self, frequency: u32) -> Result<(), DeviceError> {
        self.stop_reader();
        self.buffer.clear();
        self.send(cmd::SET_FREQUENCY, frequency)?;

        let mut stream = self
            .control
            .lock()
            .map_err(|_| DeviceError::Protocol("control stream poisoned".into()))?
            .try_clone()?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let buffer = self.buffer.clone();
        let addr = self.addr.clone();
        let handle = thread::Builder::new()
            .name("rtl-tcp".to_string())
            .spawn(move || {
                let mut decoder = IqDecoder::new(SampleFormat::U8, SAMPLE_RATE, SAMPLE_RATE);
                let mut raw = vec![0u8; 32 * 1024];
                let mut samples: Vec<Complex32> = Vec::with_capacity(16 * 1024);
                while running.load(Ordering::SeqCst) {
                    match stream.read(&mut raw) {
                        Ok(0) => {
                            warn!("rtl_tcp server {} closed the connection", addr);
                            break;
                        }
                        Ok(n) => {
                            samples.clear();
                            decoder.feed(&raw[..n], &mut samples);
                            buffer.push(&samples);
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            error!("rtl_tcp read error: {}", e);
                            break;
                        }
                    }
                }
                running.store(false, Ordering::SeqCst);
                debug!("rtl_tcp reader finished");
            })?;

        if let Ok(mut reader) = self.reader.lock() {
            *reader = Some(handle);
        }
        Ok(())
    }

    fn stop_reader(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = handle {
            info!("Stopping rtl_tcp reader");
            let _ = handle.join();
        }
    }

    fn get_samples(&self, out: &mut [Complex32]) -> usize {
        self.buffer.pop_into(out)
    }

    fn samples(&self) -> usize {
        self.buffer.len()
    }

    fn name(&self) -> &str {
        &self.addr
    }
}

impl Drop for RtlTcpClient {
    fn drop(&mut self) {
        self.stop_reader();
        if let Ok(stream) = self.control.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use std::net::TcpListener;

    #[test]
    fn test_command_encoding() {
        assert_eq!(command(cmd::SET_FREQUENCY, 220_352_000), [0x01, 0x0D, 0x22, 0x4E, 0x00]);
        assert_eq!(
            hex::encode(command(cmd::SET_SAMPLE_RATE, SAMPLE_RATE)),
            "02001f4000"
        );
    }

    #[test]
    fn test_greeting() {
        let mut header = [0u8; 12];
        header[..4].copy_from_slice(b"RTL0");
        header[7] = 5;
        header[11] = 29;
        assert_eq!(
            parse_greeting(&header).unwrap(),
            DongleInfo { tuner_type: 5, gain_count: 29 }
        );
        header[0] = b'X';
        assert!(parse_greeting(&header).is_err());
    }

    #[test]
    fn test_connect_refused() {
        // bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let settings = DeviceSettings {
            kind: DeviceKind::RtlTcp,
            gain: 50,
            vga_gain: 40,
            lna_state: 2,
            autogain: false,
            ppm: 0,
            antenna: "Auto".into(),
            host: "127.0.0.1".into(),
            port,
            file: None,
            repeat: true,
        };
        assert!(matches!(
            RtlTcpClient::connect(&settings),
            Err(DeviceError::Connect { .. })
        ));
    }

    #[test]
    fn test_session_against_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut greeting = [0u8; 12];
            greeting[..4].copy_from_slice(b"RTL0");
            sock.write_all(&greeting).unwrap();
            // sample rate, gain mode, gain, frequency
            let mut commands = [0u8; 20];
            sock.read_exact(&mut commands).unwrap();
            sock.write_all(&[255, 0, 0, 255, 128, 128]).unwrap();
            commands
        });

        let settings = DeviceSettings {
            kind: DeviceKind::RtlTcp,
            gain: 30,
            vga_gain: 40,
            lna_state: 2,
            autogain: false,
            ppm: 0,
            antenna: "Auto".into(),
            host: "127.0.0.1".into(),
            port,
            file: None,
            repeat: true,
        };
        let client = RtlTcpClient::connect(&settings).unwrap();
        client.restart_reader(220_352_000).unwrap();

        let commands = server.join().unwrap();
        assert_eq!(&commands[..5], &command(cmd::SET_SAMPLE_RATE, SAMPLE_RATE));
        assert_eq!(&commands[5..10], &command(cmd::SET_GAIN_MODE, 1));
        assert_eq!(&commands[10..15], &command(cmd::SET_GAIN, 300));
        assert_eq!(&commands[15..20], &command(cmd::SET_FREQUENCY, 220_352_000));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while client.samples() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.samples(), 3);
        client.stop_reader();
    }
}
