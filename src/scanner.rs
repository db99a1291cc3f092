//! The scanner facade: open a decoder on a TTY, run one scan session,
//! hand back the barcode bytes. A scan is a fixed command script; if any
//! step of it fails the session is still closed so the decoder is never
//! left decoding into the void.
use crate::channel::{self, Channel};
use crate::packet::{self, NakReason, Opcode};
use crate::serialport::{self, BaudRate, Port, SerialPort};
use std::env;
use std::error::Error as stderr;
use std::fmt;
use std::time::Duration;

/// Scanners talk 9600 baud out of the box.
pub const DEFAULT_BAUD: BaudRate = BaudRate::B9600;
const DEFAULT_DEVICE: &str = "/dev/ttyACM0";
/// Room for the longest multi-fragment decode response.
const DECODE_BUFFER_LEN: usize = 4000;
/// How long to wait for something to pass in front of the scanner.
const DECODE_TIMEOUT: Duration = Duration::from_secs(10);

// Parameter numbers and values used in the PARAM_SEND blocks.
const PARAM_BEEP_NONE: u8 = 0xFF;
const PARAM_DEC_FORMAT: u8 = 0xEE;
const PARAM_SW_ACK: u8 = 0x9F;
const PARAM_SCAN_PARAM: u8 = 0xEC;
const PARAM_TRIGGER_MODE: u8 = 0x8A;
const PARAM_TRIGGER_PRESENT: u8 = 0x07;
const PARAM_TRIGGER_HOST: u8 = 0x08;
const PARAM_GROUP_F0: u8 = 0xF0;
const PARAM_DEC_EVENT: u8 = 0x00;
const PARAM_ENABLE: u8 = 0x01;
const PARAM_DISABLE: u8 = 0x00;

#[derive(Debug, Copy, Clone)]
pub enum ErrorKind {
    /// The line could not be opened, configured, read or written in time.
    Transport,
    /// The decoder sent something the protocol does not allow here.
    Protocol,
    /// The decoder refused a command.
    Nak(NakReason),
    /// The barcode does not fit the buffer the caller provided.
    BufferTooSmall,
    /// A step of the scan script failed; the session was closed anyway.
    Session,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    description: String,
}

impl Error {
    fn new(kind: ErrorKind, description: &str) -> Error {
        Error {
            kind,
            description: description.to_string(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn desc(&self) -> &String {
        &self.description
    }
}

impl stderr for Error {}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        fmt.write_str(&self.description)
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Error {
        Error::new(ErrorKind::Transport, e.desc())
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Error {
        let kind = match e.kind() {
            channel::ErrorKind::SerialPort(_) | channel::ErrorKind::Timeout => ErrorKind::Transport,
            channel::ErrorKind::Nak(reason) => ErrorKind::Nak(*reason),
            channel::ErrorKind::Oversize => ErrorKind::BufferTooSmall,
            _ => ErrorKind::Protocol,
        };
        Error::new(kind, e.desc())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum TriggerMode {
    /// Decode whenever something passes in front of the scanner.
    Auto,
    /// Decode only when the host opens a session.
    Manual,
}

pub struct Scanner<P: Port> {
    channel: Channel<P>,
    decode_timeout: Duration,
}

impl Scanner<SerialPort> {
    /// Open the device, put the line into raw mode and switch the decoder
    /// into software ACK packeted decode for the lifetime of the handle.
    /// The switch is sent as a temporary change so nothing is persisted
    /// behind the user's back.
    pub fn open(path: &str, baud: BaudRate) -> Result<Scanner<SerialPort>> {
        let mut port = SerialPort::new(path, baud);
        port.open()?;
        let scanner = Scanner::with_port(port);
        scanner.channel.send_with_status(
            Opcode::ParamSend,
            &session_params(),
            packet::STAT_TEMPORARY,
        )?;
        Ok(scanner)
    }

    /// Release the device. Closing a closed handle is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.channel.port_mut().close()?;
        Ok(())
    }
}

impl<P: Port> Scanner<P> {
    fn with_port(port: P) -> Scanner<P> {
        Scanner {
            channel: Channel::new(port),
            decode_timeout: DECODE_TIMEOUT,
        }
    }

    pub fn set_decode_timeout(&mut self, timeout: Duration) {
        self.decode_timeout = timeout;
    }

    /// Run one scan session and copy the decoded barcode into `out`,
    /// returning its length. STOP_SESSION goes out on every exit path.
    pub fn read_barcode(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut raw = [0u8; DECODE_BUFFER_LEN];
        let result = self.run_session(&mut raw);
        let stopped = self.channel.send(Opcode::StopSession, &[]);
        let assembled = match result {
            Ok(n) => n,
            Err(e) => {
                // NAK and overflow keep their identity; everything else
                // is a failed scan.
                let kind = match e.kind() {
                    ErrorKind::Nak(_) | ErrorKind::BufferTooSmall => *e.kind(),
                    _ => ErrorKind::Session,
                };
                return Err(Error::new(kind, e.desc()));
            }
        };
        if let Err(e) = stopped {
            return Err(Error::new(
                ErrorKind::Session,
                &format!("Scan finished but the session was not closed: {}", e),
            ));
        }
        extract_barcode(&raw[..assembled], out)
    }

    /// The scripted part of a scan: quiesce the laser, drop stale
    /// decodes, re-arm, open a decode window, then collect the decode
    /// event and the data that follows it.
    fn run_session(&self, raw: &mut [u8]) -> Result<usize> {
        self.channel.send(Opcode::ScanDisable, &[])?;
        self.channel.send(Opcode::FlushQueue, &[])?;
        self.channel.send(Opcode::ScanEnable, &[])?;
        self.channel.send(Opcode::StartSession, &[])?;

        let mut event = [0u8; packet::MAX_PKG_LEN];
        self.channel.recv(&mut event, self.decode_timeout)?;
        let opcode = event[packet::INDEX_OPCODE];
        match Opcode::from_value(opcode) {
            Ok(Opcode::DecodeEvent) => (),
            _ => {
                return Err(Error::new(
                    ErrorKind::Protocol,
                    &format!("Expected a decode event, got opcode 0x{:02x}", opcode),
                ))
            }
        }

        let n = self.channel.recv(raw, self.decode_timeout)?;
        Ok(n)
    }
}

/// Configure and persist the decoder's trigger mode along with the
/// handshake parameters: `Auto` decodes on presence, `Manual` waits for
/// the host to open a session.
pub fn setup(path: &str, baud: BaudRate, mode: TriggerMode) -> Result<()> {
    let mut port = SerialPort::new(path, baud);
    port.open()?;
    let mut scanner = Scanner::with_port(port);
    let result = scanner.channel.send(Opcode::ParamSend, &setup_params(mode));
    let closed = scanner.close();
    result?;
    closed?;
    Ok(())
}

/// The device the driver picks when the caller does not name one: the
/// ZEBRA_SCANNER environment variable, then the stock CDC ACM path.
pub fn default_device() -> String {
    match env::var("ZEBRA_SCANNER") {
        Ok(path) => path,
        Err(_) => DEFAULT_DEVICE.to_string(),
    }
}

/// Walk a reassembled decode response and copy out the barcode bytes.
/// Each fragment contributes its parameter bytes minus the leading
/// symbology identifier; fragments are concatenated in order. A fragment
/// that does not fit `out` stops the walk without writing any part of
/// that fragment.
pub fn extract_barcode(raw: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut at = 0;
    let mut copied = 0;
    while at < raw.len() {
        let len = raw[at + packet::INDEX_LEN] as usize;
        let part = len.saturating_sub(packet::SSI_HEADER_LEN + 1);
        let start = at + packet::SSI_HEADER_LEN + 1;
        if copied + part > out.len() {
            return Err(Error::new(
                ErrorKind::BufferTooSmall,
                "Barcode does not fit the output buffer",
            ));
        }
        out[copied..copied + part].copy_from_slice(&raw[start..start + part]);
        copied += part;
        at += packet::wire_len(&raw[at..]);
    }
    Ok(copied)
}

/// Session scoped decoder setup sent on open: no beep, decimal data
/// format, software ACK handshaking, in-band parameter scanning off,
/// decode event reporting on. Trigger mode is deliberately left alone;
/// that belongs to `setup`.
fn session_params() -> [u8; 10] {
    [
        PARAM_BEEP_NONE,
        PARAM_DEC_FORMAT,
        PARAM_ENABLE,
        PARAM_SW_ACK,
        PARAM_ENABLE,
        PARAM_SCAN_PARAM,
        PARAM_DISABLE,
        PARAM_GROUP_F0,
        PARAM_DEC_EVENT,
        PARAM_ENABLE,
    ]
}

/// The persisted configuration block: the session block plus the chosen
/// trigger mode.
fn setup_params(mode: TriggerMode) -> [u8; 12] {
    let trigger = match mode {
        TriggerMode::Auto => PARAM_TRIGGER_PRESENT,
        TriggerMode::Manual => PARAM_TRIGGER_HOST,
    };
    [
        PARAM_BEEP_NONE,
        PARAM_DEC_FORMAT,
        PARAM_ENABLE,
        PARAM_SW_ACK,
        PARAM_ENABLE,
        PARAM_SCAN_PARAM,
        PARAM_DISABLE,
        PARAM_TRIGGER_MODE,
        trigger,
        PARAM_GROUP_F0,
        PARAM_DEC_EVENT,
        PARAM_ENABLE,
    ]
}
