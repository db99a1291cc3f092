//! This module is responsible for the command traffic between host and
//! decoder. Every host command is one framed packet answered by an ACK
//! or NAK from the decoder; device responses arrive as one or more
//! framed packets that the host must acknowledge individually.
//!
//! The two primitives are `send` (write a command, await its ACK) and
//! `recv` (collect a response, reassembling continuation streams). The
//! decoder withholds the next fragment of a stream until the previous
//! one has been ACKed, so the reply-ACK always goes out before the
//! continuation bit is considered.

use crate::log;
use crate::packet::{self, NakReason, Opcode, VerifyError};
use crate::serialport::{self, Port};
use std::error::Error as stderr;
use std::fmt;
use std::time::Duration;

/// Budget for the ACK or NAK that answers a host command.
const ACK_TIMEOUT: Duration = Duration::from_millis(1000);
/// Budget for pushing one frame out through the line.
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
/// Budget for the body of a frame once its length byte has arrived, and
/// for the next fragment of a continuation stream.
const FRAME_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Copy, Clone)]
pub enum ErrorKind {
    /// The line went quiet before a complete frame arrived.
    Timeout,
    /// The length byte of a response cannot be right.
    BadLength(u8),
    /// The response does not claim the decoder as its source.
    SourceMismatch(u8),
    ChecksumMismatch,
    /// A well formed frame arrived where an ACK belongs, but with the
    /// wrong opcode.
    UnexpectedOpcode(u8),
    /// The decoder refused the command.
    Nak(NakReason),
    /// The response does not fit the buffer it was to be delivered into.
    Oversize,
    SerialPort(serialport::ErrorKind),
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
        Error {
            kind: ErrorKind::SerialPort(*e.kind()),
            description: e.desc().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Channel<P: Port> {
    port: P,
}

impl<P: Port> Channel<P> {
    pub fn new(port: P) -> Channel<P> {
        Channel { port }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Send one command frame. For anything but a bare ACK or NAK reply
    /// the decoder must answer with an ACK before this returns.
    pub fn send(&self, opcode: Opcode, param: &[u8]) -> Result<()> {
        self.send_with_status(opcode, param, packet::default_status(opcode))
    }

    /// Same as `send` with the STATUS byte picked by the caller, for
    /// session scoped parameter changes.
    pub fn send_with_status(&self, opcode: Opcode, param: &[u8], status: u8) -> Result<()> {
        // Stale bytes from an earlier failed exchange must not be taken
        // for this command's ACK.
        self.port.flush_input()?;
        self.write_frame(opcode, param, status)?;
        match opcode {
            Opcode::Ack | Opcode::Nak => Ok(()),
            _ => self.recv_ack(),
        }
    }

    /// Receive a complete response into `out`, reassembling a
    /// continuation stream, and acknowledge every fragment. Returns the
    /// total number of bytes appended, headers and checksums included.
    /// `timeout` bounds the wait for the first length byte only.
    pub fn recv(&self, out: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut frame = [0u8; packet::MAX_PKG_LEN];
        let mut used = 0;
        let mut wait = timeout;
        loop {
            let wire = match self.read_frame(&mut frame, wait) {
                Ok(n) => n,
                Err(e) => {
                    match e.kind() {
                        // Nothing arrived, nothing to refuse.
                        ErrorKind::Timeout => (),
                        _ => self.send_nak(NakReason::Resend),
                    }
                    return Err(e);
                }
            };
            // The caller's buffer must hold the whole reply. Overflow is
            // reported without acknowledging the fragment, so the decoder
            // does not commit the rest of the stream.
            if used + wire > out.len() {
                return Err(Error::new(
                    ErrorKind::Oversize,
                    "Response does not fit the receive buffer",
                ));
            }
            self.send_ack()?;
            out[used..used + wire].copy_from_slice(&frame[..wire]);
            used += wire;
            if !packet::is_continuation(&frame) {
                return Ok(used);
            }
            wait = FRAME_TIMEOUT;
        }
    }

    fn write_frame(&self, opcode: Opcode, param: &[u8], status: u8) -> Result<()> {
        let frame = match packet::build(opcode, param, status) {
            Ok(f) => f,
            Err(packet::ParamTooLong) => {
                return Err(Error::new(
                    ErrorKind::Oversize,
                    "Parameter block too long for one frame",
                ))
            }
        };
        log::dump_frame("send", &frame);
        let written = self.port.write_exact(&frame, WRITE_TIMEOUT)?;
        if written != frame.len() {
            return Err(Error::new(ErrorKind::Timeout, "Short write sending frame"));
        }
        Ok(())
    }

    /// Read the single frame answering a command and insist on an ACK.
    fn recv_ack(&self) -> Result<()> {
        let mut frame = [0u8; packet::MAX_PKG_LEN];
        self.read_frame(&mut frame, ACK_TIMEOUT)?;
        let opcode = frame[packet::INDEX_OPCODE];
        match Opcode::from_value(opcode) {
            Ok(Opcode::Ack) => Ok(()),
            Ok(Opcode::Nak) => {
                let reason = NakReason::from_value(frame[packet::INDEX_STAT]);
                Err(Error::new(
                    ErrorKind::Nak(reason),
                    &format!("Command refused: NAK {:?}", reason),
                ))
            }
            _ => Err(Error::new(
                ErrorKind::UnexpectedOpcode(opcode),
                &format!("Expected ACK, got opcode 0x{:02x}", opcode),
            )),
        }
    }

    /// Read one complete frame into `buf`: length byte, body, then source
    /// and checksum validation. Returns the wire length.
    fn read_frame(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let nbytes = self.port.read_exact(&mut buf[..1], timeout)?;
        if nbytes == 0 {
            return Err(Error::new(ErrorKind::Timeout, "No response from scanner"));
        }
        let len = buf[packet::INDEX_LEN] as usize;
        if len < packet::SSI_HEADER_LEN || len + packet::SSI_CHECKSUM_LEN > buf.len() {
            return Err(Error::new(
                ErrorKind::BadLength(buf[packet::INDEX_LEN]),
                "Invalid length byte in response header",
            ));
        }
        let rest = len + packet::SSI_CHECKSUM_LEN - 1;
        let nbytes = self.port.read_exact(&mut buf[1..=rest], FRAME_TIMEOUT)?;
        if nbytes != rest {
            return Err(Error::new(ErrorKind::Timeout, "Truncated frame from scanner"));
        }
        let wire = len + packet::SSI_CHECKSUM_LEN;
        log::dump_frame("recv", &buf[..wire]);
        match packet::verify(&buf[..wire]) {
            Ok(()) => Ok(wire),
            Err(VerifyError::SourceMismatch(src)) => Err(Error::new(
                ErrorKind::SourceMismatch(src),
                &format!("Frame claims source 0x{:02x}, not the decoder", src),
            )),
            Err(VerifyError::ChecksumMismatch) => Err(Error::new(
                ErrorKind::ChecksumMismatch,
                "Frame checksum mismatch",
            )),
        }
    }

    /// Bare ACK reply. No input flush here: the decoder is quiet until it
    /// sees this frame, and flushing could race the next command's setup.
    fn send_ack(&self) -> Result<()> {
        self.write_frame(Opcode::Ack, &[], packet::STAT_TEMPORARY)
    }

    /// NAK reply carrying the reason in the STATUS byte. Whatever remains
    /// of the bad exchange is dropped first. Failure to deliver the NAK
    /// is logged and swallowed; the caller already has the real error.
    fn send_nak(&self, reason: NakReason) {
        if self.port.flush_input().is_err() {
            return;
        }
        if let Err(e) = self.write_frame(Opcode::Nak, &[], reason.value()) {
            log::warn(&format!("channel: NAK reply not sent: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        INDEX_OPCODE, INDEX_SRC, INDEX_STAT, SSI_HOST, STAT_CONTINUATION, STAT_TEMPORARY,
    };
    use crate::serialport::mock::{decoder_frame, MockPort};

    const RECV_TIMEOUT: Duration = Duration::from_millis(100);

    fn channel() -> Channel<MockPort> {
        Channel::new(MockPort::new())
    }

    // Split a byte stream back into frames by their length prefix.
    fn split_frames(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut at = 0;
        while at < bytes.len() {
            let wire = bytes[at] as usize + 2;
            frames.push(bytes[at..at + wire].to_vec());
            at += wire;
        }
        frames
    }

    // A command goes out as one well formed frame and the decoder's ACK
    // completes it
    #[test]
    fn test_send_with_ack() {
        let ch = channel();
        ch.port.script(&decoder_frame(Opcode::Ack, STAT_TEMPORARY, &[]));
        let res = ch.send(Opcode::ScanEnable, &[]);
        assert!(res.is_ok());
        // Worked example: 04 E9 04 08 sums to 0xF9, checksum 0xFF07.
        assert_eq!(vec![0x04, 0xE9, 0x04, 0x08, 0xFF, 0x07], ch.port.written());
        // The input queue was flushed before the command went out.
        assert!(ch.port.flush_count() > 0);
    }

    // A command that never gets an answer fails with a timeout
    #[test]
    fn test_send_without_ack_times_out() {
        let ch = channel();
        let err = match ch.send(Opcode::StartSession, &[]) {
            Ok(_) => panic!("send succeeded with no ACK"),
            Err(e) => e,
        };
        match err.kind() {
            ErrorKind::Timeout => (),
            k => panic!("expected Timeout, got {:?}", k),
        }
    }

    // A NAK reply surfaces its reason code from the STATUS byte
    #[test]
    fn test_send_refused_with_nak() {
        let ch = channel();
        ch.port
            .script(&decoder_frame(Opcode::Nak, NakReason::Denied.value(), &[]));
        let err = match ch.send(Opcode::StartSession, &[]) {
            Ok(_) => panic!("send succeeded against a NAK"),
            Err(e) => e,
        };
        match err.kind() {
            ErrorKind::Nak(NakReason::Denied) => (),
            k => panic!("expected NAK(Denied), got {:?}", k),
        }
    }

    // A frame that is neither ACK nor NAK in the answer slot is an error
    #[test]
    fn test_send_unexpected_answer() {
        let ch = channel();
        ch.port
            .script(&decoder_frame(Opcode::DecodeEvent, STAT_TEMPORARY, &[0x01]));
        let err = match ch.send(Opcode::FlushQueue, &[]) {
            Ok(_) => panic!("send accepted a decode event as ACK"),
            Err(e) => e,
        };
        match err.kind() {
            ErrorKind::UnexpectedOpcode(0xF0) => (),
            k => panic!("expected UnexpectedOpcode, got {:?}", k),
        }
    }

    // An ACK reply is itself never ACKed
    #[test]
    fn test_ack_is_not_acked() {
        let ch = channel();
        assert!(ch.send(Opcode::Ack, &[]).is_ok());
        assert_eq!(1, split_frames(&ch.port.written()).len());
    }

    // One fragment in, one ACK out
    #[test]
    fn test_recv_single_frame() {
        let ch = channel();
        let reply = decoder_frame(Opcode::DecodeData, STAT_TEMPORARY, b"\x0b12345");
        ch.port.script(&reply);
        let mut out = [0u8; 64];
        let n = ch.recv(&mut out, RECV_TIMEOUT).ok().unwrap();
        assert_eq!(reply.len(), n);
        assert_eq!(reply[..], out[..n]);
        let written = split_frames(&ch.port.written());
        assert_eq!(1, written.len());
        assert_eq!(Opcode::Ack.value(), written[0][INDEX_OPCODE]);
        assert_eq!(SSI_HOST, written[0][INDEX_SRC]);
    }

    // Fragments with the continuation bit are concatenated in order and
    // each one is ACKed before the next is consumed
    #[test]
    fn test_recv_reassembles_continuation_stream() {
        let ch = channel();
        let first = decoder_frame(Opcode::DecodeData, STAT_CONTINUATION, b"\x0b12345");
        let second = decoder_frame(Opcode::DecodeData, STAT_TEMPORARY, b"\x0b67890");
        ch.port.script(&first);
        ch.port.script(&second);
        let mut out = [0u8; 128];
        let n = ch.recv(&mut out, RECV_TIMEOUT).ok().unwrap();
        assert_eq!(first.len() + second.len(), n);
        assert_eq!(first[..], out[..first.len()]);
        assert_eq!(second[..], out[first.len()..n]);
        let acks = split_frames(&ch.port.written());
        assert_eq!(2, acks.len());
        assert_eq!(Opcode::Ack.value(), acks[0][INDEX_OPCODE]);
        assert_eq!(Opcode::Ack.value(), acks[1][INDEX_OPCODE]);
    }

    // A corrupted trailer is answered with a well formed NAK(RESEND)
    #[test]
    fn test_recv_naks_bad_checksum() {
        let ch = channel();
        let mut reply = decoder_frame(Opcode::DecodeData, STAT_TEMPORARY, b"\x0b12345");
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        ch.port.script(&reply);
        let mut out = [0u8; 64];
        let err = match ch.recv(&mut out, RECV_TIMEOUT) {
            Ok(_) => panic!("recv accepted a corrupt frame"),
            Err(e) => e,
        };
        match err.kind() {
            ErrorKind::ChecksumMismatch => (),
            k => panic!("expected ChecksumMismatch, got {:?}", k),
        }
        let naks = split_frames(&ch.port.written());
        assert_eq!(1, naks.len());
        assert_eq!(Opcode::Nak.value(), naks[0][INDEX_OPCODE]);
        assert_eq!(NakReason::Resend.value(), naks[0][INDEX_STAT]);
        // The NAK itself must carry a valid checksum.
        let len = naks[0][0] as usize;
        let ck = packet::checksum(&naks[0][..len]);
        assert_eq!((ck >> 8) as u8, naks[0][len]);
        assert_eq!((ck & 0xFF) as u8, naks[0][len + 1]);
    }

    // A frame claiming a host source is refused
    #[test]
    fn test_recv_naks_host_sourced_frame() {
        let ch = channel();
        let mut reply = decoder_frame(Opcode::DecodeData, STAT_TEMPORARY, b"\x0b12345");
        reply[INDEX_SRC] = SSI_HOST;
        ch.port.script(&reply);
        let mut out = [0u8; 64];
        let err = match ch.recv(&mut out, RECV_TIMEOUT) {
            Ok(_) => panic!("recv accepted a host sourced frame"),
            Err(e) => e,
        };
        match err.kind() {
            ErrorKind::SourceMismatch(src) => assert_eq!(SSI_HOST, *src),
            k => panic!("expected SourceMismatch, got {:?}", k),
        }
        let naks = split_frames(&ch.port.written());
        assert_eq!(Opcode::Nak.value(), naks[0][INDEX_OPCODE]);
    }

    // A length byte below the header size is rejected with a NAK
    #[test]
    fn test_recv_rejects_bad_length() {
        let ch = channel();
        ch.port.script(&[0x02, 0xF3, 0x00]);
        let mut out = [0u8; 64];
        let err = match ch.recv(&mut out, RECV_TIMEOUT) {
            Ok(_) => panic!("recv accepted an impossible length"),
            Err(e) => e,
        };
        match err.kind() {
            ErrorKind::BadLength(0x02) => (),
            k => panic!("expected BadLength, got {:?}", k),
        }
        let naks = split_frames(&ch.port.written());
        assert_eq!(Opcode::Nak.value(), naks[0][INDEX_OPCODE]);
    }

    // A reply bigger than the caller's buffer fails before any ACK goes
    // out, so the decoder does not keep streaming
    #[test]
    fn test_recv_overflow_fails_without_ack() {
        let ch = channel();
        let reply = decoder_frame(Opcode::DecodeData, STAT_TEMPORARY, b"\x0b123456789");
        ch.port.script(&reply);
        let mut out = [0u8; 8];
        let err = match ch.recv(&mut out, RECV_TIMEOUT) {
            Ok(_) => panic!("recv fit a reply bigger than the buffer"),
            Err(e) => e,
        };
        match err.kind() {
            ErrorKind::Oversize => (),
            k => panic!("expected Oversize, got {:?}", k),
        }
        assert!(ch.port.written().is_empty());
    }

    // Quiet line: no bytes at all means timeout, and no NAK is emitted
    #[test]
    fn test_recv_timeout_is_silent() {
        let ch = channel();
        let mut out = [0u8; 64];
        let err = match ch.recv(&mut out, RECV_TIMEOUT) {
            Ok(_) => panic!("recv returned without input"),
            Err(e) => e,
        };
        match err.kind() {
            ErrorKind::Timeout => (),
            k => panic!("expected Timeout, got {:?}", k),
        }
        assert!(ch.port.written().is_empty());
    }
}
