//! XMODEM-128/CRC file transfer.
//!
//! The bootloader receives every image over the classic 128-byte XMODEM
//! variant with a 16-bit CRC trailer:
//!
//! ```text
//! Block format:
//! +-----+-----+------+--------------+--------+
//! | SOH | SEQ | ~SEQ |  DATA (128)  | CRC16  |
//! +-----+-----+------+--------------+--------+
//! | 1   | 1   | 1    |     128      | 2      |
//! +-----+-----+------+--------------+--------+
//! ```
//!
//! Block numbers start at 1 and wrap modulo 256 (1, 2, ..., 255, 0, 1, ...).
//! The final block is padded to 128 bytes with 0xFF. A NAK is retried exactly
//! once per block; silence aborts the attempt. The caller owns the outer
//! retry around "send start opcode, read banner, run transfer".

use crate::error::{Error, Result};
use crate::protocol::crc::crc16_xmodem;
use log::{debug, trace};
use std::io::{Read, Write};

/// XMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Payload size of every block.
pub const BLOCK_SIZE: usize = 128;

/// Pad byte for the final block.
pub const PAD_BYTE: u8 = 0xFF;

/// Single-byte reads polled for 'C' before giving up on negotiation.
const NEGOTIATION_POLLS: u32 = 10;

/// Extra attempts allowed per NAKed block. Exactly one; a block that is
/// rejected twice fails the whole attempt.
const BLOCK_RETRY_LIMIT: u32 = 1;

/// XMODEM transfer handler for one send attempt.
pub struct XmodemTransfer<'a, P: Read + Write> {
    port: &'a mut P,
    crc_ready: bool,
}

impl<'a, P: Read + Write> XmodemTransfer<'a, P> {
    /// Create a new transfer handler.
    pub fn new(port: &'a mut P) -> Self {
        Self {
            port,
            crc_ready: false,
        }
    }

    /// Mark the receiver as already CRC-negotiated.
    ///
    /// Set when the command banner already carried the `C` request, in which
    /// case [`XmodemTransfer::send`] skips polling for it.
    #[must_use]
    pub fn crc_ready(mut self, ready: bool) -> Self {
        self.crc_ready = ready;
        self
    }

    /// Read a single byte; `Ok(None)` on a per-call timeout.
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Poll for the receiver's 'C' (CRC mode request).
    fn negotiate(&mut self) -> Result<()> {
        if self.crc_ready {
            trace!("banner already carried 'C', skipping negotiation");
            return Ok(());
        }

        debug!("Waiting for 'C' from receiver...");
        let mut misses = 0;
        loop {
            match self.read_byte()? {
                Some(control::C) => return Ok(()),
                other => {
                    if let Some(c) = other {
                        trace!("Received unexpected char: 0x{c:02X}");
                    }
                    misses += 1;
                    if misses == NEGOTIATION_POLLS {
                        return Err(Error::Transfer("negotiation failed".into()));
                    }
                },
            }
        }
    }

    /// Build one framed block: SOH, number, complement, padded data, CRC.
    fn build_block(number: u8, data: &[u8]) -> Vec<u8> {
        debug_assert!(data.len() <= BLOCK_SIZE);

        let mut block = Vec::with_capacity(3 + BLOCK_SIZE + 2);
        block.push(control::SOH);
        block.push(number);
        block.push(0xFF - number);
        block.extend_from_slice(data);
        block.resize(3 + BLOCK_SIZE, PAD_BYTE);

        let crc = crc16_xmodem(&block[3..3 + BLOCK_SIZE]);
        block.push((crc >> 8) as u8);
        block.push((crc & 0xFF) as u8);
        block
    }

    /// Send `data` to the receiver, one attempt.
    ///
    /// `progress` is invoked after each acknowledged block with the
    /// cumulative byte count (padded to block granularity); it is
    /// informational only.
    pub fn send<F>(&mut self, data: &[u8], mut progress: F) -> Result<()>
    where
        F: FnMut(usize),
    {
        self.negotiate()?;

        debug!("Starting XMODEM transfer ({} bytes)", data.len());
        let mut number: u8 = 1;
        let mut sent = 0usize;

        for chunk in data.chunks(BLOCK_SIZE) {
            let block = Self::build_block(number, chunk);
            let mut rejections = 0;

            loop {
                self.port.write_all(&block)?;
                self.port.flush()?;

                match self.read_byte()? {
                    Some(control::ACK) => {
                        sent += BLOCK_SIZE;
                        progress(sent);
                        break;
                    },
                    Some(control::NAK) => {
                        rejections += 1;
                        trace!("block {number} NAKed ({rejections})");
                        if rejections > BLOCK_RETRY_LIMIT {
                            return Err(Error::Transfer(format!(
                                "block {number} rejected after retry"
                            )));
                        }
                    },
                    reply => {
                        // Receiver is gone or talking garbage; tell it we
                        // are done and fail the attempt.
                        self.port.write_all(&[control::EOT])?;
                        self.port.flush()?;
                        return Err(Error::Transfer(match reply {
                            Some(c) => format!("unexpected reply 0x{c:02X} to block {number}"),
                            None => format!("no reply to block {number}"),
                        }));
                    },
                }
            }

            number = number.wrapping_add(1);
        }

        self.port.write_all(&[control::EOT])?;
        self.port.flush()?;
        match self.read_byte()? {
            Some(control::NAK) => Err(Error::Transfer("receiver rejected EOT".into())),
            _ => {
                debug!("XMODEM transfer complete");
                Ok(())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Mock serial port with independent read/write buffers.
    struct MockSerial {
        read_buf: VecDeque<u8>,
        write_buf: Vec<u8>,
    }

    impl MockSerial {
        fn new(response: &[u8]) -> Self {
            Self {
                read_buf: response.iter().copied().collect(),
                write_buf: Vec::new(),
            }
        }
    }

    impl Read for MockSerial {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.read_buf.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.read_buf.len());
            for b in buf.iter_mut().take(n) {
                *b = self.read_buf.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockSerial {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write_buf.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Reply script: 'C', then one ACK per expected block, then EOT ACK.
    fn happy_replies(blocks: usize) -> Vec<u8> {
        let mut replies = vec![control::C];
        replies.extend(std::iter::repeat_n(control::ACK, blocks));
        replies.push(control::ACK);
        replies
    }

    /// Split the written byte stream into frames plus the trailing EOT.
    fn parse_frames(written: &[u8]) -> (Vec<&[u8]>, &[u8]) {
        const FRAME_LEN: usize = 3 + BLOCK_SIZE + 2;
        let n_frames = written.len() / FRAME_LEN;
        let frames = (0..n_frames)
            .map(|i| &written[i * FRAME_LEN..(i + 1) * FRAME_LEN])
            .collect();
        (frames, &written[n_frames * FRAME_LEN..])
    }

    #[test]
    fn test_build_block_layout() {
        let block = XmodemTransfer::<MockSerial>::build_block(1, &[0x01, 0x02, 0x03]);
        assert_eq!(block.len(), 3 + BLOCK_SIZE + 2);
        assert_eq!(block[0], control::SOH);
        assert_eq!(block[1], 1);
        assert_eq!(block[2], 0xFE);
        assert_eq!(&block[3..6], &[0x01, 0x02, 0x03]);
        // Short payloads are padded to exactly 128 bytes with 0xFF.
        assert!(block[6..3 + BLOCK_SIZE].iter().all(|&b| b == PAD_BYTE));

        let crc = crc16_xmodem(&block[3..3 + BLOCK_SIZE]);
        assert_eq!(block[3 + BLOCK_SIZE], (crc >> 8) as u8);
        assert_eq!(block[3 + BLOCK_SIZE + 1], (crc & 0xFF) as u8);
    }

    #[test]
    fn test_block_count_is_ceil_of_len() {
        for (len, expected_blocks) in [(1usize, 1usize), (128, 1), (129, 2), (385, 4)] {
            let mut port = MockSerial::new(&happy_replies(expected_blocks));
            let data = vec![0xAB; len];
            XmodemTransfer::new(&mut port)
                .send(&data, |_| {})
                .unwrap();

            let (frames, tail) = parse_frames(&port.write_buf);
            assert_eq!(frames.len(), expected_blocks, "len {len}");
            assert_eq!(tail, &[control::EOT]);
        }
    }

    #[test]
    fn test_block_numbers_wrap_skipping_zero_only_at_start() {
        // 300 blocks exercises the 255 -> 0 -> 1 wraparound.
        let blocks = 300;
        let mut port = MockSerial::new(&happy_replies(blocks));
        let data = vec![0x11; blocks * BLOCK_SIZE];
        XmodemTransfer::new(&mut port)
            .send(&data, |_| {})
            .unwrap();

        let (frames, _) = parse_frames(&port.write_buf);
        let mut expected: u8 = 1;
        for frame in frames {
            assert_eq!(frame[1], expected);
            assert_eq!(frame[2], 0xFF - expected);
            expected = expected.wrapping_add(1);
        }
        // Block 256 (index 255) carried the wrapped number 0.
        assert_eq!(port.write_buf[255 * (3 + BLOCK_SIZE + 2) + 1], 0);
    }

    #[test]
    fn test_progress_reports_cumulative_padded_bytes() {
        let mut port = MockSerial::new(&happy_replies(3));
        let data = vec![0x22; 2 * BLOCK_SIZE + 7];
        let mut reports = Vec::new();
        XmodemTransfer::new(&mut port)
            .send(&data, |sent| reports.push(sent))
            .unwrap();
        assert_eq!(reports, vec![128, 256, 384]);
    }

    #[test]
    fn test_single_nak_per_block_recovers() {
        let blocks = 3;
        let mut replies = vec![control::C];
        for _ in 0..blocks {
            replies.push(control::NAK);
            replies.push(control::ACK);
        }
        replies.push(control::ACK); // EOT

        let mut port = MockSerial::new(&replies);
        let data = vec![0x33; blocks * BLOCK_SIZE];
        XmodemTransfer::new(&mut port)
            .send(&data, |_| {})
            .unwrap();

        // Every block was sent twice.
        let (frames, tail) = parse_frames(&port.write_buf);
        assert_eq!(frames.len(), 2 * blocks);
        assert_eq!(frames[0][1], frames[1][1]);
        assert_eq!(tail, &[control::EOT]);
    }

    #[test]
    fn test_two_naks_for_one_block_fail() {
        let replies = vec![control::C, control::NAK, control::NAK];
        let mut port = MockSerial::new(&replies);
        let data = vec![0x44; 64];
        let err = XmodemTransfer::new(&mut port)
            .send(&data, |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)), "got {err:?}");
    }

    #[test]
    fn test_silence_after_block_sends_eot_and_fails() {
        // 'C' then nothing: the block gets no reply at all.
        let mut port = MockSerial::new(&[control::C]);
        let data = vec![0x55; 10];
        let err = XmodemTransfer::new(&mut port)
            .send(&data, |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
        assert_eq!(port.write_buf.last(), Some(&control::EOT));
    }

    #[test]
    fn test_negotiation_gives_up_after_ten_polls() {
        // Ten garbage bytes, never a 'C'.
        let mut port = MockSerial::new(&[0x00; 16]);
        let err = XmodemTransfer::new(&mut port)
            .send(&[0x66; 4], |_| {})
            .unwrap_err();
        match err {
            Error::Transfer(msg) => assert!(msg.contains("negotiation")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(port.write_buf.is_empty());
    }

    #[test]
    fn test_crc_ready_skips_negotiation() {
        // No 'C' queued; first reply is the block ACK.
        let mut port = MockSerial::new(&[control::ACK, control::ACK]);
        XmodemTransfer::new(&mut port)
            .crc_ready(true)
            .send(&[0x77; 4], |_| {})
            .unwrap();
    }

    #[test]
    fn test_eot_nak_is_a_failure() {
        let mut port = MockSerial::new(&[control::C, control::ACK, control::NAK]);
        let err = XmodemTransfer::new(&mut port)
            .send(&[0x88; 4], |_| {})
            .unwrap_err();
        match err {
            Error::Transfer(msg) => assert!(msg.contains("EOT")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload_sends_only_eot() {
        let mut port = MockSerial::new(&[control::C, control::ACK]);
        XmodemTransfer::new(&mut port).send(&[], |_| {}).unwrap();
        assert_eq!(port.write_buf, vec![control::EOT]);
    }
}
