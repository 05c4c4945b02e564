//! Abstract AX.25 frame model and its byte-level codec.
//!
//! Three classes are distinguished by the low bits of the control byte: **I**
//! (information, bit0=0), **S** (supervisory, bits1:0=01), **U** (unnumbered,
//! bits1:0=11). PID and info are only present for UI and I frames.

use crate::address::{Address, AddressError, MAX_DIGIPEATERS};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// PID value meaning "no layer 3 protocol" - used by AXDP, which rides directly on AX.25.
pub const PID_NO_LAYER_3: u8 = 0xF0;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FrameHeader {
    pub destination: Address,
    pub source: Address,
    pub digipeaters: Vec<Address>,
}

impl FrameHeader {
    pub fn new(destination: Address, source: Address, digipeaters: Vec<Address>) -> Result<Self, FrameError> {
        if digipeaters.len() > MAX_DIGIPEATERS {
            return Err(FrameError::TooManyDigipeaters(digipeaters.len()));
        }
        Ok(Self {
            destination,
            source,
            digipeaters,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UKind {
    Sabm,
    Ua,
    Disc,
    Dm,
    Frmr,
    Ui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SKind {
    Rr,
    Rnr,
    Rej,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Frame {
    U {
        header: FrameHeader,
        kind: UKind,
        poll_final: bool,
        /// Only present for `Ui`.
        pid: Option<u8>,
        /// Only present for `Ui`.
        info: Option<Vec<u8>>,
    },
    S {
        header: FrameHeader,
        kind: SKind,
        nr: u8,
        poll_final: bool,
    },
    I {
        header: FrameHeader,
        ns: u8,
        nr: u8,
        poll_final: bool,
        pid: u8,
        info: Vec<u8>,
    },
}

impl Frame {
    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::U { header, .. } => header,
            Frame::S { header, .. } => header,
            Frame::I { header, .. } => header,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    TooManyDigipeaters(usize),
    DecodeError(FrameDecodeKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecodeKind {
    TooShort,
    BadAddress,
    MissingEndOfAddress,
    UnknownControl,
    MissingPid,
    MissingInfo,
}

/// Encode an abstract frame to its on-air byte representation (without any KISS
/// framing or FCS - those are handled by the KISS and link layers respectively).
pub fn encode(frame: &Frame, extended: bool) -> Vec<u8> {
    let mut out = Vec::new();
    let header = frame.header();
    let no_digis = header.digipeaters.is_empty();
    out.extend_from_slice(&header.destination.encode(command_bit(frame, true), false));
    out.extend_from_slice(&header.source.encode(command_bit(frame, false), no_digis));
    let last_digi = header.digipeaters.len().saturating_sub(1);
    for (i, digi) in header.digipeaters.iter().enumerate() {
        out.extend_from_slice(&digi.encode(digi.has_been_repeated(), i == last_digi));
    }
    match frame {
        Frame::U {
            kind,
            poll_final,
            pid,
            info,
            ..
        } => {
            out.push(encode_u_control(*kind, *poll_final));
            if let Some(pid) = pid {
                out.push(*pid);
            }
            if let Some(info) = info {
                out.extend_from_slice(info);
            }
        }
        Frame::S {
            kind,
            nr,
            poll_final,
            ..
        } => {
            out.extend_from_slice(&encode_s_control(*kind, *nr, *poll_final, extended));
        }
        Frame::I {
            ns,
            nr,
            poll_final,
            pid,
            info,
            ..
        } => {
            out.extend_from_slice(&encode_i_control(*ns, *nr, *poll_final, extended));
            out.push(*pid);
            out.extend_from_slice(info);
        }
    }
    out
}

/// The AX.25 command/response convention: for a command frame the destination's
/// bit is set and the source's is clear (and vice-versa for a response). AXTerm
/// always operates as commands going out and responses coming back is handled
/// transparently by the peer, so the encoder always produces command frames.
fn command_bit(_frame: &Frame, is_destination: bool) -> bool {
    is_destination
}

fn encode_u_control(kind: UKind, poll_final: bool) -> u8 {
    let base = match kind {
        UKind::Sabm => 0b0010_1111,
        UKind::Ua => 0b0110_0011,
        UKind::Disc => 0b0100_0011,
        UKind::Dm => 0b0000_1111,
        UKind::Frmr => 0b1000_0111,
        UKind::Ui => 0b0000_0011,
    };
    if poll_final {
        base | 0b0001_0000
    } else {
        base
    }
}

fn encode_s_control(kind: SKind, nr: u8, poll_final: bool, extended: bool) -> Vec<u8> {
    let type_bits: u8 = match kind {
        SKind::Rr => 0b00,
        SKind::Rnr => 0b01,
        SKind::Rej => 0b10,
    };
    if extended {
        let b0 = (type_bits << 2) | 0b01;
        let b1 = ((nr & 0x7f) << 1) | if poll_final { 1 } else { 0 };
        vec![b0, b1]
    } else {
        let b = ((nr & 0x07) << 5) | (if poll_final { 1 } else { 0 } << 4) | (type_bits << 2) | 0b01;
        vec![b]
    }
}

fn encode_i_control(ns: u8, nr: u8, poll_final: bool, extended: bool) -> Vec<u8> {
    if extended {
        let b0 = (ns & 0x7f) << 1;
        let b1 = ((nr & 0x7f) << 1) | if poll_final { 1 } else { 0 };
        vec![b0, b1]
    } else {
        let b = ((nr & 0x07) << 5) | (if poll_final { 1 } else { 0 } << 4) | ((ns & 0x07) << 1);
        vec![b]
    }
}

/// Decode a byte buffer (as delivered from the KISS layer, no FCS) into an abstract frame.
pub fn decode(data: &[u8], extended: bool) -> Result<Frame, FrameError> {
    if data.len() < 14 {
        return Err(FrameError::DecodeError(FrameDecodeKind::TooShort));
    }
    let mut pos = 0;
    let dest_raw: [u8; 7] = data[pos..pos + 7]
        .try_into()
        .map_err(|_| FrameError::DecodeError(FrameDecodeKind::TooShort))?;
    let (destination, _dest_c, dest_end) = Address::decode(&dest_raw)
        .map_err(|_| FrameError::DecodeError(FrameDecodeKind::BadAddress))?;
    if dest_end {
        return Err(FrameError::DecodeError(FrameDecodeKind::MissingEndOfAddress));
    }
    pos += 7;

    let src_raw: [u8; 7] = data
        .get(pos..pos + 7)
        .and_then(|s| s.try_into().ok())
        .ok_or(FrameError::DecodeError(FrameDecodeKind::TooShort))?;
    let (source, _src_c, src_end) = Address::decode(&src_raw)
        .map_err(|_| FrameError::DecodeError(FrameDecodeKind::BadAddress))?;
    pos += 7;

    let mut digipeaters = Vec::new();
    let mut last_end = src_end;
    while !last_end {
        let raw: [u8; 7] = data
            .get(pos..pos + 7)
            .and_then(|s| s.try_into().ok())
            .ok_or(FrameError::DecodeError(FrameDecodeKind::MissingEndOfAddress))?;
        let (mut digi, repeated, end) = Address::decode(&raw)
            .map_err(|_| FrameError::DecodeError(FrameDecodeKind::BadAddress))?;
        digi.set_has_been_repeated(repeated);
        digipeaters.push(digi);
        pos += 7;
        last_end = end;
        if digipeaters.len() > MAX_DIGIPEATERS {
            return Err(FrameError::TooManyDigipeaters(digipeaters.len()));
        }
    }

    let header = FrameHeader {
        destination,
        source,
        digipeaters,
    };

    let control = *data
        .get(pos)
        .ok_or(FrameError::DecodeError(FrameDecodeKind::TooShort))?;

    if control & 0x01 == 0 {
        // I frame
        let (ns, nr, poll_final, control_len) = if extended {
            let b1 = *data
                .get(pos + 1)
                .ok_or(FrameError::DecodeError(FrameDecodeKind::TooShort))?;
            ((control >> 1) & 0x7f, (b1 >> 1) & 0x7f, b1 & 1 != 0, 2)
        } else {
            ((control >> 1) & 0x07, (control >> 5) & 0x07, (control >> 4) & 1 != 0, 1)
        };
        pos += control_len;
        let pid = *data
            .get(pos)
            .ok_or(FrameError::DecodeError(FrameDecodeKind::MissingPid))?;
        pos += 1;
        let info = data
            .get(pos..)
            .ok_or(FrameError::DecodeError(FrameDecodeKind::MissingInfo))?
            .to_vec();
        Ok(Frame::I {
            header,
            ns,
            nr,
            poll_final,
            pid,
            info,
        })
    } else if control & 0x03 == 0x01 {
        // S frame
        let type_bits = (control >> 2) & 0x03;
        let kind = match type_bits {
            0b00 => SKind::Rr,
            0b01 => SKind::Rnr,
            0b10 => SKind::Rej,
            _ => return Err(FrameError::DecodeError(FrameDecodeKind::UnknownControl)),
        };
        let (nr, poll_final) = if extended {
            let b1 = *data
                .get(pos + 1)
                .ok_or(FrameError::DecodeError(FrameDecodeKind::TooShort))?;
            ((b1 >> 1) & 0x7f, b1 & 1 != 0)
        } else {
            ((control >> 5) & 0x07, (control >> 4) & 1 != 0)
        };
        Ok(Frame::S {
            header,
            kind,
            nr,
            poll_final,
        })
    } else {
        // U frame - always a single control byte regardless of `extended`
        let poll_final = control & 0b0001_0000 != 0;
        let masked = control & !0b0001_0000;
        let kind = match masked {
            0b0010_1111 => UKind::Sabm,
            0b0110_0011 => UKind::Ua,
            0b0100_0011 => UKind::Disc,
            0b0000_1111 => UKind::Dm,
            0b1000_0111 => UKind::Frmr,
            0b0000_0011 => UKind::Ui,
            _ => return Err(FrameError::DecodeError(FrameDecodeKind::UnknownControl)),
        };
        pos += 1;
        let (pid, info) = if matches!(kind, UKind::Ui) {
            let pid = *data
                .get(pos)
                .ok_or(FrameError::DecodeError(FrameDecodeKind::MissingPid))?;
            let info = data.get(pos + 1..).unwrap_or(&[]).to_vec();
            (Some(pid), Some(info))
        } else {
            (None, None)
        };
        Ok(Frame::U {
            header,
            kind,
            poll_final,
            pid,
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(call: &str, ssid: u8) -> Address {
        Address::new(call, ssid).unwrap()
    }

    #[test]
    fn round_trip_ui() {
        let header = FrameHeader::new(addr("APRS", 0), addr("VK7XT", 1), vec![]).unwrap();
        let frame = Frame::U {
            header,
            kind: UKind::Ui,
            poll_final: false,
            pid: Some(PID_NO_LAYER_3),
            info: Some(b"hello".to_vec()),
        };
        let bytes = encode(&frame, false);
        let decoded = decode(&bytes, false).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_i_with_digis() {
        let header = FrameHeader::new(
            addr("APRS", 0),
            addr("VK7XT", 1),
            vec![addr("DIGI1", 0), addr("DIGI2", 0)],
        )
        .unwrap();
        let frame = Frame::I {
            header,
            ns: 3,
            nr: 5,
            poll_final: true,
            pid: PID_NO_LAYER_3,
            info: b"payload".to_vec(),
        };
        let bytes = encode(&frame, false);
        let decoded = decode(&bytes, false).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_extended_i() {
        let header = FrameHeader::new(addr("APRS", 0), addr("VK7XT", 1), vec![]).unwrap();
        let frame = Frame::I {
            header,
            ns: 100,
            nr: 99,
            poll_final: false,
            pid: PID_NO_LAYER_3,
            info: b"x".to_vec(),
        };
        let bytes = encode(&frame, true);
        let decoded = decode(&bytes, true).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn classifies_s_frame() {
        let header = FrameHeader::new(addr("APRS", 0), addr("VK7XT", 1), vec![]).unwrap();
        let frame = Frame::S {
            header,
            kind: SKind::Rej,
            nr: 4,
            poll_final: false,
        };
        let bytes = encode(&frame, false);
        let decoded = decode(&bytes, false).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn too_many_digipeaters_rejected() {
        let digis = (0..9).map(|i| addr(&format!("D{i}"), 0)).collect();
        assert_eq!(
            FrameHeader::new(addr("APRS", 0), addr("VK7XT", 1), digis),
            Err(FrameError::TooManyDigipeaters(9))
        );
    }

    #[test]
    fn malformed_frame_does_not_panic() {
        assert!(decode(&[0u8; 5], false).is_err());
        assert!(decode(&[], false).is_err());
    }
}
