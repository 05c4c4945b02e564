//! KISS byte framing between the core and the TNC.
//!
//! `FEND | TYPE_AND_PORT | DATA... | FEND`, with `FEND`/`FESC` escaped inside
//! `DATA` as `FESC TFEND` / `FESC TFESC`. Unlike `m17core`'s fixed-capacity
//! `KissFrame`, AXDP/AX.25 payloads are not bounded to a small LSF/packet size,
//! so this deframer grows a `Vec<u8>` scratch buffer instead.

const FEND: u8 = 0xC0;
const FESC: u8 = 0xDB;
const TFEND: u8 = 0xDC;
const TFESC: u8 = 0xDD;

/// Encode a single KISS data frame for the given channel (KISS port number).
pub fn encode(channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(FEND);
    out.push(kiss_header(channel));
    escape_into(payload, &mut out);
    out.push(FEND);
    out
}

/// Build one of the small KISS parameter frames sent at link-up (TXDELAY, P,
/// SlotTime, FullDuplex, SetHardware).
pub fn encode_param(channel: u8, command: KissCommand, value: u8) -> Vec<u8> {
    vec![FEND, (channel << 4) | command.proto_value(), value, FEND]
}

fn kiss_header(channel: u8) -> u8 {
    (channel << 4) | KissCommand::DataFrame.proto_value()
}

fn escape_into(src: &[u8], out: &mut Vec<u8>) {
    for &b in src {
        match b {
            FEND => {
                out.push(FESC);
                out.push(TFEND);
            }
            FESC => {
                out.push(FESC);
                out.push(TFESC);
            }
            other => out.push(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KissCommand {
    DataFrame,
    TxDelay,
    P,
    SlotTime,
    FullDuplex,
    SetHardware,
}

impl KissCommand {
    pub fn from_proto(value: u8) -> Option<Self> {
        Some(match value {
            0 => KissCommand::DataFrame,
            1 => KissCommand::TxDelay,
            2 => KissCommand::P,
            3 => KissCommand::SlotTime,
            5 => KissCommand::FullDuplex,
            6 => KissCommand::SetHardware,
            _ => return None,
        })
    }

    pub fn proto_value(&self) -> u8 {
        match self {
            KissCommand::DataFrame => 0,
            KissCommand::TxDelay => 1,
            KissCommand::P => 2,
            KissCommand::SlotTime => 3,
            KissCommand::FullDuplex => 5,
            KissCommand::SetHardware => 6,
        }
    }
}

/// A fully decoded KISS frame handed up from the deframer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissFrame {
    pub channel: u8,
    pub command: KissCommand,
    pub payload: Vec<u8>,
}

/// One output of [`KissDeframer::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KissEvent {
    Frame(KissFrame),
    /// An unrecoverable escape sequence was seen; the in-progress frame was
    /// discarded and the deframer has returned to between-frames state.
    DecodeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeframerState {
    BetweenFrames,
    InFrame,
    /// We've seen a FESC inside a frame and are waiting for TFEND/TFESC (or
    /// anything else, which is a malformed-but-recoverable sequence).
    InFrameEscaped,
}

/// Incremental KISS deframer. Feed it arbitrary byte chunks as they arrive
/// from the transport; it produces a sequence of decoded frames (and error
/// markers) as soon as each frame's trailing `FEND` is seen.
pub struct KissDeframer {
    state: DeframerState,
    buf: Vec<u8>,
}

impl KissDeframer {
    pub fn new() -> Self {
        Self {
            state: DeframerState::BetweenFrames,
            buf: Vec::new(),
        }
    }

    /// Feed a chunk of raw transport bytes, returning every frame (and any
    /// decode errors) completed by this chunk, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<KissEvent> {
        let mut out = Vec::new();
        for &b in bytes {
            match self.state {
                DeframerState::BetweenFrames => {
                    if b == FEND {
                        // Leading consecutive FENDs (empty frames) are ignored: a FEND
                        // here just opens a frame, it never closes one since buf is empty.
                        self.state = DeframerState::InFrame;
                    }
                    // Any other byte seen between frames is noise (e.g. line garbage) - drop it.
                }
                DeframerState::InFrame => {
                    if b == FEND {
                        if self.buf.is_empty() {
                            // consecutive FEND - still between frames, not an error
                            continue;
                        }
                        if let Some(event) = self.finish_frame() {
                            out.push(event);
                        }
                        self.state = DeframerState::BetweenFrames;
                    } else if b == FESC {
                        self.state = DeframerState::InFrameEscaped;
                    } else {
                        self.buf.push(b);
                    }
                }
                DeframerState::InFrameEscaped => {
                    match b {
                        TFEND => {
                            self.buf.push(FEND);
                            self.state = DeframerState::InFrame;
                        }
                        TFESC => {
                            self.buf.push(FESC);
                            self.state = DeframerState::InFrame;
                        }
                        FEND => {
                            // Escape with nothing to resolve it: unrecoverable for this frame.
                            self.buf.clear();
                            self.state = DeframerState::BetweenFrames;
                            out.push(KissEvent::DecodeError);
                        }
                        other => {
                            // Malformed escape mid-frame: drop the escape character and
                            // keep the following byte literally, per spec.
                            self.buf.push(other);
                            self.state = DeframerState::InFrame;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish_frame(&mut self) -> Option<KissEvent> {
        let data = core::mem::take(&mut self.buf);
        if data.is_empty() {
            return None;
        }
        let header = data[0];
        let channel = header >> 4;
        let Some(command) = KissCommand::from_proto(header & 0x0f) else {
            return Some(KissEvent::DecodeError);
        };
        Some(KissEvent::Frame(KissFrame {
            channel,
            command,
            payload: data[1..].to_vec(),
        }))
    }
}

impl Default for KissDeframer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_basic() {
        let framed = encode(3, b"hello");
        let mut deframer = KissDeframer::new();
        let events = deframer.feed(&framed);
        assert_eq!(
            events,
            vec![KissEvent::Frame(KissFrame {
                channel: 3,
                command: KissCommand::DataFrame,
                payload: b"hello".to_vec(),
            })]
        );
    }

    #[test]
    fn round_trip_with_fend_and_fesc_in_payload() {
        let payload = vec![0x00, FEND, 0x01, FESC, 0x02];
        let framed = encode(0, &payload);
        let mut deframer = KissDeframer::new();
        let events = deframer.feed(&framed);
        match &events[0] {
            KissEvent::Frame(f) => assert_eq!(f.payload, payload),
            _ => panic!("expected frame"),
        }
    }

    #[test]
    fn leading_fends_are_ignored() {
        let framed = encode(0, b"x");
        let mut with_leading = vec![FEND, FEND, FEND];
        with_leading.extend_from_slice(&framed);
        let mut deframer = KissDeframer::new();
        let events = deframer.feed(&with_leading);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn arbitrary_byte_chunking_still_decodes() {
        let framed = encode(1, b"split across chunks");
        let mut deframer = KissDeframer::new();
        let mut events = Vec::new();
        for chunk in framed.chunks(3) {
            events.extend(deframer.feed(chunk));
        }
        assert_eq!(events.len(), 1);
        match &events[0] {
            KissEvent::Frame(f) => assert_eq!(f.payload, b"split across chunks"),
            _ => panic!("expected frame"),
        }
    }

    #[test]
    fn malformed_escape_mid_frame_recovers() {
        // FESC followed by a byte that's neither TFEND nor TFESC: drop the
        // escape, keep the byte, and keep decoding the same frame.
        let mut raw = vec![FEND, 0x00, FESC, 0x41];
        raw.push(FEND);
        let mut deframer = KissDeframer::new();
        let events = deframer.feed(&raw);
        match &events[0] {
            KissEvent::Frame(f) => assert_eq!(f.payload, vec![0x41]),
            _ => panic!("expected recovered frame"),
        }
    }

    #[test]
    fn dangling_escape_at_frame_end_is_decode_error() {
        let raw = vec![FEND, 0x00, FESC, FEND];
        let mut deframer = KissDeframer::new();
        let events = deframer.feed(&raw);
        assert_eq!(events, vec![KissEvent::DecodeError]);
        // deframer should be back between frames and able to decode the next one
        let next = deframer.feed(&encode(0, b"ok"));
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn unsupported_command_reported_as_decode_error_without_losing_sync() {
        let raw = vec![FEND, 0x0f, 0x01, FEND]; // command nibble 0xf is unassigned
        let mut deframer = KissDeframer::new();
        let events = deframer.feed(&raw);
        assert_eq!(events, vec![KissEvent::DecodeError]);
        let next = deframer.feed(&encode(2, b"resynced"));
        match &next[0] {
            KissEvent::Frame(f) => assert_eq!(f.channel, 2),
            _ => panic!("expected frame"),
        }
    }
}
