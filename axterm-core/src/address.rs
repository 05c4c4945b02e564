//! AX.25 station addressing: callsign + SSID + has-been-repeated flag.
//!
//! Each address occupies 7 bytes on the wire: six callsign bytes (space padded,
//! shifted left by one bit) followed by an SSID byte laid out `CRRSSIDH`
//! (bit7..bit0): command/response-or-repeated, two reserved bits fixed at 1,
//! four SSID bits, then the end-of-address extension bit.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Maximum number of digipeaters permitted in a path.
pub const MAX_DIGIPEATERS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Address {
    callsign: [u8; 6],
    ssid: u8,
    has_been_repeated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    CallsignEmpty,
    CallsignTooLong(usize),
    InvalidCharacter(char),
    SsidOutOfRange(u8),
    DecodeError(AddressDecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressDecodeError {
    /// A callsign byte, once un-shifted, was not printable ASCII.
    BadCharacter,
}

impl Address {
    /// Build an address from a callsign (1-6 uppercase alphanumeric characters) and SSID (0-15).
    pub fn new(callsign: &str, ssid: u8) -> Result<Self, AddressError> {
        if callsign.is_empty() {
            return Err(AddressError::CallsignEmpty);
        }
        if callsign.len() > 6 {
            return Err(AddressError::CallsignTooLong(callsign.len()));
        }
        if ssid > 15 {
            return Err(AddressError::SsidOutOfRange(ssid));
        }
        let mut bytes = [b' '; 6];
        for (i, c) in callsign.chars().enumerate() {
            let upper = c.to_ascii_uppercase();
            if !upper.is_ascii_alphanumeric() {
                return Err(AddressError::InvalidCharacter(c));
            }
            bytes[i] = upper as u8;
        }
        Ok(Self {
            callsign: bytes,
            ssid,
            has_been_repeated: false,
        })
    }

    pub fn callsign(&self) -> &str {
        core::str::from_utf8(&self.callsign)
            .unwrap_or("??????")
            .trim_end()
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    pub fn has_been_repeated(&self) -> bool {
        self.has_been_repeated
    }

    /// Set the digipeater "has-been-repeated" flag. Meaningless for a source or
    /// destination address; only consulted when this address appears in a digipeater path.
    pub fn set_has_been_repeated(&mut self, repeated: bool) {
        self.has_been_repeated = repeated;
    }

    /// Encode this address to its 7-byte wire form.
    ///
    /// `command_or_repeated` supplies bit7 of the SSID byte: for source/destination
    /// addresses this is the command/response bit chosen by the frame encoder; for
    /// digipeater addresses it should be `self.has_been_repeated()`.
    /// `end_of_address` should be true only for the final address in the path.
    pub fn encode(&self, command_or_repeated: bool, end_of_address: bool) -> [u8; 7] {
        let mut out = [0u8; 7];
        for i in 0..6 {
            out[i] = self.callsign[i] << 1;
        }
        let mut ssid_byte: u8 = 0;
        if command_or_repeated {
            ssid_byte |= 0x80;
        }
        ssid_byte |= 0x60; // reserved bits fixed to 1
        ssid_byte |= (self.ssid & 0x0f) << 1;
        if end_of_address {
            ssid_byte |= 0x01;
        }
        out[6] = ssid_byte;
        out
    }

    /// Decode a 7-byte wire address.
    ///
    /// Returns the address, the bit7 flag (command/response or has-been-repeated,
    /// interpretation is up to the caller), and whether the end-of-address bit was set.
    pub fn decode(raw: &[u8; 7]) -> Result<(Self, bool, bool), AddressError> {
        let mut callsign = [0u8; 6];
        for i in 0..6 {
            let shifted = raw[i] >> 1;
            if !(0x20..=0x7e).contains(&shifted) {
                return Err(AddressError::DecodeError(AddressDecodeError::BadCharacter));
            }
            callsign[i] = shifted;
        }
        let ssid_byte = raw[6];
        let bit7 = ssid_byte & 0x80 != 0;
        let end_of_address = ssid_byte & 0x01 != 0;
        let ssid = (ssid_byte >> 1) & 0x0f;
        Ok((
            Self {
                callsign,
                ssid,
                has_been_repeated: bit7,
            },
            bit7,
            end_of_address,
        ))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.callsign())
        } else {
            write!(f, "{}-{}", self.callsign(), self.ssid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let addr = Address::new("VK7XT", 5).unwrap();
        let encoded = addr.encode(false, true);
        let (decoded, bit7, end) = Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert!(!bit7);
        assert!(end);
    }

    #[test]
    fn pads_short_callsign() {
        let addr = Address::new("K1", 0).unwrap();
        assert_eq!(addr.callsign(), "K1");
        let encoded = addr.encode(false, false);
        // space-padded bytes, shifted left by one
        assert_eq!(encoded[2], b' ' << 1);
    }

    #[test]
    fn rejects_bad_callsign() {
        assert_eq!(
            Address::new("TOOLONGCALL", 0),
            Err(AddressError::CallsignTooLong(11))
        );
        assert_eq!(Address::new("", 0), Err(AddressError::CallsignEmpty));
        assert!(matches!(
            Address::new("AB!", 0),
            Err(AddressError::InvalidCharacter('!'))
        ));
    }

    #[test]
    fn rejects_bad_ssid() {
        assert_eq!(
            Address::new("VK7XT", 16),
            Err(AddressError::SsidOutOfRange(16))
        );
    }

    #[test]
    fn display_omits_zero_ssid() {
        assert_eq!(Address::new("VK7XT", 0).unwrap().to_string(), "VK7XT");
        assert_eq!(Address::new("VK7XT", 5).unwrap().to_string(), "VK7XT-5");
    }
}
