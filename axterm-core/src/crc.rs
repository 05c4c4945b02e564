//! CRC32 (IEEE 802.3 / ISO-HDLC, reflected polynomial 0xEDB88320), used to validate
//! AXDP message payloads.

pub const CRC32_ALG: crc::Algorithm<u32> = crc::CRC_32_ISO_HDLC;

pub fn crc32(input: &[u8]) -> u32 {
    let crc = crc::Crc::<u32>::new(&CRC32_ALG);
    let mut digest = crc.digest();
    digest.update(input);
    digest.finalize()
}
