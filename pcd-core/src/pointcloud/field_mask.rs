use bitflags::bitflags;

bitflags! {
    /// Point fields a stage needs decoded.
    ///
    /// Decoders may always materialize more than requested; x and y, the return
    /// numbers and the scanner channel are always decoded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FieldMask: u32 {
        const CHANNEL_RETURNS_XY = 0;
        const Z = 0x0000_0001;
        const CLASSIFICATION = 0x0000_0002;
        const FLAGS = 0x0000_0004;
        const INTENSITY = 0x0000_0008;
        const SCAN_ANGLE = 0x0000_0010;
        const USER_DATA = 0x0000_0020;
        const POINT_SOURCE = 0x0000_0040;
        const GPS_TIME = 0x0000_0080;
        const RGB = 0x0000_0100;
        const NIR = 0x0000_0200;
        const WAVEPACKET = 0x0000_0400;
        const EXTRA_BYTES = 0xFFFF_0000;
    }
}

impl Default for FieldMask {
    fn default() -> Self {
        FieldMask::CHANNEL_RETURNS_XY
    }
}

impl FieldMask {
    /// Mask for a single extra attribute; indices beyond the sixteen tracked bits
    /// fall back to requesting all of them.
    pub fn extra_attribute(index: usize) -> Self {
        if index < 16 {
            FieldMask::from_bits_retain(0x0001_0000 << index)
        } else {
            FieldMask::EXTRA_BYTES
        }
    }

    pub fn needs_extra_bytes(&self) -> bool {
        self.intersects(FieldMask::EXTRA_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_attribute_bits_live_in_the_upper_half() {
        assert_eq!(FieldMask::extra_attribute(0).bits(), 0x0001_0000);
        assert_eq!(FieldMask::extra_attribute(15).bits(), 0x8000_0000);
        assert_eq!(FieldMask::extra_attribute(20), FieldMask::EXTRA_BYTES);
        assert!(FieldMask::extra_attribute(3).needs_extra_bytes());
        assert!(!FieldMask::GPS_TIME.needs_extra_bytes());
    }

    #[test]
    fn default_only_requests_xy() {
        assert!(FieldMask::default().is_empty());
    }
}
