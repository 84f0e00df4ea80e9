/// Reads little-endian bit fields, least significant bit first, the way
/// Victron packs instant readout records.
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    fn read_bit(&mut self) -> Option<u32> {
        let byte = self.data.get(self.index >> 3)?;
        let bit = (byte >> (self.index & 7)) & 1;
        self.index += 1;
        Some(bit as u32)
    }

    /// Read an unsigned field of at most 32 bits
    pub fn read_unsigned(&mut self, bits: u32) -> Option<u32> {
        let mut value = 0u32;
        for position in 0..bits {
            value |= self.read_bit()? << position;
        }
        Some(value)
    }

    /// Read a two's complement field of at most 32 bits
    pub fn read_signed(&mut self, bits: u32) -> Option<i32> {
        self.read_unsigned(bits).map(|v| to_signed(v, bits))
    }
}

pub(crate) fn to_signed(value: u32, bits: u32) -> i32 {
    if bits < 32 && value & (1 << (bits - 1)) != 0 {
        (value as i64 - (1i64 << bits)) as i32
    } else {
        value as i32
    }
}

#[test]
fn test_read_fields_lsb_first() {
    // 0b1010_0101, 0b0000_0011
    let data = [0xa5, 0x03];
    let mut reader = BitReader::new(&data);
    assert_eq!(reader.read_unsigned(4), Some(0x5));
    assert_eq!(reader.read_unsigned(8), Some(0x3a));
    assert_eq!(reader.read_unsigned(4), Some(0x0));
    assert_eq!(reader.read_unsigned(1), None);
}

#[test]
fn test_read_signed() {
    let data = 0xfff6u16.to_le_bytes();
    let mut reader = BitReader::new(&data);
    assert_eq!(reader.read_signed(16), Some(-10));

    assert_eq!(to_signed(0x3fffff, 22), -1);
    assert_eq!(to_signed(0x1fffff, 22), 0x1fffff);
}
