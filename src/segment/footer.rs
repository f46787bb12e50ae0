use crate::error::Error;
use crate::file::DbFile;
use crate::filter::BloomFilter;
use crate::slice::{varint_len, SliceReader};
use crate::Result;
use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};

pub(crate) const SEGMENT_MAGIC: u32 = 0x6667_6573; // "segf"
pub(crate) const FORMAT_VERSION: u64 = 1;

/// The footer body is varint-sized, so the file ends with a fixed-width
/// trailer locating it: `footer_len(u32 LE) | crc32(u32 LE)`.
pub(crate) const FOOTER_TRAILER_SIZE: u64 = 8;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Trailer of a segment file: entry count, range bit, optional bloom
/// filter and the index block bounds.
pub struct Footer {
    pub key_value_count: u64,
    pub has_range: bool,
    pub bloom: Option<BloomFilter>,
    /// Absolute offset of the index block.
    pub index_offset: u64,
    pub index_length: u64,
}

impl Footer {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let bloom_block = self.bloom.as_ref().map(|filter| filter.encode());
        let bloom_len = bloom_block.as_ref().map(|block| block.len()).unwrap_or(0);

        let mut body = Vec::with_capacity(
            4 + varint_len(FORMAT_VERSION)
                + varint_len(self.key_value_count)
                + 1
                + varint_len(bloom_len as u64)
                + bloom_len
                + varint_len(self.index_offset)
                + varint_len(self.index_length),
        );
        let mut magic = [0u8; 4];
        LittleEndian::write_u32(&mut magic, SEGMENT_MAGIC);
        body.extend_from_slice(&magic);
        push_varint(&mut body, FORMAT_VERSION);
        push_varint(&mut body, self.key_value_count);
        body.push(self.has_range as u8);
        push_varint(&mut body, bloom_len as u64);
        if let Some(block) = bloom_block {
            body.extend_from_slice(&block);
        }
        push_varint(&mut body, self.index_offset);
        push_varint(&mut body, self.index_length);

        let mut trailer = [0u8; FOOTER_TRAILER_SIZE as usize];
        LittleEndian::write_u32(&mut trailer[0..4], body.len() as u32);
        LittleEndian::write_u32(&mut trailer[4..8], CRC32.checksum(&body));
        body.extend_from_slice(&trailer);
        body
    }

    /// Locate and parse the footer at the file tail. Magic, version and
    /// checksum mismatches are hard errors.
    pub(crate) fn read(file: &DbFile) -> Result<Footer> {
        let file_size = file.file_size()?;
        if file_size < FOOTER_TRAILER_SIZE {
            return Err(Error::Format(format!(
                "file of {} bytes is too short for a footer",
                file_size
            )));
        }
        let trailer = file.read(file_size - FOOTER_TRAILER_SIZE, FOOTER_TRAILER_SIZE as usize)?;
        let footer_len = LittleEndian::read_u32(&trailer[0..4]) as u64;
        let expected_crc = LittleEndian::read_u32(&trailer[4..8]);
        if footer_len + FOOTER_TRAILER_SIZE > file_size {
            return Err(Error::Format(format!(
                "footer length {} exceeds file size {}",
                footer_len, file_size
            )));
        }

        let body = file.read(file_size - FOOTER_TRAILER_SIZE - footer_len, footer_len as usize)?;
        if CRC32.checksum(&body) != expected_crc {
            return Err(Error::Format("footer checksum mismatch".into()));
        }

        let mut reader = SliceReader::new(&body);
        let magic = LittleEndian::read_u32(reader.read_bytes(4)?);
        if magic != SEGMENT_MAGIC {
            return Err(Error::Format(format!("bad segment magic {:#x}", magic)));
        }
        let version = reader.read_unsigned()?;
        if version != FORMAT_VERSION {
            return Err(Error::Format(format!(
                "unsupported segment format version {}",
                version
            )));
        }
        let key_value_count = reader.read_unsigned()?;
        let has_range = reader.read_u8()? != 0;
        let bloom_len = reader.read_unsigned()? as usize;
        let bloom = if bloom_len == 0 {
            None
        } else {
            Some(BloomFilter::decode(reader.read_bytes(bloom_len)?)?)
        };
        let index_offset = reader.read_unsigned()?;
        let index_length = reader.read_unsigned()?;

        Ok(Footer {
            key_value_count,
            has_range,
            bloom,
            index_offset,
            index_length,
        })
    }
}

pub(crate) fn push_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::file::DbFile;
    use crate::filter::BloomFilter;
    use crate::segment::footer::Footer;
    use crate::slice::Slice;

    fn memory_file(bytes: Vec<u8>) -> DbFile {
        DbFile::memory("footer.seg", Slice::from_vec(bytes))
    }

    #[test]
    fn test_footer_round_trip() {
        let mut bloom = BloomFilter::with_rate(10, 0.01).unwrap();
        bloom.add(b"key");
        let footer = Footer {
            key_value_count: 42,
            has_range: true,
            bloom: Some(bloom),
            index_offset: 1000,
            index_length: 345,
        };
        let encoded = footer.encode();
        let decoded = Footer::read(&memory_file(encoded)).unwrap();
        assert_eq!(decoded.key_value_count, 42);
        assert!(decoded.has_range);
        assert!(decoded.bloom.as_ref().unwrap().may_contain(b"key"));
        assert_eq!(decoded.index_offset, 1000);
        assert_eq!(decoded.index_length, 345);
    }

    #[test]
    fn test_footer_without_bloom() {
        let footer = Footer {
            key_value_count: 1,
            has_range: false,
            bloom: None,
            index_offset: 8,
            index_length: 16,
        };
        let decoded = Footer::read(&memory_file(footer.encode())).unwrap();
        assert!(decoded.bloom.is_none());
        assert!(!decoded.has_range);
    }

    #[test]
    fn test_corrupt_footer_fails() {
        let footer = Footer {
            key_value_count: 7,
            has_range: false,
            bloom: None,
            index_offset: 0,
            index_length: 0,
        };
        let mut encoded = footer.encode();

        // flip a body byte: checksum mismatch
        let mut corrupt = encoded.clone();
        corrupt[5] ^= 0xff;
        match Footer::read(&memory_file(corrupt)) {
            Err(Error::Format(detail)) => assert!(detail.contains("checksum")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }

        // truncating the tail loses the trailer
        encoded.truncate(encoded.len() - 3);
        assert!(matches!(
            Footer::read(&memory_file(encoded)),
            Err(Error::Format(_))
        ));
    }
}
