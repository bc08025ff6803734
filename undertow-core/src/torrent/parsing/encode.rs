//! Minimal bencode writer used to re-serialize content descriptions.

/// Append-only bencode encoder.
///
/// Callers are responsible for emitting dictionary keys in sorted order.
#[derive(Debug, Default)]
pub struct BencodeWriter {
    buffer: Vec<u8>,
    open_containers: usize,
}

impl BencodeWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a length-prefixed byte string.
    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buffer
            .extend_from_slice(value.len().to_string().as_bytes());
        self.buffer.push(b':');
        self.buffer.extend_from_slice(value);
        self
    }

    /// Writes a UTF-8 string as a byte string.
    pub fn string(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    /// Writes an integer.
    pub fn integer(&mut self, value: i64) -> &mut Self {
        self.buffer.push(b'i');
        self.buffer.extend_from_slice(value.to_string().as_bytes());
        self.buffer.push(b'e');
        self
    }

    /// Opens a list; close with [`BencodeWriter::end`].
    pub fn begin_list(&mut self) -> &mut Self {
        self.open_containers += 1;
        self.buffer.push(b'l');
        self
    }

    /// Opens a dictionary; close with [`BencodeWriter::end`].
    pub fn begin_dict(&mut self) -> &mut Self {
        self.open_containers += 1;
        self.buffer.push(b'd');
        self
    }

    /// Closes the innermost open list or dictionary.
    pub fn end(&mut self) -> &mut Self {
        debug_assert!(self.open_containers > 0, "end() without open container");
        self.open_containers = self.open_containers.saturating_sub(1);
        self.buffer.push(b'e');
        self
    }

    /// Splices pre-encoded bencode verbatim.
    pub fn raw(&mut self, encoded: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(encoded);
        self
    }

    /// Returns the encoded bytes.
    pub fn finish(self) -> Vec<u8> {
        debug_assert_eq!(self.open_containers, 0, "unclosed bencode container");
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_nested_structures() {
        let mut writer = BencodeWriter::new();
        writer
            .begin_dict()
            .string("list")
            .begin_list()
            .integer(-3)
            .string("spam")
            .end()
            .string("raw")
            .raw(b"i7e")
            .end();

        assert_eq!(writer.finish(), b"d4:listli-3e4:spame3:rawi7ee".to_vec());
    }

    #[test]
    fn test_binary_bytes_are_length_prefixed() {
        let mut writer = BencodeWriter::new();
        writer.bytes(&[0xFF, 0x00, b':']);
        assert_eq!(writer.finish(), vec![b'3', b':', 0xFF, 0x00, b':']);
    }
}
