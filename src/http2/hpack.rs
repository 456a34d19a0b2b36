use crate::error::Error;
use std::collections::VecDeque;
use std::sync::OnceLock;

// RFC 7541 Appendix A, the 61 static entries shared by every endpoint.
#[rustfmt::skip]
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

// RFC 7541 Appendix B: (code, bit length) per symbol, EOS last.
#[rustfmt::skip]
const HUFFMAN_CODES: [(u32, u8); 257] = [
    (0x1ff8, 13), (0x7fffd8, 23), (0xfffffe2, 28), (0xfffffe3, 28), (0xfffffe4, 28),
    (0xfffffe5, 28), (0xfffffe6, 28), (0xfffffe7, 28), (0xfffffe8, 28), (0xffffea, 24),
    (0x3ffffffc, 30), (0xfffffe9, 28), (0xfffffea, 28), (0x3ffffffd, 30), (0xfffffeb, 28),
    (0xfffffec, 28), (0xfffffed, 28), (0xfffffee, 28), (0xfffffef, 28), (0xffffff0, 28),
    (0xffffff1, 28), (0xffffff2, 28), (0x3ffffffe, 30), (0xffffff3, 28), (0xffffff4, 28),
    (0xffffff5, 28), (0xffffff6, 28), (0xffffff7, 28), (0xffffff8, 28), (0xffffff9, 28),
    (0xffffffa, 28), (0xffffffb, 28), (0x14, 6), (0x3f8, 10), (0x3f9, 10),
    (0xffa, 12), (0x1ff9, 13), (0x15, 6), (0xf8, 8), (0x7fa, 11),
    (0x3fa, 10), (0x3fb, 10), (0xf9, 8), (0x7fb, 11), (0xfa, 8),
    (0x16, 6), (0x17, 6), (0x18, 6), (0x0, 5), (0x1, 5),
    (0x2, 5), (0x19, 6), (0x1a, 6), (0x1b, 6), (0x1c, 6),
    (0x1d, 6), (0x1e, 6), (0x1f, 6), (0x5c, 7), (0xfb, 8),
    (0x7ffc, 15), (0x20, 6), (0xffb, 12), (0x3fc, 10), (0x1ffa, 13),
    (0x21, 6), (0x5d, 7), (0x5e, 7), (0x5f, 7), (0x60, 7),
    (0x61, 7), (0x62, 7), (0x63, 7), (0x64, 7), (0x65, 7),
    (0x66, 7), (0x67, 7), (0x68, 7), (0x69, 7), (0x6a, 7),
    (0x6b, 7), (0x6c, 7), (0x6d, 7), (0x6e, 7), (0x6f, 7),
    (0x70, 7), (0x71, 7), (0x72, 7), (0xfc, 8), (0x73, 7),
    (0xfd, 8), (0x1ffb, 13), (0x7fff0, 19), (0x1ffc, 13), (0x3ffc, 14),
    (0x22, 6), (0x7ffd, 15), (0x3, 5), (0x23, 6), (0x4, 5),
    (0x24, 6), (0x5, 5), (0x25, 6), (0x26, 6), (0x27, 6),
    (0x6, 5), (0x74, 7), (0x75, 7), (0x28, 6), (0x29, 6),
    (0x2a, 6), (0x7, 5), (0x2b, 6), (0x76, 7), (0x2c, 6),
    (0x8, 5), (0x9, 5), (0x2d, 6), (0x77, 7), (0x78, 7),
    (0x79, 7), (0x7a, 7), (0x7b, 7), (0x7ffe, 15), (0x7fc, 11),
    (0x3ffd, 14), (0x1ffd, 13), (0xffffffc, 28), (0xfffe6, 20), (0x3fffd2, 22),
    (0xfffe7, 20), (0xfffe8, 20), (0x3fffd3, 22), (0x3fffd4, 22), (0x3fffd5, 22),
    (0x7fffd9, 23), (0x3fffd6, 22), (0x7fffda, 23), (0x7fffdb, 23), (0x7fffdc, 23),
    (0x7fffdd, 23), (0x7fffde, 23), (0xffffeb, 24), (0x7fffdf, 23), (0xffffec, 24),
    (0xffffed, 24), (0x3fffd7, 22), (0x7fffe0, 23), (0xffffee, 24), (0x7fffe1, 23),
    (0x7fffe2, 23), (0x7fffe3, 23), (0x7fffe4, 23), (0x1fffdc, 21), (0x3fffd8, 22),
    (0x7fffe5, 23), (0x3fffd9, 22), (0x7fffe6, 23), (0x7fffe7, 23), (0xffffef, 24),
    (0x3fffda, 22), (0x1fffdd, 21), (0xfffe9, 20), (0x3fffdb, 22), (0x3fffdc, 22),
    (0x7fffe8, 23), (0x7fffe9, 23), (0x1fffde, 21), (0x7fffea, 23), (0x3fffdd, 22),
    (0x3fffde, 22), (0xfffff0, 24), (0x1fffdf, 21), (0x3fffdf, 22), (0x7fffeb, 23),
    (0x7fffec, 23), (0x1fffe0, 21), (0x1fffe1, 21), (0x3fffe0, 22), (0x1fffe2, 21),
    (0x7fffed, 23), (0x3fffe1, 22), (0x7fffee, 23), (0x7fffef, 23), (0xfffea, 20),
    (0x3fffe2, 22), (0x3fffe3, 22), (0x3fffe4, 22), (0x7ffff0, 23), (0x3fffe5, 22),
    (0x3fffe6, 22), (0x7ffff1, 23), (0x3ffffe0, 26), (0x3ffffe1, 26), (0xfffeb, 20),
    (0x7fff1, 19), (0x3fffe7, 22), (0x7ffff2, 23), (0x3fffe8, 22), (0x1ffffec, 25),
    (0x3ffffe2, 26), (0x3ffffe3, 26), (0x3ffffe4, 26), (0x7ffffde, 27), (0x7ffffdf, 27),
    (0x3ffffe5, 26), (0xfffff1, 24), (0x1ffffed, 25), (0x7fff2, 19), (0x1fffe3, 21),
    (0x3ffffe6, 26), (0x7ffffe0, 27), (0x7ffffe1, 27), (0x3ffffe7, 26), (0x7ffffe2, 27),
    (0xfffff2, 24), (0x1fffe4, 21), (0x1fffe5, 21), (0x3ffffe8, 26), (0x3ffffe9, 26),
    (0xffffffd, 28), (0x7ffffe3, 27), (0x7ffffe4, 27), (0x7ffffe5, 27), (0xfffec, 20),
    (0xfffff3, 24), (0xfffed, 20), (0x1fffe6, 21), (0x3fffe9, 22), (0x1fffe7, 21),
    (0x1fffe8, 21), (0x7ffff3, 23), (0x3fffea, 22), (0x3fffeb, 22), (0x1ffffee, 25),
    (0x1ffffef, 25), (0xfffff4, 24), (0xfffff5, 24), (0x3ffffea, 26), (0x7ffff4, 23),
    (0x3ffffeb, 26), (0x7ffffe6, 27), (0x3ffffec, 26), (0x3ffffed, 26), (0x7ffffe7, 27),
    (0x7ffffe8, 27), (0x7ffffe9, 27), (0x7ffffea, 27), (0x7ffffeb, 27), (0xffffffe, 28),
    (0x7ffffec, 27), (0x7ffffed, 27), (0x7ffffee, 27), (0x7ffffef, 27), (0x7fffff0, 27),
    (0x3ffffee, 26), (0x3fffffff, 30),
];

// Binary decode tree over the code table; nodes are pairs of child indices,
// negative values encode `-(symbol + 1)` leaves.
fn huffman_tree() -> &'static Vec<[i32; 2]> {
    static TREE: OnceLock<Vec<[i32; 2]>> = OnceLock::new();
    TREE.get_or_init(|| {
        let mut nodes: Vec<[i32; 2]> = vec![[0, 0]];
        for (symbol, &(code, bits)) in HUFFMAN_CODES.iter().enumerate() {
            let mut node = 0usize;
            for depth in (0..bits).rev() {
                let bit = ((code >> depth) & 1) as usize;
                if depth == 0 {
                    nodes[node][bit] = -(symbol as i32 + 1);
                } else {
                    if nodes[node][bit] == 0 {
                        nodes.push([0, 0]);
                        let next = (nodes.len() - 1) as i32;
                        nodes[node][bit] = next;
                    }
                    node = nodes[node][bit] as usize;
                }
            }
        }
        nodes
    })
}

fn huffman_decode(input: &[u8], limit: usize) -> Result<Vec<u8>, Error> {
    let tree = huffman_tree();
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut node = 0i32;
    let mut pending_bits = 0u8;
    let mut pending_all_ones = true;
    for &byte in input {
        for shift in (0..8).rev() {
            let bit = ((byte >> shift) & 1) as usize;
            pending_bits += 1;
            pending_all_ones &= bit == 1;
            node = tree[node as usize][bit];
            if node < 0 {
                let symbol = (-node - 1) as usize;
                if symbol == 256 {
                    return Err(Error::Hpack("EOS symbol inside a huffman string"));
                }
                out.push(symbol as u8);
                if out.len() > limit {
                    return Err(Error::Hpack("huffman string above the header list limit"));
                }
                node = 0;
                pending_bits = 0;
                pending_all_ones = true;
            } else if node == 0 {
                return Err(Error::Hpack("invalid huffman code"));
            }
        }
    }
    // Whatever is left must be the EOS prefix: all ones, fewer than 8 bits
    if pending_bits > 0 && (!pending_all_ones || pending_bits > 7) {
        return Err(Error::Hpack("invalid huffman padding"));
    }
    Ok(out)
}

/// Prefixed integer encoding, RFC 7541 §5.1. `flags` occupies the bits above
/// the prefix in the first byte.
pub fn encode_int(value: usize, prefix_bits: u8, flags: u8, dst: &mut Vec<u8>) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        dst.push(flags | value as u8);
        return;
    }
    dst.push(flags | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        dst.push((rest % 128 + 128) as u8);
        rest /= 128;
    }
    dst.push(rest as u8);
}

/// Decodes a prefixed integer, returning `(value, consumed)`.
pub fn decode_int(input: &[u8], prefix_bits: u8) -> Result<(usize, usize), Error> {
    if input.is_empty() {
        return Err(Error::Hpack("integer ran off the block"));
    }
    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = (input[0] & max_prefix as u8) as usize;
    if value < max_prefix {
        return Ok((value, 1));
    }
    let mut shift = 0u32;
    for (i, &byte) in input[1..].iter().enumerate() {
        value = value
            .checked_add(((byte & 0x7f) as usize) << shift)
            .ok_or(Error::Hpack("integer overflow"))?;
        if byte & 0x80 == 0 {
            return Ok((value, i + 2));
        }
        shift += 7;
        if shift > 28 {
            return Err(Error::Hpack("integer continuation too long"));
        }
    }
    Err(Error::Hpack("integer ran off the block"))
}

fn entry_size(name: &str, value: &str) -> usize {
    // each entry costs its octets plus the 32-byte overhead (RFC 7541 §4.1)
    name.len() + value.len() + 32
}

/// The dynamic table half shared by encoder and decoder.
struct DynamicTable {
    entries: VecDeque<(String, String)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    fn insert(&mut self, name: String, value: String) {
        let added = entry_size(&name, &value);
        // an entry larger than the table empties it
        if added > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.entries.push_front((name, value));
        self.size += added;
        self.evict();
    }

    fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            if let Some((name, value)) = self.entries.pop_back() {
                self.size -= entry_size(&name, &value);
            } else {
                break;
            }
        }
    }

    /// Absolute HPACK index (1-based, after the static table).
    fn get(&self, index: usize) -> Option<(&str, &str)> {
        self.entries
            .get(index)
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

/// HPACK decoder with its own dynamic table, sized by the local
/// SETTINGS_HEADER_TABLE_SIZE.
pub struct HpackDecoder {
    table: DynamicTable,
    /// Ceiling any size update must respect.
    settings_max: usize,
    /// Total decoded header octets allowed per block.
    max_header_list: usize,
}

impl HpackDecoder {
    pub fn new(max_table_size: usize, max_header_list: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            settings_max: max_table_size,
            max_header_list,
        }
    }

    pub fn set_settings_max(&mut self, max_table_size: usize) {
        self.settings_max = max_table_size;
        if self.table.max_size > max_table_size {
            self.table.set_max_size(max_table_size);
        }
    }

    fn lookup(&self, index: usize) -> Result<(String, String), Error> {
        if index == 0 {
            return Err(Error::Hpack("index zero"));
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_string(), value.to_string()));
        }
        match self.table.get(index - STATIC_TABLE.len() - 1) {
            Some((name, value)) => Ok((name.to_string(), value.to_string())),
            None => Err(Error::Hpack("index beyond the dynamic table")),
        }
    }

    fn read_string(&self, input: &[u8]) -> Result<(String, usize), Error> {
        if input.is_empty() {
            return Err(Error::Hpack("string ran off the block"));
        }
        let huffman = input[0] & 0x80 != 0;
        let (length, consumed) = decode_int(input, 7)?;
        if input.len() < consumed + length {
            return Err(Error::Hpack("string ran off the block"));
        }
        let raw = &input[consumed..consumed + length];
        let bytes = if huffman {
            huffman_decode(raw, self.max_header_list)?
        } else {
            raw.to_vec()
        };
        let text =
            String::from_utf8(bytes).map_err(|_| Error::Hpack("string is not UTF-8"))?;
        Ok((text, consumed + length))
    }

    /// Decodes one complete header block into a header list.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>, Error> {
        let mut headers = Vec::new();
        let mut octets = 0usize;
        let mut input = block;
        let mut seen_header = false;
        while !input.is_empty() {
            let first = input[0];
            if first & 0x80 != 0 {
                // indexed header field
                let (index, consumed) = decode_int(input, 7)?;
                input = &input[consumed..];
                let (name, value) = self.lookup(index)?;
                octets += name.len() + value.len() + 32;
                headers.push((name, value));
                seen_header = true;
            } else if first & 0xc0 == 0x40 {
                // literal with incremental indexing
                let (index, consumed) = decode_int(input, 6)?;
                input = &input[consumed..];
                let name = if index == 0 {
                    let (name, consumed) = self.read_string(input)?;
                    input = &input[consumed..];
                    name
                } else {
                    self.lookup(index)?.0
                };
                let (value, consumed) = self.read_string(input)?;
                input = &input[consumed..];
                octets += name.len() + value.len() + 32;
                self.table.insert(name.clone(), value.clone());
                headers.push((name, value));
                seen_header = true;
            } else if first & 0xe0 == 0x20 {
                // dynamic table size update, only legal at the block start
                if seen_header {
                    return Err(Error::Hpack("size update after a header field"));
                }
                let (size, consumed) = decode_int(input, 5)?;
                input = &input[consumed..];
                if size > self.settings_max {
                    return Err(Error::Hpack("size update above SETTINGS_HEADER_TABLE_SIZE"));
                }
                self.table.set_max_size(size);
            } else {
                // literal without indexing (0000) or never indexed (0001)
                let (index, consumed) = decode_int(input, 4)?;
                input = &input[consumed..];
                let name = if index == 0 {
                    let (name, consumed) = self.read_string(input)?;
                    input = &input[consumed..];
                    name
                } else {
                    self.lookup(index)?.0
                };
                let (value, consumed) = self.read_string(input)?;
                input = &input[consumed..];
                octets += name.len() + value.len() + 32;
                headers.push((name, value));
                seen_header = true;
            }
            if octets > self.max_header_list {
                return Err(Error::Hpack("header list above the configured maximum"));
            }
        }
        Ok(headers)
    }
}

/// HPACK encoder. Strings go out raw (the huffman bit clear), indexing uses
/// both tables with incremental insertion for repeat headers.
pub struct HpackEncoder {
    table: DynamicTable,
    pending_size_update: Option<usize>,
}

impl HpackEncoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            pending_size_update: None,
        }
    }

    /// The peer shrank (or grew) our table via SETTINGS; the change must be
    /// announced at the start of the next block.
    pub fn resize(&mut self, max_table_size: usize) {
        self.table.set_max_size(max_table_size);
        self.pending_size_update = Some(max_table_size);
    }

    fn find(&self, name: &str, value: &str) -> (Option<usize>, Option<usize>) {
        let mut name_match = None;
        for (i, (table_name, table_value)) in STATIC_TABLE.iter().enumerate() {
            if *table_name == name {
                if *table_value == value {
                    return (Some(i + 1), None);
                }
                name_match.get_or_insert(i + 1);
            }
        }
        for (i, (table_name, table_value)) in self.table.entries.iter().enumerate() {
            let index = STATIC_TABLE.len() + 1 + i;
            if table_name == name {
                if table_value == value {
                    return (Some(index), None);
                }
                name_match.get_or_insert(index);
            }
        }
        (None, name_match)
    }

    fn write_string(text: &str, dst: &mut Vec<u8>) {
        encode_int(text.len(), 7, 0x00, dst);
        dst.extend_from_slice(text.as_bytes());
    }

    /// Encodes a header list into one block.
    pub fn encode(&mut self, headers: &[(String, String)]) -> Vec<u8> {
        let mut block = Vec::new();
        if let Some(size) = self.pending_size_update.take() {
            encode_int(size, 5, 0x20, &mut block);
        }
        for (name, value) in headers {
            match self.find(name, value) {
                (Some(index), _) => encode_int(index, 7, 0x80, &mut block),
                (None, name_index) => {
                    match name_index {
                        Some(index) => encode_int(index, 6, 0x40, &mut block),
                        None => {
                            block.push(0x40);
                            Self::write_string(name, &mut block);
                        }
                    }
                    Self::write_string(value, &mut block);
                    self.table.insert(name.clone(), value.clone());
                }
            }
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(headers: &[(&str, &str)]) -> Vec<(String, String)> {
        let owned: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        let mut encoder = HpackEncoder::new(4096);
        let mut decoder = HpackDecoder::new(4096, 1 << 20);
        let block = encoder.encode(&owned);
        decoder.decode(&block).unwrap()
    }

    #[test]
    fn test_integer_coding_rfc_examples() {
        // RFC 7541 C.1: 10 with a 5-bit prefix is one byte
        let mut out = Vec::new();
        encode_int(10, 5, 0, &mut out);
        assert_eq!(out, vec![0x0a]);
        assert_eq!(decode_int(&out, 5).unwrap(), (10, 1));
        // 1337 with a 5-bit prefix
        let mut out = Vec::new();
        encode_int(1337, 5, 0, &mut out);
        assert_eq!(out, vec![0x1f, 0x9a, 0x0a]);
        assert_eq!(decode_int(&out, 5).unwrap(), (1337, 3));
    }

    #[test]
    fn test_static_indexed_roundtrip() {
        let headers = [(":method", "GET"), (":path", "/"), (":scheme", "https")];
        assert_eq!(
            roundtrip(&headers),
            headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_multimap_order_preserved() {
        let headers = [
            ("set-cookie", "a=1"),
            ("content-type", "text/html"),
            ("set-cookie", "b=2"),
        ];
        assert_eq!(
            roundtrip(&headers)
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect::<Vec<_>>(),
            headers.to_vec()
        );
    }

    #[test]
    fn test_dynamic_table_reuse_shrinks_blocks() {
        let mut encoder = HpackEncoder::new(4096);
        let mut decoder = HpackDecoder::new(4096, 1 << 20);
        let headers = vec![(
            "x-custom-header".to_string(),
            "a rather long custom value".to_string(),
        )];
        let first = encoder.encode(&headers);
        let second = encoder.encode(&headers);
        assert!(second.len() < first.len());
        assert_eq!(decoder.decode(&first).unwrap(), headers);
        assert_eq!(decoder.decode(&second).unwrap(), headers);
    }

    #[test]
    fn test_huffman_decode_rfc_vector() {
        // RFC 7541 C.4.1: "www.example.com" huffman encoded
        let wire = [
            0xf1u8, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff,
        ];
        assert_eq!(huffman_decode(&wire, 1024).unwrap(), b"www.example.com");
    }

    #[test]
    fn test_huffman_string_in_block() {
        // C.6.1 response fragment: ":status: 302" with huffman "302"
        let mut decoder = HpackDecoder::new(4096, 1 << 20);
        let block = [0x48u8, 0x82, 0x64, 0x02];
        assert_eq!(
            decoder.decode(&block).unwrap(),
            vec![(":status".to_string(), "302".to_string())]
        );
    }

    #[test]
    fn test_index_zero_fails() {
        let mut decoder = HpackDecoder::new(4096, 1 << 20);
        assert!(decoder.decode(&[0x80]).is_err());
    }

    #[test]
    fn test_index_beyond_table_fails() {
        let mut decoder = HpackDecoder::new(4096, 1 << 20);
        let mut block = Vec::new();
        encode_int(200, 7, 0x80, &mut block);
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn test_size_update_over_settings_fails() {
        let mut decoder = HpackDecoder::new(4096, 1 << 20);
        let mut block = Vec::new();
        encode_int(8192, 5, 0x20, &mut block);
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn test_size_update_mid_block_fails() {
        let mut decoder = HpackDecoder::new(4096, 1 << 20);
        // indexed :method GET, then a size update
        let block = [0x82u8, 0x20];
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn test_eviction_under_pressure() {
        let mut encoder = HpackEncoder::new(64);
        let mut decoder = HpackDecoder::new(64, 1 << 20);
        for i in 0..20 {
            let headers = vec![(format!("x-h-{}", i), "value".to_string())];
            let block = encoder.encode(&headers);
            assert_eq!(decoder.decode(&block).unwrap(), headers);
        }
        // the 64-byte table holds at most one entry at a time
        assert!(encoder.table.entries.len() <= 1);
    }

    #[test]
    fn test_truncated_string_fails() {
        let mut decoder = HpackDecoder::new(4096, 1 << 20);
        // literal with incremental indexing, name length says 10 but only 2 follow
        let block = [0x40u8, 0x0a, b'a', b'b'];
        assert!(decoder.decode(&block).is_err());
    }
}
