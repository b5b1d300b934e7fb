//! Static and dynamic header tables (RFC 7541 Section 2.3).

use std::collections::VecDeque;

use super::FIELD_OVERHEAD;

/// Entries of the static table; index 1 is the first element.
pub const STATIC_TABLE: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

pub const STATIC_LEN: usize = STATIC_TABLE.len();

/// Result of looking a field up in the combined index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// Name and value both match.
    Field(usize),
    /// Only the name matches.
    Name(usize),
}

fn entry_size(name: &[u8], value: &[u8]) -> usize {
    name.len() + value.len() + FIELD_OVERHEAD as usize
}

/// FIFO table of recently inserted fields. The newest entry has the lowest
/// index.
#[derive(Debug)]
pub struct DynamicTable {
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict(0);
    }

    /// Insert a field, evicting from the oldest end. A field larger than the
    /// whole table empties it and is not stored (RFC 7541 Section 4.4).
    pub fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let size = entry_size(&name, &value);
        if size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict(size);
        self.size += size;
        self.entries.push_front((name, value));
    }

    fn evict(&mut self, incoming: usize) {
        while self.size + incoming > self.max_size {
            match self.entries.pop_back() {
                Some((name, value)) => self.size -= entry_size(&name, &value),
                None => break,
            }
        }
    }

    /// Field at `index` in the combined static and dynamic index space.
    pub fn get(&self, index: usize) -> Option<(&[u8], &[u8])> {
        match index {
            0 => None,
            1..=STATIC_LEN => STATIC_TABLE
                .get(index - 1)
                .map(|&(name, value)| (name, value)),
            _ => self
                .entries
                .get(index - STATIC_LEN - 1)
                .map(|(name, value)| (name.as_slice(), value.as_slice())),
        }
    }

    /// Best match for a field. Full matches win over name matches and the
    /// static table wins over the dynamic table.
    pub fn find(&self, name: &[u8], value: &[u8]) -> Option<Match> {
        let mut name_match = None;
        for (i, &(n, v)) in STATIC_TABLE.iter().enumerate() {
            if n == name {
                if v == value {
                    return Some(Match::Field(i + 1));
                }
                name_match.get_or_insert(i + 1);
            }
        }
        for (i, (n, v)) in self.entries.iter().enumerate() {
            if n.as_slice() == name {
                if v.as_slice() == value {
                    return Some(Match::Field(STATIC_LEN + i + 1));
                }
                name_match.get_or_insert(STATIC_LEN + i + 1);
            }
        }
        name_match.map(Match::Name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_indices() {
        let table = DynamicTable::new(4096);
        assert_eq!(table.get(1), Some((&b":authority"[..], &b""[..])));
        assert_eq!(table.get(2), Some((&b":method"[..], &b"GET"[..])));
        assert_eq!(table.get(61), Some((&b"www-authenticate"[..], &b""[..])));
        assert_eq!(table.get(0), None);
        assert_eq!(table.get(62), None);
    }

    #[test]
    fn test_eviction_keeps_newest() {
        // Each entry is 32 + 1 + 1 = 34 bytes; room for two.
        let mut table = DynamicTable::new(70);
        table.insert(b"a".to_vec(), b"1".to_vec());
        table.insert(b"b".to_vec(), b"2".to_vec());
        table.insert(b"c".to_vec(), b"3".to_vec());
        assert_eq!(table.len(), 2);
        assert_eq!(table.size(), 68);
        assert_eq!(table.get(62), Some((&b"c"[..], &b"3"[..])));
        assert_eq!(table.get(63), Some((&b"b"[..], &b"2"[..])));
        assert_eq!(table.get(64), None);
    }

    #[test]
    fn test_oversized_insert_empties_table() {
        let mut table = DynamicTable::new(40);
        table.insert(b"a".to_vec(), b"1".to_vec());
        table.insert(b"name".to_vec(), vec![b'x'; 64]);
        assert_eq!(table.len(), 0);
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn test_find_prefers_full_match() {
        let mut table = DynamicTable::new(4096);
        assert_eq!(table.find(b":method", b"GET"), Some(Match::Field(2)));
        assert_eq!(table.find(b":method", b"PUT"), Some(Match::Name(2)));
        table.insert(b"x-token".to_vec(), b"abc".to_vec());
        assert_eq!(table.find(b"x-token", b"abc"), Some(Match::Field(62)));
        assert_eq!(table.find(b"x-token", b"def"), Some(Match::Name(62)));
        assert_eq!(table.find(b"x-other", b""), None);
    }

    #[test]
    fn test_shrinking_evicts() {
        let mut table = DynamicTable::new(4096);
        table.insert(b"a".to_vec(), b"1".to_vec());
        table.insert(b"b".to_vec(), b"2".to_vec());
        table.set_max_size(34);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(62), Some((&b"b"[..], &b"2"[..])));
        assert_eq!(table.max_size(), 34);
    }
}
