//! Object maps handed to the runtime.
//!
//! The function map is a little-endian stream of u32 text offsets, one
//! per import and then per defined function.  The call-site map is a
//! stream of (u32 return address, u32 stack depth) pairs; the runtime
//! uses it to walk and rewrite suspended call stacks.

/// Function entry-address map.
#[derive(Debug, Default)]
pub struct FuncMap {
    buf: Vec<u8>,
}

impl FuncMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_func_addr(&mut self, addr: i32) {
        self.buf.extend_from_slice(&(addr as u32).to_le_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Decode the stream; test support.
    pub fn addrs(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }
}

/// Call-site map.
#[derive(Debug, Default)]
pub struct CallSiteMap {
    buf: Vec<u8>,
}

impl CallSiteMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the instruction following `ret_addr` runs with
    /// `stack_depth` bytes of operand stack (excluding the link word).
    pub fn put_call_site(&mut self, ret_addr: i32, stack_depth: i32) {
        let packed = ((stack_depth as u32 as u64) << 32) | ret_addr as u32 as u64;
        self.buf.extend_from_slice(&packed.to_le_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Decode the stream into (return address, stack depth) pairs.
    pub fn sites(bytes: &[u8]) -> Vec<(u32, u32)> {
        bytes
            .chunks_exact(8)
            .map(|c| {
                let packed = u64::from_le_bytes(c.try_into().unwrap());
                (packed as u32, (packed >> 32) as u32)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_func_map_round_trip() {
        let mut map = FuncMap::new();
        map.put_func_addr(0x40);
        map.put_func_addr(0x90);
        let bytes = map.into_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(FuncMap::addrs(&bytes), vec![0x40, 0x90]);
    }

    #[test]
    fn test_call_site_pairs_are_le_words() {
        let mut map = CallSiteMap::new();
        map.put_call_site(0x1234, 16);
        let bytes = map.into_bytes();
        // return address word first, stack depth word second
        assert_eq!(&bytes[..4], &[0x34, 0x12, 0, 0]);
        assert_eq!(&bytes[4..], &[16, 0, 0, 0]);
        assert_eq!(CallSiteMap::sites(&bytes), vec![(0x1234, 16)]);
    }
}
