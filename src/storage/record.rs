/// Contents of `<key>_record.txt` for a split entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record {
    pub parts: u32,
    pub total_size: u64,
}

impl Record {
    pub fn encode(&self) -> String {
        format!("Parts: {}\nTotalSize: {}\n", self.parts, self.total_size)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let mut parts = None;
        let mut total_size = None;
        for line in raw.lines() {
            let line = line.trim();
            if let Some(val) = line.strip_prefix("Parts:") {
                parts = val.trim().parse().ok();
            } else if let Some(val) = line.strip_prefix("TotalSize:") {
                total_size = val.trim().parse().ok();
            }
        }
        Some(Self {
            parts: parts?,
            total_size: total_size?,
        })
    }

    /// Number of parts a writer filling `chunk_size`-byte parts produces for
    /// `total_size` bytes. An empty split entry still has one part.
    pub fn expected_parts(total_size: u64, chunk_size: u64) -> u64 {
        total_size.div_ceil(chunk_size.max(1)).max(1)
    }

    /// Whether the part count agrees with the total size at `chunk_size`.
    pub fn fits(&self, chunk_size: u64) -> bool {
        u64::from(self.parts) == Self::expected_parts(self.total_size, chunk_size)
    }
}
