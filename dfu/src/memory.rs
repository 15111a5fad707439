//! DfuSe memory layout, parsed from the alternate-setting name string
//! (e.g. `@Internal Flash  /0x08000000/12*001Ka,108*001Kg`).

use nonempty::NonEmpty;
use regex::Regex;

#[derive(Debug, PartialEq, Eq)]
pub struct DfuMemory {
    pub name: String,
    pub segments: NonEmpty<DfuMemSegment>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DfuMemSegment {
    start_addr: u32,
    end_addr: u32,
    page_size: u32,
    mem_type: u8,
}

impl DfuMemory {
    /// Parse an alternate-setting name string. Returns `None` when the
    /// string does not follow the DfuSe layout grammar.
    pub fn parse(desc: &str) -> Option<DfuMemory> {
        let header = Regex::new(r"@?([^/]*?)\s*/0x([\da-fA-F]+)U?/(.*)").unwrap();
        let captures = header.captures(desc)?;

        let name = String::from(&captures[1]);
        let start_addr = u32::from_str_radix(&captures[2], 16).ok()?;

        let seg_re = Regex::new(r"(\d+)\*(\d+)([KMB ])([a-g])(?:,|$)").unwrap();
        let mut segments = Vec::new();
        let mut current_addr = start_addr;

        for seg in seg_re.captures_iter(&captures[3]) {
            let pages: u32 = seg[1].parse().unwrap_or(0);
            let mut page_size: u32 = seg[2].parse().unwrap_or(0);
            match &seg[3] {
                "K" => page_size *= 1024,
                "M" => page_size *= 1024 * 1024,
                _ => {}
            }
            if pages == 0 || page_size == 0 {
                return None;
            }
            let end_addr = current_addr + pages * page_size;
            segments.push(DfuMemSegment {
                start_addr: current_addr,
                end_addr,
                page_size,
                mem_type: (seg[4].bytes().next().unwrap_or(b'a')) & 7,
            });
            current_addr = end_addr;
        }

        NonEmpty::from_vec(segments)
            .map(|segments| DfuMemory { name, segments })
    }

    pub fn segment_containing(&self, addr: u32) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    /// Start addresses of every page that must be erased before writing
    /// `len` bytes at `start_addr`. `None` when any part of the range falls
    /// outside the layout.
    pub fn erase_pages(&self, start_addr: u32, len: u32) -> Option<Vec<u32>> {
        if len == 0 {
            return Some(Vec::new());
        }
        let end_addr = start_addr.checked_add(len)? - 1;
        let mut pages = Vec::new();
        let mut addr = start_addr;
        loop {
            let segment = self.segment_containing(addr)?;
            let page = segment.page_start(addr);
            pages.push(page);
            match page.checked_add(segment.page_size) {
                Some(next) if next <= end_addr => addr = next,
                _ => break,
            }
        }
        Some(pages)
    }
}

impl DfuMemSegment {
    pub fn start_addr(&self) -> u32 {
        self.start_addr
    }
    pub fn end_addr(&self) -> u32 {
        self.end_addr
    }
    pub fn page_size(&self) -> u32 {
        self.page_size
    }
    pub fn pages(&self) -> u32 {
        (self.end_addr - self.start_addr) / self.page_size
    }
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start_addr && addr < self.end_addr
    }
    /// Start address of the page `addr` falls in.
    pub fn page_start(&self, addr: u32) -> u32 {
        addr - ((addr - self.start_addr) % self.page_size)
    }
    pub fn readable(&self) -> bool {
        self.mem_type & 1 == 1
    }
    pub fn erasable(&self) -> bool {
        self.mem_type & 2 == 2
    }
    pub fn writable(&self) -> bool {
        self.mem_type & 4 == 4
    }
}
