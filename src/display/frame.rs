use blake3::Hash;

use crate::geometry::Size;
use crate::width::fit_to_width;

/// Character-cell render target handed to [`super::Display::render`].
///
/// Every stored line is exactly `size.width` cells wide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    size: Size,
    lines: Vec<String>,
}

impl Frame {
    pub fn new(size: Size) -> Self {
        let blank = fit_to_width("", size.width);
        Self {
            size,
            lines: vec![blank; size.height as usize],
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Replace row `row`; out-of-range rows are ignored.
    pub fn set_line(&mut self, row: u16, text: &str) {
        if let Some(line) = self.lines.get_mut(row as usize) {
            *line = fit_to_width(text, self.size.width);
        }
    }

    pub fn clear(&mut self) {
        let blank = fit_to_width("", self.size.width);
        for line in &mut self.lines {
            line.clone_from(&blank);
        }
    }

    pub fn fingerprint(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        for line in &self.lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize()
    }
}
