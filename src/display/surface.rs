use std::io::Write;

use blake3::Hash;

use crate::error::Result;
use crate::geometry::{Rect, Size};

use super::Frame;

const CSI: &str = "\x1b[";

/// Destination for rendered frames. Owned by the manager and only touched on
/// the runtime worker.
pub trait Surface: Send {
    fn size(&self) -> Size;

    fn present(&mut self, frame: &Frame) -> Result<()>;
}

/// Surface that discards frames; used when no output device is attached.
#[derive(Debug, Clone, Copy)]
pub struct NullSurface {
    size: Size,
}

impl NullSurface {
    pub fn new(size: Size) -> Self {
        Self { size }
    }
}

impl Surface for NullSurface {
    fn size(&self) -> Size {
        self.size
    }

    fn present(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }
}

/// ANSI escape code surface writing frames into a viewport of a terminal.
pub struct AnsiSurface<W: Write + Send> {
    writer: W,
    viewport: Rect,
    restore_cursor: Option<(u16, u16)>,
    last_frame: Option<Hash>,
}

impl<W: Write + Send> AnsiSurface<W> {
    pub fn new(writer: W, viewport: Rect) -> Self {
        Self {
            writer,
            viewport,
            restore_cursor: None,
            last_frame: None,
        }
    }

    /// Park the cursor at `(row, col)` after every presented frame.
    pub fn with_restore_cursor(mut self, row: u16, col: u16) -> Self {
        self.restore_cursor = Some((row, col));
        self
    }

    pub fn resize(&mut self, viewport: Rect) {
        self.viewport = viewport;
        self.last_frame = None;
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Surface for AnsiSurface<W> {
    fn size(&self) -> Size {
        self.viewport.size()
    }

    fn present(&mut self, frame: &Frame) -> Result<()> {
        let fingerprint = frame.fingerprint();
        if self.last_frame == Some(fingerprint) {
            return Ok(());
        }

        let Rect {
            x,
            y,
            width,
            height,
        } = self.viewport;
        if width == 0 || height == 0 {
            return Ok(());
        }

        for (offset, line) in frame.lines().iter().take(height as usize).enumerate() {
            let row = u16::try_from(offset)
                .unwrap_or(u16::MAX)
                .saturating_add(y)
                .saturating_add(1);
            write!(self.writer, "{CSI}{};{}H", row, x.saturating_add(1))?;
            write!(self.writer, "{line}")?;
        }

        if let Some((row, col)) = self.restore_cursor {
            write!(
                self.writer,
                "{CSI}{};{}H",
                row.saturating_add(1),
                col.saturating_add(1)
            )?;
        }

        self.writer.flush()?;
        self.last_frame = Some(fingerprint);
        Ok(())
    }
}
