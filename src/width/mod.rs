//! Terminal display width helpers.
//!
//! ANSI-aware width calculation so frame lines can be clipped and padded to
//! the surface width without miscounting escape sequences.

/// Compute the display width of a string after stripping ANSI escapes.
pub fn display_width(text: &str) -> usize {
    let clean = strip_ansi_escapes::strip(text);
    let clean_str = String::from_utf8_lossy(&clean);
    unicode_width::UnicodeWidthStr::width(&*clean_str)
}

/// Clip or pad `line` so it occupies exactly `width` cells.
///
/// Escape sequences take no cells and are kept even past the clip point, so a
/// trailing reset still reaches the terminal.
pub fn fit_to_width(line: &str, width: u16) -> String {
    let width = width as usize;
    let mut fitted = String::with_capacity(line.len() + width);
    let mut used = 0usize;
    let mut clipped = false;
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            fitted.push(ch);
            match chars.next() {
                Some('[') => {
                    fitted.push('[');
                    // CSI parameters run until a final byte in `@..=~`.
                    for next in chars.by_ref() {
                        fitted.push(next);
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                }
                Some(next) => fitted.push(next),
                None => {}
            }
            continue;
        }
        if clipped {
            continue;
        }
        let cell = unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + cell > width {
            clipped = true;
            continue;
        }
        fitted.push(ch);
        used += cell;
    }
    while used < width {
        fitted.push(' ');
        used += 1;
    }
    fitted
}
