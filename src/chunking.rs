//! Line-aligned text windows with overlap.

use crate::parser::LineRange;

#[derive(Debug, Clone, PartialEq)]
pub struct TextWindow {
    pub lines: LineRange,
    pub text: String,
}

/// Split `text` into windows of at most `max_chars` bytes, cutting only on line
/// boundaries. Consecutive windows share trailing lines worth up to
/// `overlap_chars`. A single line longer than `max_chars` becomes its own window.
/// Line numbers start at `first_line`.
pub fn line_windows(
    text: &str,
    first_line: usize,
    max_chars: usize,
    overlap_chars: usize,
) -> Vec<TextWindow> {
    let lines: Vec<&str> = text.lines().collect();
    let mut windows = Vec::new();
    let mut start = 0;

    while start < lines.len() {
        let mut end = start;
        let mut size = 0;
        while end < lines.len() {
            let cost = lines[end].len() + 1;
            if end > start && size + cost > max_chars {
                break;
            }
            size += cost;
            end += 1;
        }

        windows.push(TextWindow {
            lines: LineRange::new(first_line + start, first_line + end - 1),
            text: lines[start..end].join("\n"),
        });
        if end >= lines.len() {
            break;
        }

        let mut next = end;
        let mut carried = 0;
        while next > start + 1 {
            let cost = lines[next - 1].len() + 1;
            if carried + cost > overlap_chars {
                break;
            }
            carried += cost;
            next -= 1;
        }
        start = next;
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_small_text_is_one_window() {
        let windows = line_windows("a\nb\nc", 1, 100, 10);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].lines, LineRange::new(1, 3));
        assert_eq!(windows[0].text, "a\nb\nc");
    }

    #[test]
    fn test_windows_overlap_on_line_boundaries() {
        // each line costs 5 bytes with its newline
        let text = "aaaa\nbbbb\ncccc\ndddd\neeee";
        let windows = line_windows(text, 10, 10, 5);
        let ranges: Vec<(usize, usize)> = windows.iter().map(|w| (w.lines.start, w.lines.end)).collect();
        assert_eq!(ranges, vec![(10, 11), (11, 12), (12, 13), (13, 14)]);
        assert_eq!(windows[1].text, "bbbb\ncccc");
    }

    #[test]
    fn test_long_line_gets_its_own_window() {
        let text = format!("short\n{}\nend", "x".repeat(50));
        let windows = line_windows(&text, 1, 20, 0);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[1].lines, LineRange::new(2, 2));
    }

    #[test]
    fn test_empty_text_has_no_windows() {
        assert!(line_windows("", 1, 10, 0).is_empty());
    }
}
