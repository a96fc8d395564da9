//! Render output parser - wrapper markers, Houdini/Redshift and generic text
//!
//! `classify` looks at a single line and never carries state between calls.
//! Anything it does not recognize comes back as `None`; the caller still
//! keeps the raw line.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Structured meaning of one output line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    FrameStarted {
        frame: i64,
    },
    /// `frame` is `None` when the line closes whatever frame is rendering
    FrameDone {
        frame: Option<i64>,
        render_time: Option<Duration>,
    },
    FrameFailed {
        frame: Option<i64>,
        message: String,
    },
    /// Progress inside the current frame, 0-100
    FrameProgress {
        percent: u8,
    },
    OutputWritten {
        path: PathBuf,
    },
    Note {
        message: String,
    },
}

/// Line classifier for renderer output
pub struct OutputParser {
    // Markers printed by the bundled wrapper script
    marker_start_re: Regex,
    marker_done_re: Regex,
    marker_failed_re: Regex,
    marker_output_re: Regex,
    marker_note_re: Regex,
    // Houdini / Redshift
    rop_frame_re: Regex,
    total_time_re: Regex,
    block_re: Regex,
    saved_file_re: Regex,
    // Generic renderers
    rendering_frame_re: Regex,
    frame_done_re: Regex,
    frame_failed_re: Regex,
    error_frame_re: Regex,
}

const REDSHIFT_PREFIX: &str = "[Redshift]";

const SKIP_MESSAGES: [&str; 2] = [
    "Skip rendering enabled. File already rendered",
    "Skipped - File already exists",
];

impl OutputParser {
    pub fn new() -> Self {
        Self {
            marker_start_re: Regex::new(r"^hardeen_frame_start:\s*(-?\d+)").unwrap(),
            marker_done_re: Regex::new(
                r"^hardeen_frame_done:\s*(-?\d+)(?:\s+time=(\d+(?:\.\d+)?))?",
            )
            .unwrap(),
            marker_failed_re: Regex::new(r"^hardeen_frame_failed:\s*(-?\d+)\s*(.*)$").unwrap(),
            marker_output_re: Regex::new(r"^hardeen_outputfile:\s*(.+?)\s*$").unwrap(),
            marker_note_re: Regex::new(r"^hardeen_note:\s*(.*)$").unwrap(),
            rop_frame_re: Regex::new(r"'([^']+)' rendering frame (-?\d+)").unwrap(),
            total_time_re: Regex::new(r"total time (\d+(?:\.\d+)?) sec").unwrap(),
            block_re: Regex::new(r"Block (\d+)/(\d+)").unwrap(),
            saved_file_re: Regex::new(r#"Saved file ['"]([^'"]+)['"]"#).unwrap(),
            rendering_frame_re: Regex::new(r"(?i)^\s*rendering frame (-?\d+)").unwrap(),
            frame_done_re: Regex::new(
                r"(?i)\bframe (-?\d+) (?:done|finished|complete[d]?)(?: in (\d+(?:\.\d+)?)\s*s)?",
            )
            .unwrap(),
            frame_failed_re: Regex::new(r"(?i)\bframe (-?\d+) failed\b:?\s*(.*)$").unwrap(),
            error_frame_re: Regex::new(r"(?i)\berror\b.*\bframe (-?\d+)").unwrap(),
        }
    }

    /// Classify one line of renderer output
    pub fn classify(&self, line: &str) -> Option<OutputEvent> {
        let line = strip_prefix(line);
        if line.is_empty() {
            return None;
        }

        self.classify_marker(line)
            .or_else(|| self.classify_houdini(line))
            .or_else(|| self.classify_generic(line))
    }

    fn classify_marker(&self, line: &str) -> Option<OutputEvent> {
        if !line.starts_with("hardeen_") {
            return None;
        }
        if let Some(caps) = self.marker_start_re.captures(line) {
            return Some(OutputEvent::FrameStarted {
                frame: parse_frame(&caps[1])?,
            });
        }
        if let Some(caps) = self.marker_done_re.captures(line) {
            return Some(OutputEvent::FrameDone {
                frame: Some(parse_frame(&caps[1])?),
                render_time: caps.get(2).and_then(|m| parse_secs(m.as_str())),
            });
        }
        if let Some(caps) = self.marker_failed_re.captures(line) {
            return Some(OutputEvent::FrameFailed {
                frame: Some(parse_frame(&caps[1])?),
                message: caps[2].to_string(),
            });
        }
        if let Some(caps) = self.marker_output_re.captures(line) {
            return Some(OutputEvent::OutputWritten {
                path: PathBuf::from(&caps[1]),
            });
        }
        if let Some(caps) = self.marker_note_re.captures(line) {
            return Some(OutputEvent::Note {
                message: caps[1].to_string(),
            });
        }
        None
    }

    fn classify_houdini(&self, line: &str) -> Option<OutputEvent> {
        if let Some(caps) = self.rop_frame_re.captures(line) {
            return Some(OutputEvent::FrameStarted {
                frame: parse_frame(&caps[2])?,
            });
        }
        if line.contains("scene extraction time") {
            if let Some(caps) = self.total_time_re.captures(line) {
                return Some(OutputEvent::FrameDone {
                    frame: None,
                    render_time: parse_secs(&caps[1]),
                });
            }
        }
        if let Some(caps) = self.block_re.captures(line) {
            let block: u64 = caps[1].parse().ok()?;
            let total: u64 = caps[2].parse().ok()?;
            if total == 0 {
                return None;
            }
            let percent = (u128::from(block.min(total)) * 100 / u128::from(total)) as u8;
            return Some(OutputEvent::FrameProgress { percent });
        }
        if let Some(caps) = self.saved_file_re.captures(line) {
            return Some(OutputEvent::OutputWritten {
                path: PathBuf::from(&caps[1]),
            });
        }
        // The renderer's own skip is informational; skipping is decided
        // before launch
        if SKIP_MESSAGES.iter().any(|m| line.contains(m)) {
            return Some(OutputEvent::Note {
                message: line.to_string(),
            });
        }
        None
    }

    fn classify_generic(&self, line: &str) -> Option<OutputEvent> {
        if let Some(caps) = self.rendering_frame_re.captures(line) {
            return Some(OutputEvent::FrameStarted {
                frame: parse_frame(&caps[1])?,
            });
        }
        if let Some(caps) = self.frame_failed_re.captures(line) {
            return Some(OutputEvent::FrameFailed {
                frame: Some(parse_frame(&caps[1])?),
                message: non_empty_or(&caps[2], line),
            });
        }
        if let Some(caps) = self.frame_done_re.captures(line) {
            return Some(OutputEvent::FrameDone {
                frame: Some(parse_frame(&caps[1])?),
                render_time: caps.get(2).and_then(|m| parse_secs(m.as_str())),
            });
        }
        if let Some(caps) = self.error_frame_re.captures(line) {
            return Some(OutputEvent::FrameFailed {
                frame: Some(parse_frame(&caps[1])?),
                message: line.to_string(),
            });
        }
        None
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_prefix(line: &str) -> &str {
    let line = line.trim();
    match line.strip_prefix(REDSHIFT_PREFIX) {
        Some(rest) => rest.trim_start(),
        None => line,
    }
}

fn parse_frame(s: &str) -> Option<i64> {
    s.parse().ok()
}

fn parse_secs(s: &str) -> Option<Duration> {
    s.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn non_empty_or(s: &str, fallback: &str) -> String {
    if s.trim().is_empty() {
        fallback.to_string()
    } else {
        s.trim().to_string()
    }
}

/// Classify with a shared parser
pub fn classify(line: &str) -> Option<OutputEvent> {
    static PARSER: OnceLock<OutputParser> = OnceLock::new();
    PARSER.get_or_init(OutputParser::new).classify(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_markers() {
        assert_eq!(
            classify("hardeen_frame_start: 12"),
            Some(OutputEvent::FrameStarted { frame: 12 })
        );
        assert_eq!(
            classify("hardeen_frame_done: 12 time=3.5"),
            Some(OutputEvent::FrameDone {
                frame: Some(12),
                render_time: Some(Duration::from_secs_f64(3.5)),
            })
        );
        assert_eq!(
            classify("hardeen_frame_failed: 13 hou.OperationFailed"),
            Some(OutputEvent::FrameFailed {
                frame: Some(13),
                message: "hou.OperationFailed".to_string(),
            })
        );
        assert_eq!(
            classify("hardeen_outputfile: /render/beauty.0012.exr"),
            Some(OutputEvent::OutputWritten {
                path: PathBuf::from("/render/beauty.0012.exr")
            })
        );
        assert!(matches!(classify("hardeen_note: merge node"), Some(OutputEvent::Note { .. })));
    }

    #[test]
    fn test_redshift_lines() {
        assert_eq!(
            classify("[Redshift] '/out/Redshift_ROP1' rendering frame 1001"),
            Some(OutputEvent::FrameStarted { frame: 1001 })
        );
        assert_eq!(
            classify("[Redshift] Rendering done, scene extraction time 1.20 sec, total time 42.75 sec"),
            Some(OutputEvent::FrameDone {
                frame: None,
                render_time: Some(Duration::from_secs_f64(42.75)),
            })
        );
        assert_eq!(
            classify("[Redshift]    Block 8/32 (3,1) rendered by GPU 0 in 12ms"),
            Some(OutputEvent::FrameProgress { percent: 25 })
        );
        assert_eq!(
            classify("[Redshift] Saved file '/render/beauty.1001.exr' in 35ms"),
            Some(OutputEvent::OutputWritten {
                path: PathBuf::from("/render/beauty.1001.exr")
            })
        );
        assert!(matches!(
            classify("[Redshift] Skip rendering enabled. File already rendered"),
            Some(OutputEvent::Note { .. })
        ));
    }

    #[test]
    fn test_generic_lines() {
        assert_eq!(
            classify("rendering frame 3"),
            Some(OutputEvent::FrameStarted { frame: 3 })
        );
        assert_eq!(
            classify("frame 1 done"),
            Some(OutputEvent::FrameDone {
                frame: Some(1),
                render_time: None
            })
        );
        assert_eq!(
            classify("Frame 2 done in 4.5s"),
            Some(OutputEvent::FrameDone {
                frame: Some(2),
                render_time: Some(Duration::from_secs_f64(4.5)),
            })
        );
        assert_eq!(
            classify("frame 7 failed: out of VRAM"),
            Some(OutputEvent::FrameFailed {
                frame: Some(7),
                message: "out of VRAM".to_string(),
            })
        );
        assert!(matches!(
            classify("ERROR: texture missing on frame 9"),
            Some(OutputEvent::FrameFailed { frame: Some(9), .. })
        ));
    }

    #[test]
    fn test_unrecognized_lines() {
        for line in [
            "",
            "   ",
            "Loading RS rendering options",
            "ERROR: license server unreachable",
            "Block 3/0",
            "frame abc done",
            "rendering frame 99999999999999999999999",
        ] {
            assert_eq!(classify(line), None, "line: {:?}", line);
        }
    }

    #[test]
    fn test_block_progress_with_huge_counts() {
        assert_eq!(
            classify("[Redshift] Block 999999999999999999/999999999999999999"),
            Some(OutputEvent::FrameProgress { percent: 100 })
        );
        assert_eq!(
            classify("Block 18446744073709551615/18446744073709551615"),
            Some(OutputEvent::FrameProgress { percent: 100 })
        );
    }

    #[test]
    fn test_classify_is_idempotent() {
        let line = "[Redshift] '/out/rs' rendering frame 4";
        assert_eq!(classify(line), classify(line));
    }

    #[test]
    fn test_classify_never_panics() {
        let junk = [
            "\u{0}\u{1}\u{2}",
            "frame -0 done in 1e400s",
            "total time 1e309 sec scene extraction time",
            "hardeen_frame_done: 1 time=99999999999999999999999999999.0",
            "Block 999999999999999999999/1",
            "Block 999999999999999999/999999999999999999",
            "🎬 frame 🎬 done",
            "'' rendering frame -",
        ];
        for line in junk {
            let _ = classify(line);
        }
        for byte in 0u8..=255 {
            let line = String::from_utf8_lossy(&[b'f', byte, b'\n']).into_owned();
            let _ = classify(&line);
        }
    }
}
