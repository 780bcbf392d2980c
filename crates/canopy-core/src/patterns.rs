//! Line-level pattern detection for agent lifecycle inference.
//!
//! Each function looks at one ANSI-stripped line of terminal output and
//! answers whether it belongs to a pattern family. The detector combines the
//! answers; nothing here keeps state.

use std::sync::LazyLock;

use regex::Regex;

/// Spinner characters used in braille-style loading indicators.
const BRAILLE_SPINNERS: [char; 10] = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

/// Circle and star spinners used by agent CLIs while the model is generating.
const AGENT_SPINNERS: [char; 10] = ['◐', '◑', '◒', '◓', '✻', '✽', '✶', '✳', '✢', '·'];

/// Markers agents print before a tool invocation.
const TOOL_MARKERS: [char; 3] = ['⏺', '●', '▶'];

const BUSY_PHRASES: [&str; 6] = [
    "esc to interrupt",
    "ctrl+c to interrupt",
    "thinking",
    "generating",
    "working…",
    "working...",
];

const PROMPT_PHRASES: [&str; 9] = [
    "do you want to",
    "would you like to",
    "press enter to",
    "allow this",
    "approve",
    "waiting for input",
    "waiting for your",
    "continue?",
    "proceed?",
];

const FAILURE_PHRASES: [&str; 5] = [
    "fatal:",
    "panicked at",
    "unhandled exception",
    "segmentation fault",
    "command not found",
];

const COMPLETION_PHRASES: [&str; 4] = [
    "task completed",
    "all done",
    "session ended",
    "goodbye",
];

#[allow(clippy::expect_used)]
static YES_NO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\(y/n\)|\[y/n\]|\(yes/no\)|\[yes/no\])\s*[:?]?\s*$")
        .expect("Invalid yes/no prompt regex")
});

#[allow(clippy::expect_used)]
static NUMBERED_CHOICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[❯>]\s*1\.\s+\S").expect("Invalid numbered choice regex")
});

#[allow(clippy::expect_used)]
static EXIT_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:process )?exited with (?:code|status) (-?\d+)")
        .expect("Invalid exit status regex")
});

#[allow(clippy::expect_used)]
static TOOL_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:Running|Executing|\$)\s+\S|^\s*(?:Bash|Read|Edit|Write|Grep|Glob)\(")
        .expect("Invalid tool call regex")
});

fn lower(text: &str) -> String {
    text.trim().to_lowercase()
}

fn first_char(text: &str) -> Option<char> {
    text.trim_start().chars().next()
}

/// The agent is asking the user something and will block until answered.
pub fn is_input_prompt(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if YES_NO_RE.is_match(trimmed) || NUMBERED_CHOICE_RE.is_match(trimmed) {
        return true;
    }
    let lowered = lower(trimmed);
    if lowered.starts_with("press enter") {
        return true;
    }
    PROMPT_PHRASES.iter().any(|p| lowered.contains(p)) && lowered.ends_with(&['?', ':'][..])
}

/// The model is generating: spinners and interrupt hints.
pub fn is_busy_indicator(text: &str) -> bool {
    let Some(first) = first_char(text) else {
        return false;
    };
    if BRAILLE_SPINNERS.contains(&first) {
        return true;
    }
    let lowered = lower(text);
    if AGENT_SPINNERS.contains(&first) && lowered.len() > first.len_utf8() {
        return true;
    }
    BUSY_PHRASES.iter().any(|p| lowered.contains(p))
}

/// The agent is executing a tool or shell command rather than thinking.
pub fn is_tool_run(text: &str) -> bool {
    let Some(first) = first_char(text) else {
        return false;
    };
    if TOOL_MARKERS.contains(&first) && text.contains('(') {
        return true;
    }
    TOOL_CALL_RE.is_match(text)
}

/// Exit code reported by the agent wrapper, if this line carries one.
pub fn exit_status(text: &str) -> Option<i32> {
    EXIT_STATUS_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn is_failure(text: &str) -> bool {
    if let Some(code) = exit_status(text) {
        return code != 0;
    }
    let lowered = lower(text);
    FAILURE_PHRASES.iter().any(|p| lowered.contains(p))
}

pub fn is_completion(text: &str) -> bool {
    if let Some(code) = exit_status(text) {
        return code == 0;
    }
    let lowered = lower(text);
    COMPLETION_PHRASES.iter().any(|p| lowered.contains(p))
}

/// Strip CSI and OSC escape sequences, keeping printable text.
pub fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();

                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() || next == '~' || next == '@' {
                        break;
                    }
                }
            } else if chars.peek() == Some(&']') {
                chars.next();
                while let Some(&next) = chars.peek() {
                    if next == '\x07' {
                        chars.next();
                        break;
                    } else if next == '\x1b' {
                        chars.next();
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                    chars.next();
                }
            } else {
                chars.next();
            }
        } else if c == '\x07' || c == '\x08' {
            continue;
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_prompt_patterns() {
        assert!(is_input_prompt("Do you want to create README.md?"));
        assert!(is_input_prompt("Overwrite existing file? (y/n)"));
        assert!(is_input_prompt("Continue [Y/n]: "));
        assert!(is_input_prompt("❯ 1. Yes"));
        assert!(is_input_prompt("Press Enter to continue"));

        assert!(!is_input_prompt("I will now approve the changes by editing"));
        assert!(!is_input_prompt("Compiling canopy v0.4.0"));
        assert!(!is_input_prompt(""));
    }

    #[test]
    fn test_busy_indicator_patterns() {
        assert!(is_busy_indicator("⠋ Loading..."));
        assert!(is_busy_indicator("✻ Pondering… (esc to interrupt)"));
        assert!(is_busy_indicator("Thinking"));

        assert!(!is_busy_indicator("✻"));
        assert!(!is_busy_indicator("Hello"));
        assert!(!is_busy_indicator(""));
    }

    #[test]
    fn test_tool_run_patterns() {
        assert!(is_tool_run("⏺ Bash(cargo test)"));
        assert!(is_tool_run("Running cargo build"));
        assert!(is_tool_run("Read(src/lib.rs)"));

        assert!(!is_tool_run("⏺ I'll look at the file first."));
        assert!(!is_tool_run("The build is running fine"));
    }

    #[test]
    fn test_exit_status_drives_outcome() {
        assert_eq!(exit_status("Process exited with code 0"), Some(0));
        assert!(is_completion("process exited with code 0"));
        assert!(!is_failure("process exited with code 0"));

        assert!(is_failure("exited with status 2"));
        assert!(!is_completion("exited with status 2"));
    }

    #[test]
    fn test_failure_and_completion_phrases() {
        assert!(is_failure("thread 'main' panicked at src/main.rs:3:5"));
        assert!(is_failure("fatal: not a git repository"));
        assert!(is_completion("✔ Task completed in 42s"));

        assert!(!is_failure("0 failed; 3 passed"));
        assert!(!is_completion("Starting task"));
    }

    #[test]
    fn test_strip_ansi_codes() {
        assert_eq!(strip_ansi_codes("\x1b[1;32mok\x1b[0m"), "ok");
        assert_eq!(strip_ansi_codes("\x1b]0;title\x07prompt"), "prompt");
        assert_eq!(strip_ansi_codes("\x1b]8;;http://x\x1b\\link"), "link");
        assert_eq!(strip_ansi_codes("plain"), "plain");
    }
}
