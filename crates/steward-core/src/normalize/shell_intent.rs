//! Tool inference for providers that only report shell command text.
//!
//! Codex runs everything through a shell, so a file read shows up as
//! `bash -lc 'cat src/main.rs'`. To give consumers the same tool vocabulary
//! as other providers, the command's shape is mapped to a tool name:
//!
//! | First word                          | Tool   |
//! |-------------------------------------|--------|
//! | `cat`, `head`, `tail`, `nl`, `less`, `sed -n` | `Read` |
//! | `rg`, `grep`, `ag`                  | `Grep` |
//! | `ls`, `find`, `fd`, `tree`          | `Glob` |
//! | anything else, or a chained command | `Bash` |

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};

/// Wrappers like `bash -lc '<cmd>'` or `/bin/zsh -c "<cmd>"`.
static SHELL_WRAPPER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:/\S*/)?(?:ba|z)?sh\s+-l?c$").unwrap());

/// Single-letter flags like -n, -i
static SINGLE_LETTER_FLAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-[a-zA-Z]$").unwrap());

/// A tool name plus the arguments a consumer would expect for it.
#[derive(Debug, Clone, PartialEq)]
pub struct InferredTool {
    pub name: &'static str,
    pub arguments: Value,
}

/// Infer the tool behind a shell command.
pub fn infer_tool(command: &str) -> InferredTool {
    let inner = unwrap_shell(command);
    let bash = || InferredTool {
        name: "Bash",
        arguments: json!({ "command": inner }),
    };

    let parts = split_on_separators(&inner);
    if parts.len() != 1 {
        return bash();
    }
    let Some(words) = shlex::split(parts[0].trim()) else {
        return bash();
    };
    let Some(first) = words.first().map(String::as_str) else {
        return bash();
    };
    let operands = operands(&words[1..]);

    match first {
        "cat" | "head" | "tail" | "nl" | "less" => match operands.last() {
            Some(path) => read(&inner, path),
            None => bash(),
        },
        "sed" if words.iter().any(|w| w == "-n") => match operands.last() {
            Some(path) if operands.len() >= 2 => read(&inner, path),
            _ => bash(),
        },
        "rg" | "grep" | "ag" => match operands.first() {
            Some(pattern) => {
                let mut arguments = json!({ "command": inner, "pattern": pattern });
                if let Some(path) = operands.get(1) {
                    arguments["path"] = json!(path);
                }
                InferredTool {
                    name: "Grep",
                    arguments,
                }
            }
            None => bash(),
        },
        "ls" | "find" | "fd" | "tree" => InferredTool {
            name: "Glob",
            arguments: json!({
                "command": inner,
                "path": operands.first().map(String::as_str).unwrap_or("."),
            }),
        },
        _ => bash(),
    }
}

fn read(command: &str, path: &str) -> InferredTool {
    InferredTool {
        name: "Read",
        arguments: json!({ "command": command, "file_path": path }),
    }
}

/// Strip one level of `sh -c` style wrapping.
fn unwrap_shell(command: &str) -> String {
    let trimmed = command.trim();
    if let Some(words) = shlex::split(trimmed) {
        if words.len() == 3 && SHELL_WRAPPER.is_match(&format!("{} {}", words[0], words[1])) {
            return words[2].clone();
        }
    }
    trimmed.to_string()
}

/// Words that are not flags, skipping the value of single-letter flags
/// (`head -n 20 file` yields `["file"]`).
fn operands(words: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let word = &words[i];
        if word.starts_with('-') {
            if SINGLE_LETTER_FLAG.is_match(word)
                && i + 1 < words.len()
                && words[i + 1].chars().all(|c| c.is_ascii_digit())
            {
                i += 1;
            }
            i += 1;
            continue;
        }
        result.push(word.clone());
        i += 1;
    }
    result
}

/// Split a command string on &&, ||, ;, and |.
fn split_on_separators(command: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut current_start = 0;
    let bytes = command.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == b'\'' || c == b'"' => quote = Some(c),
            None => {
                let next = bytes.get(i + 1).copied();
                if (c == b'&' && next == Some(b'&')) || (c == b'|' && next == Some(b'|')) {
                    parts.push(&command[current_start..i]);
                    current_start = i + 2;
                    i += 2;
                    continue;
                }
                if c == b';' || c == b'|' {
                    parts.push(&command[current_start..i]);
                    current_start = i + 1;
                }
            }
        }
        i += 1;
    }
    parts.push(&command[current_start..]);
    parts.retain(|p| !p.trim().is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_bash_lc() {
        let tool = infer_tool("bash -lc 'cat src/main.rs'");
        assert_eq!(tool.name, "Read");
        assert_eq!(tool.arguments["file_path"], "src/main.rs");
        assert_eq!(tool.arguments["command"], "cat src/main.rs");
    }

    #[test]
    fn head_with_count_reads_file() {
        let tool = infer_tool("/bin/zsh -c \"head -n 40 README.md\"");
        assert_eq!(tool.name, "Read");
        assert_eq!(tool.arguments["file_path"], "README.md");
    }

    #[test]
    fn sed_print_range_reads_file() {
        let tool = infer_tool("sed -n '1,80p' lib.rs");
        assert_eq!(tool.name, "Read");
        assert_eq!(tool.arguments["file_path"], "lib.rs");
    }

    #[test]
    fn sed_in_place_is_bash() {
        assert_eq!(infer_tool("sed -i 's/a/b/' x.txt").name, "Bash");
    }

    #[test]
    fn ripgrep_is_grep() {
        let tool = infer_tool("bash -lc 'rg -n \"fn main\" crates'");
        assert_eq!(tool.name, "Grep");
        assert_eq!(tool.arguments["pattern"], "fn main");
        assert_eq!(tool.arguments["path"], "crates");
    }

    #[test]
    fn listing_is_glob() {
        let tool = infer_tool("ls -la");
        assert_eq!(tool.name, "Glob");
        assert_eq!(tool.arguments["path"], ".");
    }

    #[test]
    fn chained_commands_stay_bash() {
        let tool = infer_tool("cat a.txt && rm a.txt");
        assert_eq!(tool.name, "Bash");
        assert_eq!(tool.arguments["command"], "cat a.txt && rm a.txt");
    }

    #[test]
    fn separators_inside_quotes_do_not_split() {
        assert_eq!(split_on_separators("echo 'a|b' ; ls"), vec!["echo 'a|b' ", " ls"]);
        assert_eq!(infer_tool("grep 'a|b' file.txt").name, "Grep");
    }

    #[test]
    fn plain_commands_are_bash() {
        assert_eq!(infer_tool("cargo test").name, "Bash");
        assert_eq!(infer_tool("cat").name, "Bash");
    }
}
