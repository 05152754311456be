// Comment-based help extraction (`.SYNOPSIS`, `.DESCRIPTION`, `.PARAMETER` ...)

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref KEYWORD_LINE: Regex =
        Regex::new(r"^\s*\.([A-Za-z]+)(?:\s+(.*?))?\s*$").expect("valid keyword regex");
    static ref TAGS_LINE: Regex = Regex::new(r"(?i)^\s*tags\s*:\s*(.*)$").expect("valid tags regex");
}

const KNOWN_KEYWORDS: &[&str] = &[
    "SYNOPSIS",
    "DESCRIPTION",
    "PARAMETER",
    "EXAMPLE",
    "NOTES",
    "INPUTS",
    "OUTPUTS",
    "LINK",
    "COMPONENT",
    "ROLE",
    "FUNCTIONALITY",
];

/// Raw sections of a help block
#[derive(Debug, Default)]
pub struct HelpBlock {
    pub synopsis: String,
    pub description: String,
    /// (name, description) in declaration order
    pub parameters: Vec<(String, String)>,
    pub examples: Vec<String>,
    pub notes: String,
    pub tags: Vec<String>,
}

enum Section {
    Synopsis,
    Description,
    Parameter(String),
    Example,
    Notes,
    Ignored,
}

/// Find the first comment block that uses help keywords and split it into sections
pub fn extract_help(content: &str, warnings: &mut Vec<String>) -> HelpBlock {
    match find_help_lines(content, warnings) {
        Some(lines) => parse_sections(&lines, warnings),
        None => HelpBlock::default(),
    }
}

fn has_keyword(lines: &[String]) -> bool {
    lines.iter().any(|line| keyword_of(line).is_some())
}

fn keyword_of(line: &str) -> Option<(String, Option<String>)> {
    let caps = KEYWORD_LINE.captures(line)?;
    let keyword = caps.get(1)?.as_str().to_ascii_uppercase();
    if !KNOWN_KEYWORDS.contains(&keyword.as_str()) {
        return None;
    }
    let argument = caps
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());
    Some((keyword, argument))
}

fn find_help_lines(content: &str, warnings: &mut Vec<String>) -> Option<Vec<String>> {
    // Block comments first: <# ... #>
    let mut rest = content;
    while let Some(start) = rest.find("<#") {
        let after = &rest[start + 2..];
        let (body, next) = match after.find("#>") {
            Some(end) => (&after[..end], &after[end + 2..]),
            None => {
                warnings.push("Unterminated comment block '<#' without closing '#>'".to_string());
                (after, "")
            }
        };
        let lines: Vec<String> = body.lines().map(str::to_string).collect();
        if has_keyword(&lines) {
            return Some(lines);
        }
        rest = next;
    }

    // Then runs of single-line comments: # .SYNOPSIS
    let mut run: Vec<String> = Vec::new();
    for line in content.lines().chain(std::iter::once("")) {
        let trimmed = line.trim_start();
        let is_comment = trimmed.starts_with('#')
            && !trimmed.starts_with("#>")
            && !trimmed.to_ascii_lowercase().starts_with("#requires");
        if is_comment {
            run.push(trimmed[1..].to_string());
            continue;
        }
        if has_keyword(&run) {
            return Some(run);
        }
        run.clear();
    }

    None
}

fn parse_sections(lines: &[String], warnings: &mut Vec<String>) -> HelpBlock {
    let mut help = HelpBlock::default();
    let mut current = Section::Ignored;
    let mut buffer: Vec<String> = Vec::new();

    for line in lines {
        if let Some((keyword, argument)) = keyword_of(line) {
            flush(&mut help, &current, &buffer, warnings);
            buffer.clear();
            current = match keyword.as_str() {
                "SYNOPSIS" => Section::Synopsis,
                "DESCRIPTION" => Section::Description,
                "EXAMPLE" => Section::Example,
                "NOTES" => Section::Notes,
                "PARAMETER" => match argument {
                    Some(name) => Section::Parameter(name),
                    None => {
                        warnings.push(".PARAMETER keyword without a parameter name".to_string());
                        Section::Ignored
                    }
                },
                _ => Section::Ignored,
            };
        } else {
            buffer.push(line.trim().to_string());
        }
    }
    flush(&mut help, &current, &buffer, warnings);

    help
}

fn flush(help: &mut HelpBlock, section: &Section, buffer: &[String], warnings: &mut Vec<String>) {
    let text = join_trimmed(buffer);
    match section {
        Section::Synopsis => help.synopsis = text,
        Section::Description => help.description = text,
        Section::Parameter(name) => {
            if help
                .parameters
                .iter()
                .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
            {
                warnings.push(format!("Duplicate .PARAMETER entry for '{}'", name));
            } else {
                help.parameters.push((name.clone(), text));
            }
        }
        Section::Example => {
            if !text.is_empty() {
                help.examples.push(text);
            }
        }
        Section::Notes => {
            for line in buffer {
                if let Some(caps) = TAGS_LINE.captures(line) {
                    help.tags.extend(
                        caps[1]
                            .split(',')
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(str::to_string),
                    );
                }
            }
            help.notes = text;
        }
        Section::Ignored => {}
    }
}

/// Join lines with newlines, dropping leading and trailing blank lines
fn join_trimmed(lines: &[String]) -> String {
    let start = lines.iter().position(|l| !l.is_empty());
    let end = lines.iter().rposition(|l| !l.is_empty());
    match (start, end) {
        (Some(s), Some(e)) => lines[s..=e].join("\n"),
        _ => String::new(),
    }
}

/// Blank out every `<# ... #>` block, keeping newlines so line numbers survive
pub(crate) fn strip_block_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("<#") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let (body, next) = match after.find("#>") {
            Some(end) => (&after[..end], &after[end + 2..]),
            None => (after, ""),
        };
        out.extend(body.chars().filter(|c| *c == '\n'));
        rest = next;
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_comment_help() {
        let content = "# .SYNOPSIS\n# Cleans temp folders\n# .PARAMETER Days\n# Age in days\nparam([int]$Days = 7)\n";
        let mut warnings = Vec::new();
        let help = extract_help(content, &mut warnings);
        assert_eq!(help.synopsis, "Cleans temp folders");
        assert_eq!(
            help.parameters,
            vec![("Days".to_string(), "Age in days".to_string())]
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_block_without_keywords_is_skipped() {
        let content = "<# just a comment #>\n<#\n.SYNOPSIS\nSecond block\n#>\n";
        let mut warnings = Vec::new();
        let help = extract_help(content, &mut warnings);
        assert_eq!(help.synopsis, "Second block");
    }

    #[test]
    fn test_unknown_dot_lines_stay_in_section() {
        let content = "<#\n.EXAMPLE\n.\\Run.ps1\n.Custom value\n#>";
        let mut warnings = Vec::new();
        let help = extract_help(content, &mut warnings);
        assert_eq!(help.examples, vec![".\\Run.ps1\n.Custom value"]);
    }

    #[test]
    fn test_duplicate_parameter_warns() {
        let content = "<#\n.PARAMETER Name\nfirst\n.PARAMETER name\nsecond\n#>";
        let mut warnings = Vec::new();
        let help = extract_help(content, &mut warnings);
        assert_eq!(help.parameters.len(), 1);
        assert_eq!(help.parameters[0].1, "first");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_strip_block_comments_keeps_line_count() {
        let content = "a\n<# one\ntwo #>b\nc";
        let stripped = strip_block_comments(content);
        assert_eq!(stripped, "a\n\nb\nc");
        assert_eq!(stripped.lines().count(), content.lines().count());
    }
}
