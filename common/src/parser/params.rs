// param(...) block scanning

use super::help::strip_block_comments;
use super::ScriptParameter;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PARAM_KEYWORD: Regex = Regex::new(r"(?i)\bparam\s*\(").expect("valid param regex");
    static ref VARIABLE: Regex = Regex::new(r"^\$([A-Za-z_][A-Za-z0-9_]*)").expect("valid variable regex");
    static ref MANDATORY: Regex =
        Regex::new(r"(?i)\bMandatory\b(?:\s*=\s*(\$\w+|\d+))?").expect("valid mandatory regex");
}

/// What a single character is, once strings and `#` comments are accounted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharKind {
    Code,
    Quoted,
    Comment,
}

/// Minimal lexer state: quoting and line comments
#[derive(Default)]
struct Lexer {
    quote: Option<char>,
    escaped: bool,
    comment: bool,
}

impl Lexer {
    fn classify(&mut self, c: char) -> CharKind {
        if self.comment {
            if c == '\n' {
                self.comment = false;
                return CharKind::Code;
            }
            return CharKind::Comment;
        }
        if let Some(q) = self.quote {
            if self.escaped {
                self.escaped = false;
            } else if c == '`' && q == '"' {
                self.escaped = true;
            } else if c == q {
                self.quote = None;
            }
            return CharKind::Quoted;
        }
        match c {
            '\'' | '"' => {
                self.quote = Some(c);
                CharKind::Quoted
            }
            '#' => {
                self.comment = true;
                CharKind::Comment
            }
            _ => CharKind::Code,
        }
    }
}

/// Parameters declared in the script-level `param(...)` block, without descriptions
pub fn extract_param_block(content: &str, warnings: &mut Vec<String>) -> Vec<ScriptParameter> {
    let code = strip_block_comments(content);

    let Some(open) = find_param_keyword(&code) else {
        return Vec::new();
    };

    let (body, balanced) = scan_body(&code[open..]);
    if !balanced {
        warnings.push("Unbalanced param( block: missing closing parenthesis".to_string());
    }

    let mut parameters = Vec::new();
    for segment in split_top_level(&body) {
        if segment.trim().is_empty() {
            continue;
        }
        match parse_declaration(&segment) {
            Some(parameter) => parameters.push(parameter),
            None => warnings.push(format!(
                "Unrecognized parameter declaration: {}",
                segment.trim()
            )),
        }
    }
    parameters
}

/// Byte offset just past the `(` of the first `param(` that is not commented out
fn find_param_keyword(code: &str) -> Option<usize> {
    PARAM_KEYWORD.find_iter(code).find_map(|m| {
        let line_start = code[..m.start()].rfind('\n').map(|i| i + 1).unwrap_or(0);
        if code[line_start..m.start()].contains('#') {
            None
        } else {
            Some(m.end())
        }
    })
}

/// Collect text up to the parenthesis closing the block, and whether it was found
fn scan_body(text: &str) -> (String, bool) {
    let mut lexer = Lexer::default();
    let mut depth = 1usize;
    for (idx, c) in text.char_indices() {
        if lexer.classify(c) != CharKind::Code {
            continue;
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return (text[..idx].to_string(), true);
                }
            }
            _ => {}
        }
    }
    (text.to_string(), false)
}

/// Split on commas outside brackets and strings, dropping comments
fn split_top_level(body: &str) -> Vec<String> {
    let mut lexer = Lexer::default();
    let mut depth = 0usize;
    let mut segments = Vec::new();
    let mut current = String::new();

    for c in body.chars() {
        match lexer.classify(c) {
            CharKind::Comment => continue,
            CharKind::Quoted => current.push(c),
            CharKind::Code => match c {
                '(' | '[' | '{' => {
                    depth += 1;
                    current.push(c);
                }
                ')' | ']' | '}' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                ',' if depth == 0 => segments.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }
    segments.push(current);
    segments
}

/// Index of the `]` closing the group that `text` starts with
fn group_end(text: &str) -> Option<usize> {
    let mut lexer = Lexer::default();
    let mut depth = 0usize;
    for (idx, c) in text.char_indices() {
        if lexer.classify(c) != CharKind::Code {
            continue;
        }
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// `[Parameter(...)] [type] $Name = default`
fn parse_declaration(segment: &str) -> Option<ScriptParameter> {
    let mut rest = segment.trim_start();
    let mut type_name = None;
    let mut mandatory = false;

    while rest.starts_with('[') {
        let end = group_end(rest)?;
        let inner = rest[1..end].trim();
        if inner.contains('(') {
            mandatory |= is_mandatory(inner);
        } else if !inner.is_empty() {
            type_name = Some(inner.to_string());
        }
        rest = rest[end + 1..].trim_start();
    }

    let caps = VARIABLE.captures(rest)?;
    let name = caps[1].to_string();
    let after = rest[caps.get(0)?.end()..].trim_start();
    let default_value = after
        .strip_prefix('=')
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    Some(ScriptParameter {
        name,
        description: String::new(),
        type_name,
        mandatory,
        default_value,
    })
}

fn is_mandatory(attribute: &str) -> bool {
    match MANDATORY.captures(attribute) {
        Some(caps) => match caps.get(1) {
            Some(value) => !matches!(value.as_str().to_ascii_lowercase().as_str(), "$false" | "0"),
            None => true,
        },
        None => false,
    }
}

/// Merge declared parameters with help descriptions.
///
/// Declaration order wins; parameters documented in help but never declared
/// are appended with only a description.
pub fn merge_parameters(
    declared: Vec<ScriptParameter>,
    help: &[(String, String)],
) -> Vec<ScriptParameter> {
    let mut merged: Vec<ScriptParameter> = declared
        .into_iter()
        .map(|mut parameter| {
            if let Some((_, description)) = help
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&parameter.name))
            {
                parameter.description = description.clone();
            }
            parameter
        })
        .collect();

    for (name, description) in help {
        if !merged.iter().any(|p| p.name.eq_ignore_ascii_case(name)) {
            merged.push(ScriptParameter {
                name: name.clone(),
                description: description.clone(),
                type_name: None,
                mandatory: false,
                default_value: None,
            });
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> (Vec<ScriptParameter>, Vec<String>) {
        let mut warnings = Vec::new();
        let params = extract_param_block(content, &mut warnings);
        (params, warnings)
    }

    #[test]
    fn test_types_defaults_and_mandatory() {
        let (params, warnings) = parse(
            "[CmdletBinding()]\nparam(\n  [Parameter(Mandatory)][string[]]$Names,\n  [int]$Count = 3,\n  [Parameter(Mandatory = $false)]$Label = 'a, b'\n)\n",
        );
        assert!(warnings.is_empty());
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].name, "Names");
        assert_eq!(params[0].type_name.as_deref(), Some("string[]"));
        assert!(params[0].mandatory);
        assert_eq!(params[1].default_value.as_deref(), Some("3"));
        assert!(!params[1].mandatory);
        assert_eq!(params[2].default_value.as_deref(), Some("'a, b'"));
        assert!(!params[2].mandatory);
        assert!(params[2].type_name.is_none());
    }

    #[test]
    fn test_attribute_with_brackets_in_string() {
        let (params, _) = parse("param([ValidatePattern('^[a-z]+$')][string]$Slug)");
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "Slug");
        assert_eq!(params[0].type_name.as_deref(), Some("string"));
    }

    #[test]
    fn test_comments_inside_block_are_ignored() {
        let (params, _) = parse("param(\n  # the target, required\n  [string]$Target # trailing (note\n)");
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "Target");
    }

    #[test]
    fn test_commented_out_param_is_skipped() {
        let (params, _) = parse("# param([string]$Old)\nparam([string]$New)");
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "New");
    }

    #[test]
    fn test_unbalanced_block_warns() {
        let (params, warnings) = parse("param([string]$Name\nWrite-Output $Name");
        assert_eq!(warnings.len(), 1);
        assert_eq!(params[0].name, "Name");
    }

    #[test]
    fn test_no_block() {
        let (params, warnings) = parse("Write-Output 'no params'");
        assert!(params.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_merge_appends_help_only_parameters() {
        let declared = vec![ScriptParameter {
            name: "Path".to_string(),
            description: String::new(),
            type_name: Some("string".to_string()),
            mandatory: true,
            default_value: None,
        }];
        let help = vec![
            ("Legacy".to_string(), "Old switch".to_string()),
            ("path".to_string(), "Where to look".to_string()),
        ];
        let merged = merge_parameters(declared, &help);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].description, "Where to look");
        assert_eq!(merged[1].name, "Legacy");
        assert!(merged[1].type_name.is_none());
    }
}
