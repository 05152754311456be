// #Requires and Import-Module declarations

use super::help::strip_block_comments;
use super::ScriptDependency;
use lazy_static::lazy_static;
use regex::Regex;
use std::cmp::Ordering;

lazy_static! {
    static ref REQUIRES_LINE: Regex =
        Regex::new(r"(?im)^[ \t]*#requires[ \t]+(.*)$").expect("valid requires regex");
    static ref MODULES_ARG: Regex =
        Regex::new(r"(?i)-Modules\b[ \t]*(.*)$").expect("valid modules regex");
    static ref NEXT_FLAG: Regex = Regex::new(
        r"(?i)\s+-(?:Version|RunAsAdministrator|PSEdition|ShellId|PSSnapin|Assembly)\b"
    )
    .expect("valid flag regex");
    static ref VERSION_ARG: Regex =
        Regex::new(r"(?i)-Version\b[ \t]*(\S*)").expect("valid version regex");
    static ref HASHTABLE_ENTRY: Regex = Regex::new(
        r#"(?i)\b(ModuleName|ModuleVersion|RequiredVersion)\s*=\s*['"]?([^'";}\s]+)['"]?"#
    )
    .expect("valid hashtable regex");
    static ref IMPORT_MODULE: Regex =
        Regex::new(r"(?im)^[ \t]*Import-Module[ \t]+([^\r\n]+)$").expect("valid import regex");
    static ref NUMERIC_VERSION: Regex =
        Regex::new(r"^\d+(?:\.\d+){0,3}$").expect("valid numeric version regex");
}

/// Flags of Import-Module that take a value
const VALUE_FLAGS: &[&str] = &[
    "name",
    "requiredversion",
    "minimumversion",
    "maximumversion",
    "prefix",
    "scope",
    "function",
    "cmdlet",
    "variable",
    "alias",
    "argumentlist",
    "pssession",
    "cimsession",
];

/// Deduplicated module dependencies in first-seen order
pub fn extract_dependencies(content: &str, warnings: &mut Vec<String>) -> Vec<ScriptDependency> {
    let code = strip_block_comments(content);
    let mut dependencies: Vec<ScriptDependency> = Vec::new();

    for caps in REQUIRES_LINE.captures_iter(&code) {
        let Some(modules) = MODULES_ARG.captures(&caps[1]) else {
            continue;
        };
        let mut list = modules[1].to_string();
        if let Some(m) = NEXT_FLAG.find(&list) {
            list.truncate(m.start());
        }
        if list.trim().is_empty() {
            warnings.push("#Requires -Modules without any module names".to_string());
            continue;
        }
        for item in split_module_list(&list) {
            match parse_module_item(&item) {
                Some(dep) => add_dependency(&mut dependencies, dep),
                None => warnings.push(format!("Unrecognized #Requires module entry: {}", item)),
            }
        }
    }

    for caps in IMPORT_MODULE.captures_iter(&code) {
        if let Some(dep) = parse_import_module(&caps[1]) {
            add_dependency(&mut dependencies, dep);
        }
    }

    dependencies
}

/// Case-insensitive dedupe; a versioned declaration wins over a bare one
fn add_dependency(dependencies: &mut Vec<ScriptDependency>, dep: ScriptDependency) {
    match dependencies
        .iter_mut()
        .find(|d| d.name.eq_ignore_ascii_case(&dep.name))
    {
        Some(existing) => {
            if existing.version.is_none() {
                existing.version = dep.version;
            }
        }
        None => dependencies.push(dep),
    }
}

/// Split `A, @{ ModuleName = 'B'; ModuleVersion = '1.0' }` at top-level commas
fn split_module_list(list: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in list.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    items.push(current);
    items
        .into_iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .collect()
}

fn parse_module_item(item: &str) -> Option<ScriptDependency> {
    if item.starts_with("@{") {
        let mut name = None;
        let mut version = None;
        for caps in HASHTABLE_ENTRY.captures_iter(item) {
            let value = caps[2].to_string();
            if caps[1].eq_ignore_ascii_case("ModuleName") {
                name = Some(value);
            } else if version.is_none() {
                version = Some(value);
            }
        }
        return name.map(|name| ScriptDependency { name, version });
    }

    let name = unquote(item);
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(ScriptDependency {
        name: name.to_string(),
        version: None,
    })
}

/// Arguments of one `Import-Module` line. Variables and file paths are not dependencies.
fn parse_import_module(args: &str) -> Option<ScriptDependency> {
    let args = args.split(['|', ';', '#']).next().unwrap_or_default();
    let mut tokens = args.split_whitespace().map(unquote);

    let mut name: Option<String> = None;
    let mut version: Option<String> = None;

    while let Some(token) = tokens.next() {
        if let Some(flag) = token.strip_prefix('-') {
            let flag = flag.to_ascii_lowercase();
            if !VALUE_FLAGS.contains(&flag.as_str()) {
                continue;
            }
            let value = tokens.next().map(str::to_string);
            match flag.as_str() {
                "name" => name = name.or(value),
                "requiredversion" | "minimumversion" => version = version.or(value),
                _ => {}
            }
        } else if name.is_none() {
            name = Some(token.to_string());
        }
    }

    let name = name?;
    if name.starts_with('$') || name.contains(['/', '\\']) || name.contains(',') {
        return None;
    }
    Some(ScriptDependency { name, version })
}

fn unquote(token: &str) -> &str {
    token.trim().trim_matches(|c| c == '\'' || c == '"')
}

/// Highest `#Requires -Version` declared, if any
pub fn extract_min_version(content: &str, warnings: &mut Vec<String>) -> Option<String> {
    let code = strip_block_comments(content);
    let mut best: Option<String> = None;

    for caps in REQUIRES_LINE.captures_iter(&code) {
        let Some(version) = VERSION_ARG.captures(&caps[1]) else {
            continue;
        };
        let value = version[1].to_string();
        if !NUMERIC_VERSION.is_match(&value) {
            warnings.push(format!("Unrecognized #Requires -Version value: '{}'", value));
            continue;
        }
        best = match best {
            Some(current) if compare_versions(&current, &value) != Ordering::Less => Some(current),
            _ => Some(value),
        };
    }
    best
}

/// Compare dotted numeric versions, treating missing components as zero
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };
    let (left, right) = (parse(a), parse(b));
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
