// Static security screening
//
// A fixed deny-list of constructs, matched line by line. Comments are scanned
// as well: a commented-out `Invoke-Expression` still flags the script.

use crate::models::RiskLevel;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_EXCERPT_CHARS: usize = 120;

/// RiskCategory groups the high-risk constructs the screener recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    DynamicEvaluation,
    DestructiveFilesystem,
    ElevatedProcess,
    SafetyBypass,
}

impl fmt::Display for RiskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskCategory::DynamicEvaluation => "dynamic_evaluation",
            RiskCategory::DestructiveFilesystem => "destructive_filesystem",
            RiskCategory::ElevatedProcess => "elevated_process",
            RiskCategory::SafetyBypass => "safety_bypass",
        };
        write!(f, "{}", s)
    }
}

/// One rule match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub rule_id: String,
    pub category: RiskCategory,
    pub description: String,
    /// 1-based line of the first physical line of the match
    pub line: usize,
    pub excerpt: String,
}

/// Result of screening one script
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAssessment {
    pub risk_level: RiskLevel,
    pub requires_elevation: bool,
    pub findings: Vec<SecurityFinding>,
}

impl SecurityAssessment {
    /// Distinct categories that matched, sorted
    pub fn categories(&self) -> Vec<RiskCategory> {
        let mut categories: Vec<RiskCategory> = self.findings.iter().map(|f| f.category).collect();
        categories.sort();
        categories.dedup();
        categories
    }
}

struct SecurityRule {
    id: &'static str,
    category: RiskCategory,
    description: &'static str,
    /// Any of these triggers the rule...
    patterns: Vec<Regex>,
    /// ...provided every one of these also matches the same logical line
    also: Vec<Regex>,
}

impl SecurityRule {
    fn matches(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(line)) && self.also.iter().all(|p| p.is_match(line))
    }
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid security rule regex {}: {}", pattern, e))
}

lazy_static! {
    static ref RULES: Vec<SecurityRule> = builtin_rules();
}

fn builtin_rules() -> Vec<SecurityRule> {
    vec![
        // Dynamic code evaluation
        SecurityRule {
            id: "EVAL-001",
            category: RiskCategory::DynamicEvaluation,
            description: "Invoke-Expression evaluates arbitrary strings as code",
            patterns: vec![re(r"(?i)\bInvoke-Expression\b"), re(r"(?i)(?:^|[\s|;(])iex\b")],
            also: vec![],
        },
        SecurityRule {
            id: "EVAL-002",
            category: RiskCategory::DynamicEvaluation,
            description: "Script block compiled from a runtime string",
            patterns: vec![
                re(r"(?i)\[scriptblock\]::Create\s*\("),
                re(r"(?i)\$ExecutionContext\.InvokeCommand\b"),
            ],
            also: vec![],
        },
        SecurityRule {
            id: "EVAL-003",
            category: RiskCategory::DynamicEvaluation,
            description: "Inline source compiled with Add-Type",
            patterns: vec![re(r"(?i)\bAdd-Type\b")],
            also: vec![re(r"(?i)-(?:TypeDefinition|MemberDefinition)\b")],
        },
        SecurityRule {
            id: "EVAL-004",
            category: RiskCategory::DynamicEvaluation,
            description: "Encoded command passed to a new shell",
            patterns: vec![re(r"(?i)-(?:EncodedCommand|enc|ec)\s+[A-Za-z0-9+/=]{8,}")],
            also: vec![],
        },
        // Destructive filesystem operations
        SecurityRule {
            id: "FS-001",
            category: RiskCategory::DestructiveFilesystem,
            description: "Recursive or forced deletion",
            patterns: vec![re(r"(?i)(?:^|[\s|;(])(?:Remove-Item|rm|del|ri|rd|rmdir|erase)\s")],
            // Any unambiguous prefix of -Recurse or -Force
            also: vec![re(r"(?i)\s-(?:r\w*|fo\w*)\b")],
        },
        SecurityRule {
            id: "FS-002",
            category: RiskCategory::DestructiveFilesystem,
            description: "Unix-style recursive forced deletion",
            patterns: vec![re(r"(?i)\brm\s+-(?:rf|fr)\b")],
            also: vec![],
        },
        SecurityRule {
            id: "FS-004",
            category: RiskCategory::DestructiveFilesystem,
            description: "Deletion through the .NET filesystem API",
            patterns: vec![
                re(r"(?i)\[(?:System\.)?IO\.(?:Directory|File)\]::Delete\s*\("),
                re(r"(?i)\.Delete\s*\(\s*\$true\s*\)"),
            ],
            also: vec![],
        },
        SecurityRule {
            id: "FS-003",
            category: RiskCategory::DestructiveFilesystem,
            description: "Disk or volume wipe",
            patterns: vec![
                re(r"(?i)\b(?:Format-Volume|Clear-Disk|Initialize-Disk|Remove-Partition)\b"),
                re(r"(?i)\bformat(?:\.com)?\s+[a-z]:"),
            ],
            also: vec![],
        },
        // Elevated process spawning
        SecurityRule {
            id: "ELEV-001",
            category: RiskCategory::ElevatedProcess,
            description: "Process started with the RunAs verb",
            patterns: vec![re(r"(?i)\b(?:Start-Process|saps|start)\b")],
            also: vec![re(r"(?i)-Verb\s+['\x22]?RunAs\b")],
        },
        SecurityRule {
            id: "ELEV-002",
            category: RiskCategory::ElevatedProcess,
            description: "Explicit elevation through runas or sudo",
            patterns: vec![re(r"(?i)\brunas(?:\.exe)?\s+/"), re(r"(?i)(?:^|[\s|;(])sudo\s")],
            also: vec![],
        },
        SecurityRule {
            id: "ELEV-003",
            category: RiskCategory::ElevatedProcess,
            description: "Script demands administrator rights",
            patterns: vec![re(r"(?i)#requires\s.*-RunAsAdministrator\b")],
            also: vec![],
        },
        // Disabling safety checks
        SecurityRule {
            id: "SAFE-001",
            category: RiskCategory::SafetyBypass,
            description: "Execution policy bypass",
            patterns: vec![
                re(r"(?i)\bSet-ExecutionPolicy\b.*\b(?:Bypass|Unrestricted)\b"),
                re(r"(?i)-ExecutionPolicy\s+['\x22]?(?:Bypass|Unrestricted)\b"),
            ],
            also: vec![],
        },
        SecurityRule {
            id: "SAFE-002",
            category: RiskCategory::SafetyBypass,
            description: "Antivirus protection disabled",
            patterns: vec![re(r"(?i)\bSet-MpPreference\b.*-Disable\w+")],
            also: vec![],
        },
        SecurityRule {
            id: "SAFE-003",
            category: RiskCategory::SafetyBypass,
            description: "TLS certificate validation disabled",
            patterns: vec![
                re(r"(?i)ServerCertificateValidationCallback\b"),
                re(r"(?i)-SkipCertificateCheck\b"),
            ],
            also: vec![],
        },
        SecurityRule {
            id: "SAFE-004",
            category: RiskCategory::SafetyBypass,
            description: "Host firewall disabled",
            patterns: vec![
                re(r"(?i)\bSet-NetFirewallProfile\b.*-Enabled\s+['\x22]?(?:False|\$false|0)\b"),
                re(r"(?i)\bnetsh\s+(?:adv)?firewall\s+set\s+\w*\s*state\s+off\b"),
            ],
            also: vec![],
        },
        SecurityRule {
            id: "SAFE-005",
            category: RiskCategory::SafetyBypass,
            description: "Language mode changed at runtime",
            patterns: vec![re(r"(?i)\$ExecutionContext\.SessionState\.LanguageMode\s*=")],
            also: vec![],
        },
    ]
}

/// Join backtick-continued physical lines into logical lines, keeping the
/// 1-based number of the first physical line
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut start = 0usize;

    for (idx, raw) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        let trimmed = raw.trim_end();
        match trimmed.strip_suffix('`') {
            Some(head) => {
                current.push_str(head);
                current.push(' ');
            }
            None => {
                current.push_str(trimmed);
                lines.push((start, std::mem::take(&mut current)));
            }
        }
    }
    if !current.is_empty() {
        lines.push((start, current));
    }
    lines
}

fn excerpt(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.chars().count() <= MAX_EXCERPT_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().take(MAX_EXCERPT_CHARS).collect()
    }
}

/// Screen script text. Any finding makes the script high risk and
/// flags it as requiring elevation.
pub fn assess(content: &str) -> SecurityAssessment {
    let mut findings = Vec::new();

    for (line_no, line) in logical_lines(content) {
        for rule in RULES.iter() {
            if rule.matches(&line) {
                findings.push(SecurityFinding {
                    rule_id: rule.id.to_string(),
                    category: rule.category,
                    description: rule.description.to_string(),
                    line: line_no,
                    excerpt: excerpt(&line),
                });
            }
        }
    }

    let high = !findings.is_empty();
    SecurityAssessment {
        risk_level: if high { RiskLevel::High } else { RiskLevel::Low },
        requires_elevation: high,
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_ids(content: &str) -> Vec<String> {
        assess(content).findings.into_iter().map(|f| f.rule_id).collect()
    }

    #[test]
    fn test_each_category_is_detected() {
        assert_eq!(rule_ids("Invoke-Expression $cmd"), vec!["EVAL-001"]);
        assert_eq!(rule_ids("$x | iex"), vec!["EVAL-001"]);
        assert_eq!(rule_ids("Remove-Item C:\\data -Recurse -Force"), vec!["FS-001"]);
        assert_eq!(
            rule_ids("Start-Process pwsh -Verb RunAs -ArgumentList '-File x.ps1'"),
            vec!["ELEV-001"]
        );
        assert_eq!(rule_ids("Set-ExecutionPolicy Bypass -Scope Process"), vec!["SAFE-001"]);
    }

    #[test]
    fn test_deletion_variants_are_high_risk() {
        for content in [
            "Remove-Item $tmp -Recurse",
            "Remove-Item -Path C:\\data -Recurse",
            "Remove-Item C:\\data -Recurse -Fo",
            "Remove-Item C:\\data -Rec -Force",
            "Get-ChildItem C:\\data | Remove-Item -Force",
            "rd C:\\build -r",
        ] {
            assert_eq!(rule_ids(content), vec!["FS-001"], "{}", content);
        }
        assert_eq!(
            rule_ids("[System.IO.Directory]::Delete('C:\\data', $true)"),
            vec!["FS-004"]
        );
        assert_eq!(rule_ids("[IO.File]::Delete($path)"), vec!["FS-004"]);
        assert_eq!(rule_ids("(Get-Item C:\\data).Delete($true)"), vec!["FS-004"]);
        assert_eq!(assess("Remove-Item $tmp -Recurse").risk_level, RiskLevel::High);
    }

    #[test]
    fn test_partial_match_is_not_a_finding() {
        assert!(rule_ids("Remove-Item $tmp").is_empty());
        assert!(rule_ids("Remove-Item $tmp -Filter *.log").is_empty());
        assert!(rule_ids("Start-Process notepad.exe").is_empty());
        assert!(rule_ids("Add-Type -AssemblyName System.Web").is_empty());
        assert!(rule_ids("Get-ChildItem -Filter *.iex").is_empty());
    }

    #[test]
    fn test_backtick_continuation_joins_lines() {
        let content = "Write-Output 'start'\nRemove-Item $path `\n    -Recurse `\n    -Force\n";
        let assessment = assess(content);
        assert_eq!(assessment.findings.len(), 1);
        assert_eq!(assessment.findings[0].line, 2);
        assert_eq!(assessment.risk_level, RiskLevel::High);
        assert!(assessment.requires_elevation);
    }

    #[test]
    fn test_comments_are_scanned() {
        let assessment = assess("# Invoke-Expression $legacy\nWrite-Output 'ok'");
        assert_eq!(assessment.categories(), vec![RiskCategory::DynamicEvaluation]);
    }

    #[test]
    fn test_excerpt_is_bounded() {
        let long = format!("Invoke-Expression '{}'", "a".repeat(500));
        let assessment = assess(&long);
        assert_eq!(assessment.findings[0].excerpt.chars().count(), MAX_EXCERPT_CHARS);
    }

    #[test]
    fn test_clean_script_is_low() {
        let assessment = assess("Get-Service | Where-Object Status -eq 'Running'\n");
        assert_eq!(assessment, SecurityAssessment::default());
    }
}
