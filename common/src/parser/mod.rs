// Script metadata extraction and static security screening
//
// Everything in this module is pure: it never touches the network, the
// catalog or the filesystem, and it never fails. Problems with the input are
// reported as warnings next to whatever metadata could still be recovered.

pub mod help;
pub mod params;
pub mod requires;
pub mod security;

use crate::models::RiskLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{instrument, warn};

pub use requires::compare_versions;
pub use security::{RiskCategory, SecurityAssessment, SecurityFinding};

/// A declared script parameter, merged from the help block and `param(...)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptParameter {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// A module the script needs at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Everything the parser could learn about one script
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    /// Derived from the file name
    pub name: String,
    pub synopsis: String,
    pub description: String,
    pub parameters: Vec<ScriptParameter>,
    pub examples: Vec<String>,
    pub notes: String,
    pub tags: Vec<String>,
    pub dependencies: Vec<ScriptDependency>,
    /// `None` means the script declares no minimum runtime version
    pub min_runtime_version: Option<String>,
    pub security: SecurityAssessment,
    pub warnings: Vec<String>,
}

impl ScriptMetadata {
    /// Best one-line summary for catalog listings
    pub fn summary(&self) -> Option<String> {
        if !self.synopsis.is_empty() {
            Some(self.synopsis.clone())
        } else if !self.description.is_empty() {
            self.description.lines().next().map(str::to_string)
        } else {
            None
        }
    }

    pub fn is_high_risk(&self) -> bool {
        self.security.risk_level == RiskLevel::High
    }
}

/// ScriptParser recognizes which files are scripts and parses them
#[derive(Debug, Clone)]
pub struct ScriptParser {
    extensions: Vec<String>,
}

impl Default for ScriptParser {
    fn default() -> Self {
        Self::new(["ps1", "psm1", "psd1"])
    }
}

impl ScriptParser {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Whether a repository path has one of the configured script extensions
    pub fn is_script_path(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    pub fn parse(&self, content: &str, filename: &str) -> ScriptMetadata {
        parse_script(content, filename)
    }
}

/// Parse script text into metadata plus a security assessment.
///
/// Never fails: malformed sections are skipped, logged, and listed in
/// [`ScriptMetadata::warnings`].
#[instrument(skip(content), fields(content_len = content.len()))]
pub fn parse_script(content: &str, filename: &str) -> ScriptMetadata {
    let mut warnings = Vec::new();

    let help = help::extract_help(content, &mut warnings);
    let declared = params::extract_param_block(content, &mut warnings);
    let parameters = params::merge_parameters(declared, &help.parameters);
    let dependencies = requires::extract_dependencies(content, &mut warnings);
    let min_runtime_version = requires::extract_min_version(content, &mut warnings);
    let security = security::assess(content);

    for warning in &warnings {
        warn!(filename = %filename, warning = %warning, "Script parsed with warnings");
    }

    ScriptMetadata {
        name: script_name(filename),
        synopsis: help.synopsis,
        description: help.description,
        parameters,
        examples: help.examples,
        tags: help.tags,
        notes: help.notes,
        dependencies,
        min_runtime_version,
        security,
        warnings,
    }
}

/// File stem of the last path segment, or the whole name if it has none
fn script_name(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(filename)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = r#"#Requires -Version 7.2
#Requires -Modules Az.Accounts, @{ ModuleName = 'Az.Storage'; ModuleVersion = '5.1.0' }

<#
.SYNOPSIS
Rotates storage account keys.

.DESCRIPTION
Regenerates the secondary key of every storage account
in the given resource group.

.PARAMETER ResourceGroup
Resource group that holds the storage accounts.

.PARAMETER DryRun
Only print what would change.

.EXAMPLE
./Rotate-Keys.ps1 -ResourceGroup prod-rg

.NOTES
Tags: storage, security
#>
param(
    [Parameter(Mandatory = $true)]
    [string]$ResourceGroup,

    [switch]$DryRun
)

Import-Module Az.Accounts
Get-AzStorageAccount -ResourceGroupName $ResourceGroup
"#;

    #[test]
    fn test_well_formed_header_is_extracted_exactly() {
        let metadata = parse_script(WELL_FORMED, "scripts/Rotate-Keys.ps1");

        assert_eq!(metadata.name, "Rotate-Keys");
        assert_eq!(metadata.synopsis, "Rotates storage account keys.");
        assert_eq!(
            metadata.description,
            "Regenerates the secondary key of every storage account\nin the given resource group."
        );
        assert_eq!(metadata.parameters.len(), 2);

        let rg = &metadata.parameters[0];
        assert_eq!(rg.name, "ResourceGroup");
        assert_eq!(rg.description, "Resource group that holds the storage accounts.");
        assert_eq!(rg.type_name.as_deref(), Some("string"));
        assert!(rg.mandatory);

        let dry_run = &metadata.parameters[1];
        assert_eq!(dry_run.name, "DryRun");
        assert_eq!(dry_run.type_name.as_deref(), Some("switch"));
        assert!(!dry_run.mandatory);

        assert_eq!(metadata.examples, vec!["./Rotate-Keys.ps1 -ResourceGroup prod-rg"]);
        assert_eq!(metadata.tags, vec!["storage", "security"]);
        assert_eq!(metadata.min_runtime_version.as_deref(), Some("7.2"));
        assert_eq!(
            metadata.dependencies,
            vec![
                ScriptDependency {
                    name: "Az.Accounts".to_string(),
                    version: None
                },
                ScriptDependency {
                    name: "Az.Storage".to_string(),
                    version: Some("5.1.0".to_string())
                },
            ]
        );
        assert_eq!(metadata.security.risk_level, RiskLevel::Low);
        assert!(metadata.warnings.is_empty());
    }

    #[test]
    fn test_absent_header_yields_empty_fields() {
        let metadata = parse_script("Get-Process | Select-Object -First 5\n", "top.ps1");
        assert!(metadata.synopsis.is_empty());
        assert!(metadata.description.is_empty());
        assert!(metadata.parameters.is_empty());
        assert!(metadata.dependencies.is_empty());
        assert!(metadata.min_runtime_version.is_none());
        assert!(metadata.summary().is_none());
        assert!(metadata.warnings.is_empty());
    }

    #[test]
    fn test_malformed_header_is_best_effort() {
        let content = "<#\n.SYNOPSIS\nHalf a header\n.PARAMETER\nno name\nparam([string]$Name\n";
        let metadata = parse_script(content, "broken.ps1");
        assert_eq!(metadata.synopsis, "Half a header");
        assert!(!metadata.warnings.is_empty());
    }

    #[test]
    fn test_empty_input() {
        let metadata = parse_script("", "empty.ps1");
        assert_eq!(metadata.name, "empty");
        assert!(metadata.synopsis.is_empty());
        assert_eq!(metadata.security.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_is_script_path() {
        let parser = ScriptParser::default();
        assert!(parser.is_script_path("deploy/Install.ps1"));
        assert!(parser.is_script_path("Modules/Tools.PSM1"));
        assert!(!parser.is_script_path("README.md"));
        assert!(!parser.is_script_path("ps1"));

        let custom = ScriptParser::new([".sh"]);
        assert!(custom.is_script_path("bin/run.sh"));
        assert!(!custom.is_script_path("bin/run.ps1"));
    }
}
