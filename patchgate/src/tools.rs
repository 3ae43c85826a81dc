//! Closed catalog of agent-facing tools and their typed arguments.
//!
//! Names outside [`ToolName`] never reach a handler. Arguments are checked against
//! the JSON schemas in `schemas/tools.json` first, then deserialized into the
//! matching typed struct.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const TOOLS_SCHEMA: &str = include_str!("../schemas/tools.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ReadFile,
    WriteFile,
    ListDir,
    ProposePatch,
    InitRustCrate,
    RunKani,
}

impl ToolName {
    pub const ALL: [ToolName; 6] = [
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::ListDir,
        ToolName::ProposePatch,
        ToolName::InitRustCrate,
        ToolName::RunKani,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::ListDir => "list_dir",
            ToolName::ProposePatch => "propose_patch",
            ToolName::InitRustCrate => "init_rust_crate",
            ToolName::RunKani => "run_kani",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListDirArgs {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProposePatchArgs {
    pub diff: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitRustCrateArgs {
    pub project_dir: String,
    #[serde(default)]
    pub crate_name: Option<String>,
    #[serde(default = "default_lib")]
    pub lib: bool,
}

fn default_lib() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunKaniArgs {
    pub project_dir: String,
    #[serde(default)]
    pub harness: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A tool call with typed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    ListDir(ListDirArgs),
    ProposePatch(ProposePatchArgs),
    InitRustCrate(InitRustCrateArgs),
    RunKani(RunKaniArgs),
}

impl ToolCall {
    pub fn from_value(name: ToolName, arguments: Value) -> Result<Self, serde_json::Error> {
        Ok(match name {
            ToolName::ReadFile => ToolCall::ReadFile(serde_json::from_value(arguments)?),
            ToolName::WriteFile => ToolCall::WriteFile(serde_json::from_value(arguments)?),
            ToolName::ListDir => ToolCall::ListDir(serde_json::from_value(arguments)?),
            ToolName::ProposePatch => ToolCall::ProposePatch(serde_json::from_value(arguments)?),
            ToolName::InitRustCrate => ToolCall::InitRustCrate(serde_json::from_value(arguments)?),
            ToolName::RunKani => ToolCall::RunKani(serde_json::from_value(arguments)?),
        })
    }
}

/// Catalog entry as handed to a conversation transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Tool specs plus compiled argument validators.
pub struct ToolCatalog {
    specs: Vec<ToolSpec>,
    validators: BTreeMap<ToolName, Validator>,
}

impl ToolCatalog {
    pub fn load() -> Result<Self> {
        #[derive(Deserialize)]
        struct Entry {
            description: String,
            parameters: Value,
        }

        let mut raw: BTreeMap<String, Entry> =
            serde_json::from_str(TOOLS_SCHEMA).context("parse tool schemas")?;
        let mut specs = Vec::with_capacity(ToolName::ALL.len());
        let mut validators = BTreeMap::new();
        for tool in ToolName::ALL {
            let entry = raw
                .remove(tool.as_str())
                .ok_or_else(|| anyhow!("tool schemas missing '{tool}'"))?;
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&entry.parameters)
                .with_context(|| format!("compile schema for '{tool}'"))?;
            validators.insert(tool, validator);
            specs.push(ToolSpec {
                name: tool.as_str().to_string(),
                description: entry.description,
                parameters: entry.parameters,
            });
        }
        if let Some(extra) = raw.keys().next() {
            return Err(anyhow!("tool schemas describe unknown tool '{extra}'"));
        }
        Ok(Self { specs, validators })
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    /// Check `arguments` against the tool's schema, collecting every violation.
    pub fn validate(&self, tool: ToolName, arguments: &Value) -> Result<(), String> {
        let Some(validator) = self.validators.get(&tool) else {
            return Err(format!("no schema for '{tool}'"));
        };
        let messages: Vec<String> = validator
            .iter_errors(arguments)
            .map(|err| err.to_string())
            .collect();
        if messages.is_empty() {
            Ok(())
        } else {
            Err(messages.join("; "))
        }
    }
}

/// Normalize a project directory argument: strip leading `./` and `/`, and a
/// leading `workspace/` that agents often add.
pub fn normalize_project_dir(raw: &str) -> String {
    let mut p = raw.trim();
    loop {
        let next = p.trim_start_matches("./").trim_start_matches('/');
        if next == p {
            break;
        }
        p = next;
    }
    let p = p.strip_prefix("workspace/").unwrap_or(p);
    let p = if p == "workspace" || p == "." { "" } else { p };
    p.trim_start_matches('/').trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_round_trip_and_unknown_names_are_none() {
        for tool in ToolName::ALL {
            assert_eq!(ToolName::parse(tool.as_str()), Some(tool));
        }
        assert_eq!(ToolName::parse("delete_everything"), None);
        assert_eq!(ToolName::parse("READ_FILE"), None);
    }

    #[test]
    fn catalog_covers_every_tool() {
        let catalog = ToolCatalog::load().expect("catalog");
        let names: Vec<&str> = catalog.specs().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "read_file",
                "write_file",
                "list_dir",
                "propose_patch",
                "init_rust_crate",
                "run_kani"
            ]
        );
    }

    #[test]
    fn schema_rejects_missing_wrong_and_extra_fields() {
        let catalog = ToolCatalog::load().expect("catalog");
        assert!(catalog.validate(ToolName::WriteFile, &json!({"path": "a.rs"})).is_err());
        assert!(catalog.validate(ToolName::ReadFile, &json!({"path": 3})).is_err());
        assert!(
            catalog
                .validate(ToolName::ReadFile, &json!({"path": "a.rs", "mode": "w"}))
                .is_err()
        );
        assert!(catalog.validate(ToolName::ListDir, &json!({})).is_ok());
        assert!(
            catalog
                .validate(ToolName::RunKani, &json!({"project_dir": "p", "args": ["--quiet"]}))
                .is_ok()
        );
    }

    #[test]
    fn typed_arguments_apply_defaults() {
        let call = ToolCall::from_value(ToolName::InitRustCrate, json!({"project_dir": "demo"}))
            .expect("args");
        assert_eq!(
            call,
            ToolCall::InitRustCrate(InitRustCrateArgs {
                project_dir: "demo".to_string(),
                crate_name: None,
                lib: true,
            })
        );
    }

    #[test]
    fn project_dir_normalization() {
        assert_eq!(normalize_project_dir("./demo"), "demo");
        assert_eq!(normalize_project_dir("/workspace/demo/"), "demo");
        assert_eq!(normalize_project_dir("workspace/nested/crate"), "nested/crate");
        assert_eq!(normalize_project_dir("."), "");
        assert_eq!(normalize_project_dir("../escape"), "../escape");
    }
}
