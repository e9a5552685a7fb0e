/// Compiler options
/// Deserialized project configuration, including the sets of type names
/// the companion runtime claims for itself
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub type TypeNameSet = HashSet<String>;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct CompilerOptions {
    /// Attach sequence-point locations to emitted instructions.
    #[serde(default)]
    pub is_debug: bool,
    /// Print `#line` directives in the generated translation unit.
    #[serde(default)]
    pub emit_line_directives: bool,
    /// Types the companion runtime provides under their bare class names.
    #[serde(default)]
    pub targeted_runtime_provided_types: TypeNameSet,
    /// Core types every program needs; always treated as runtime-provided.
    #[serde(default)]
    pub core_runtime_types: TypeNameSet,
}

impl CompilerOptions {
    // The surface the shipped runtime declares.
    pub fn with_default_runtime_types() -> Self {
        let core = [
            "System.Object",
            "System.String",
            "System.Array",
            "System.Exception",
            "System.Type",
            "System.ValueType",
            "System.Enum",
            "System.Delegate",
            "System.MulticastDelegate",
        ];
        Self {
            core_runtime_types: core.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Loads `cilcc.json` from the project directory when present,
    /// falling back to defaults.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join("cilcc.json");
        if !path.exists() {
            return Ok(Self::with_default_runtime_types());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let mut options: Self =
            serde_json::from_str(&text).context("malformed cilcc.json")?;
        let defaults = Self::with_default_runtime_types();
        options.core_runtime_types.extend(defaults.core_runtime_types);
        Ok(options)
    }

    pub fn is_runtime_provided(&self, il_name: &str) -> bool {
        self.core_runtime_types.contains(il_name)
            || self.targeted_runtime_provided_types.contains(il_name)
    }

    pub fn runtime_provided_types(&self) -> impl Iterator<Item = &String> {
        self.core_runtime_types
            .iter()
            .chain(self.targeted_runtime_provided_types.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_core_types() {
        let options = CompilerOptions::with_default_runtime_types();
        assert!(options.is_runtime_provided("System.Object"));
        assert!(options.is_runtime_provided("System.String"));
        assert!(!options.is_runtime_provided("App.Widget"));
        assert!(!options.is_debug);
    }

    #[test]
    fn targeted_types_extend_the_core_set() {
        let mut options = CompilerOptions::with_default_runtime_types();
        options
            .targeted_runtime_provided_types
            .insert("System.Text.StringBuilder".into());
        assert!(options.is_runtime_provided("System.Text.StringBuilder"));
        assert!(options.is_runtime_provided("System.Object"));
    }

    #[test]
    fn config_files_merge_with_the_core_set() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("cilcc.json"),
            r#"{"is_debug": true, "targeted_runtime_provided_types": ["System.Text.StringBuilder"]}"#,
        )
        .unwrap();
        let options = CompilerOptions::load(dir.path()).unwrap();
        assert!(options.is_debug);
        assert!(options.is_runtime_provided("System.Text.StringBuilder"));
        assert!(options.is_runtime_provided("System.Object"));
    }
}
