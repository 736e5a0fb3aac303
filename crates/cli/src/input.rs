use std::io::Read;

use anyhow::{Context, Result};
use keel_core::Component;
use serde::Deserialize;

/// A components document: YAML or JSON, read from a file or `-` for stdin.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentsFile {
    /// Module the components came from; defaults to the release name.
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub components: Vec<Component>,
}

pub fn parse(text: &str) -> Result<ComponentsFile> {
    serde_yaml::from_str(text).context("parsing components document")
}

pub fn load(path: &str) -> Result<ComponentsFile> {
    let text = if path == "-" {
        let mut s = String::new();
        std::io::stdin().read_to_string(&mut s).context("reading components from stdin")?;
        s
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?
    };
    parse(&text).with_context(|| format!("in {}", path))
}
