use serde::{Deserialize, Serialize};
use std::path::Path;

/// Raw attributes of one OS process. Attributes that could not be read are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: Option<String>,
    pub executable: Option<String>,
    pub cwd: Option<String>,
    pub cmdline: Option<Vec<String>>,
    pub owner: Option<String>,
}

/// A process selected for management.
///
/// The pid only means something on the host and at the time it was observed;
/// restored processes are matched on name and executable instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessContext {
    pub pid: u32,
    pub name: String,
    pub executable: String,
    pub launch_path: String,
    #[serde(default)]
    pub owner: String,
}

impl ProcessContext {
    pub fn same_process_as(&self, other: &ProcessContext) -> bool {
        self.name == other.name && self.executable == other.executable
    }

    /// Directory holding the executable, where control scripts live.
    pub fn directory(&self) -> Option<&Path> {
        Path::new(&self.executable)
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.executable)
    }
}

/// Processes discovered for one application, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApplicationProcesses {
    pub name: String,
    pub processes: Vec<ProcessContext>,
}
