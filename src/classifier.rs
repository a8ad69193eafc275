use crate::error::PatchError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerType {
    WebApp,
    Backend,
    #[serde(alias = "apache")]
    ApacheStyle,
    Unknown,
}

impl ServerType {
    /// Order in which patterns are tried.
    pub const PRIORITY: [ServerType; 3] =
        [ServerType::WebApp, ServerType::Backend, ServerType::ApacheStyle];
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerType::WebApp => "web-app",
            ServerType::Backend => "backend",
            ServerType::ApacheStyle => "apache-style",
            ServerType::Unknown => "unknown",
        })
    }
}

pub fn is_valid_ip(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok()
}

#[derive(Debug)]
pub struct HostClassifier {
    patterns: Vec<(ServerType, Regex)>,
}

impl HostClassifier {
    pub fn new(patterns: &HashMap<ServerType, String>) -> Result<Self, PatchError> {
        if patterns.contains_key(&ServerType::Unknown) {
            return Err(PatchError::Config(
                "server-types cannot define a pattern for `unknown`".into(),
            ));
        }
        let mut compiled = Vec::with_capacity(patterns.len());
        for server_type in ServerType::PRIORITY {
            if let Some(pattern) = patterns.get(&server_type) {
                let regex = Regex::new(pattern).map_err(|err| {
                    PatchError::Config(format!("invalid pattern for {server_type}: {err}"))
                })?;
                compiled.push((server_type, regex));
            }
        }
        Ok(Self { patterns: compiled })
    }

    pub fn classify(&self, address: &str) -> ServerType {
        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(address))
            .map(|(server_type, _)| *server_type)
            .unwrap_or(ServerType::Unknown)
    }
}
