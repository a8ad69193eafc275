use crate::classifier::ServerType;
use crate::configs::{Application, CommandStep};
use crate::error::PatchError;
use crate::process::ProcessContext;
use crate::template;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Stop,
    Start,
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlAction::Stop => "stop",
            ControlAction::Start => "start",
        })
    }
}

/// How one server type is stopped and started.
pub trait ServerControl: Send + Sync {
    /// Shell commands that perform `action` on `process`, in order.
    fn commands(
        &self,
        action: ControlAction,
        application: &Application,
        process: &ProcessContext,
    ) -> Result<Vec<String>, PatchError>;
}

pub fn for_server_type(server_type: ServerType) -> Result<Box<dyn ServerControl>, PatchError> {
    match server_type {
        ServerType::ApacheStyle | ServerType::Unknown => Ok(Box::new(ApacheControl)),
        ServerType::WebApp | ServerType::Backend => {
            Err(PatchError::UnsupportedServerType(server_type))
        }
    }
}

/// Control scripts living next to the server binary, e.g. `bin/apachectl stop`.
pub struct ApacheControl;

impl ApacheControl {
    fn default_step(action: ControlAction) -> CommandStep {
        CommandStep {
            command: format!("{{{{dir}}}}/{{{{control_script}}}} {action}"),
        }
    }
}

impl ServerControl for ApacheControl {
    fn commands(
        &self,
        action: ControlAction,
        application: &Application,
        process: &ProcessContext,
    ) -> Result<Vec<String>, PatchError> {
        let dir = process.directory().ok_or_else(|| {
            PatchError::Discovery(format!(
                "{} has no executable directory to find {} in",
                process.label(),
                application.control_script
            ))
        })?;
        let quote = |value: &str| shell_words::quote(value).into_owned();
        let values = HashMap::from([
            ("dir", quote(&dir.to_string_lossy())),
            ("exe", quote(&process.executable)),
            ("name", quote(&process.name)),
            ("pid", process.pid.to_string()),
            ("owner", quote(&process.owner)),
            ("filter", quote(&application.process_filter)),
            ("control_script", quote(&application.control_script)),
            ("launch_path", process.launch_path.clone()),
        ]);

        let configured = match action {
            ControlAction::Stop => &application.stop_steps,
            ControlAction::Start => &application.start_steps,
        };
        let default = [Self::default_step(action)];
        let steps = if configured.is_empty() {
            &default[..]
        } else {
            &configured[..]
        };

        steps
            .iter()
            .map(|step| {
                template::render(&step.command, &values).map_err(|err| {
                    PatchError::Config(format!("application `{}`: {err}", application.name))
                })
            })
            .collect()
    }
}
