use std::fmt;

/// How a host's run ended, short of a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    NothingToDo,
    Declined,
    Stopped,
    PartiallyStopped(Shortfall),
    Started,
    PartiallyStarted(Shortfall),
    Cancelled(Shortfall),
}

impl Outcome {
    /// Full success, as opposed to partial.
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            Outcome::NothingToDo | Outcome::Declined | Outcome::Stopped | Outcome::Started
        )
    }

    pub fn shortfall(&self) -> Option<&Shortfall> {
        match self {
            Outcome::PartiallyStopped(shortfall)
            | Outcome::PartiallyStarted(shortfall)
            | Outcome::Cancelled(shortfall) => Some(shortfall),
            _ => None,
        }
    }

    /// Human readable report, one line per item.
    pub fn report(&self) -> Vec<String> {
        let mut lines = vec![format!("Result: {self}")];
        if let Some(shortfall) = self.shortfall() {
            let still = match self {
                Outcome::PartiallyStarted(_) => "Not running",
                _ => "Still running",
            };
            lines.extend(
                shortfall
                    .unaccounted
                    .iter()
                    .map(|process| format!("{still}: {process}")),
            );
            lines.extend(
                shortfall
                    .failed
                    .iter()
                    .map(|failure| format!("Failed: {} ({})", failure.command, failure.reason)),
            );
            lines.extend(
                shortfall
                    .unhealthy
                    .iter()
                    .map(|app| format!("Unhealthy: {app}")),
            );
        }
        lines
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::NothingToDo => "nothing to do",
            Outcome::Declined => "declined",
            Outcome::Stopped => "stopped",
            Outcome::PartiallyStopped(_) => "partially stopped",
            Outcome::Started => "started",
            Outcome::PartiallyStarted(_) => "partially started",
            Outcome::Cancelled(_) => "cancelled",
        })
    }
}

/// Everything that keeps a run from being a full success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shortfall {
    pub failed: Vec<CommandFailure>,
    /// Processes still running after a stop, or missing after a start.
    pub unaccounted: Vec<String>,
    /// Applications whose health check never passed.
    pub unhealthy: Vec<String>,
}

impl Shortfall {
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.unaccounted.is_empty() && self.unhealthy.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub command: String,
    pub reason: String,
}
