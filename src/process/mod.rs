mod inventory;
mod launch;
mod types;

pub use self::inventory::{LocalInventory, ProcessInventory, RemoteInventory};
pub use self::launch::{render_launch_command, resolve_launch_path};
pub use self::types::*;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, Users};
use tracing::{debug, instrument};

/// Pid of init. Only its direct children are managed.
const INIT_PID: u32 = 1;

/// A readable process table.
pub trait ProcessSource: Send + Sync {
    fn processes(&self) -> Vec<ProcessRecord>;
}

/// The process table of this machine.
pub struct SystemProcesses;

impl ProcessSource for SystemProcesses {
    #[instrument(skip(self))]
    fn processes(&self) -> Vec<ProcessRecord> {
        let mut system = System::new();
        // Threads report their thread group leader as parent, so the threads
        // of init would otherwise pass as its children.
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything().without_tasks(),
        );
        let users = Users::new_with_refreshed_list();

        let mut records: Vec<ProcessRecord> = system
            .processes()
            .iter()
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| ProcessRecord {
                pid: pid.as_u32(),
                parent: process.parent().map(|parent| parent.as_u32()),
                name: Some(process.name().to_string_lossy().into_owned()),
                executable: process.exe().map(|exe| exe.to_string_lossy().into_owned()),
                cwd: process.cwd().map(|cwd| cwd.to_string_lossy().into_owned()),
                cmdline: Some(
                    process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect(),
                ),
                owner: process
                    .user_id()
                    .and_then(|uid| users.get_user_by_id(uid))
                    .map(|user| user.name().to_string()),
            })
            .collect();
        records.sort_by_key(|record| record.pid);
        debug!("Read {} processes", records.len());
        records
    }
}

/// Whether `filter` occurs in the name, executable, working directory or command line.
///
/// A record missing any of those attributes never matches.
pub fn matches_filter(record: &ProcessRecord, filter: &str) -> bool {
    let (Some(name), Some(executable), Some(cwd), Some(cmdline)) = (
        &record.name,
        &record.executable,
        &record.cwd,
        &record.cmdline,
    ) else {
        return false;
    };
    name.contains(filter)
        || executable.contains(filter)
        || cwd.contains(filter)
        || cmdline.join(" ").contains(filter)
}

/// Children of init matching `filter`, in the order given.
pub fn find_processes<'a>(records: &'a [ProcessRecord], filter: &str) -> Vec<&'a ProcessRecord> {
    records
        .iter()
        .filter(|record| record.parent == Some(INIT_PID))
        .filter(|record| matches_filter(record, filter))
        .collect()
}
