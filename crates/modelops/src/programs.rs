use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::store::{io_err, Result};
use crate::{training_process_name, ModelName, Slot};

/// Bump when the generated layout changes; a new version gets a new file
/// name, so existing models are regenerated on their next reconcile.
pub const PROGRAMS_VERSION: u32 = 2;

pub fn programs_file(model_dir: &Path) -> PathBuf {
    model_dir.join(format!("programs.v{PROGRAMS_VERSION}.conf"))
}

/// Command lines for the supervised processes of one model.
/// `{threads}` and `{port}` are substituted at render time.
#[derive(Clone, Debug)]
pub struct ProgramSpec {
    pub trainer_command: String,
    pub worker_command: String,
    pub threads: usize,
    /// `stopwaitsecs` of every program. Must stay below the supervisor call
    /// timeout, since `stopProcess` waits for the process to exit.
    pub stop_wait_secs: u64,
}

/// Renders the supervisord `[program:*]` sections for the trainer and both
/// slots of `model`.
pub fn render_programs(model: &ModelName, dir: &Path, slots: &[Slot], spec: &ProgramSpec) -> String {
    let dir = dir.display();
    let mut out = String::new();

    let trainer = spec
        .trainer_command
        .replace("{threads}", &spec.threads.to_string());
    // startsecs=0: a short training run still counts as a clean exit.
    let _ = write!(
        out,
        "[program:{name}]\ncommand={trainer}\ndirectory={dir}\nautostart=false\nautorestart=false\nstartsecs=0\nstopwaitsecs={stop_wait}\nstopasgroup=true\nkillasgroup=true\nredirect_stderr=true\nstdout_logfile={dir}/train.log\n",
        name = training_process_name(model),
        stop_wait = spec.stop_wait_secs,
    );

    for slot in slots {
        let command = spec.worker_command.replace("{port}", &slot.port.to_string());
        let _ = write!(
            out,
            "\n[program:{name}]\ncommand={command}\ndirectory={dir}\nautostart=false\nautorestart=true\nstopwaitsecs={stop_wait}\nstopasgroup=true\nkillasgroup=true\nredirect_stderr=true\nstdout_logfile={dir}/slot-{suffix}.log\n",
            name = slot.process,
            suffix = slot.id.suffix(),
            stop_wait = spec.stop_wait_secs,
        );
    }
    out
}

/// Writes the process-definition file only when it does not exist yet.
/// Returns whether a file was written.
pub fn write_programs_if_missing(
    model: &ModelName,
    dir: &Path,
    slots: &[Slot],
    spec: &ProgramSpec,
) -> Result<bool> {
    let path = programs_file(dir);
    if path.exists() {
        return Ok(false);
    }
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let abs = fs::canonicalize(dir).map_err(io_err(dir))?;
    fs::write(&path, render_programs(model, &abs, slots, spec)).map_err(io_err(&path))?;
    Ok(true)
}
