//! Auxiliary script emitters.
//!
//! Pari, Sage and Octave cannot take the task id and arguments on the
//! command line the way Maple does, so each task gets a small generated
//! script that binds `taskId`/`taskArgs` and then loads the user program.
//! The `auxprog` marker in the file names is what close-out cleanup
//! matches, so every emitter here must keep it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::message::TaskId;
use crate::task::TaskType;

/// Marker shared by every transient script name.
pub const AUX_MARKER: &str = "auxprog";

/// Where the auxiliary script for a task lives. Task types that do not use
/// one never call this.
pub fn aux_script_path(out_dir: &Path, task_type: TaskType, task_number: TaskId) -> PathBuf {
    let ext = match task_type {
        TaskType::Pari => "gp",
        TaskType::Sage => "sage",
        TaskType::Octave => "m",
        _ => unreachable!("no auxiliary script for {}", task_type.name()),
    };
    out_dir.join(format!("{}_{}.{}", task_number, AUX_MARKER, ext))
}

/// Writes the per-task script and returns its path.
pub fn write_aux_script(
    out_dir: &Path,
    task_type: TaskType,
    task_number: TaskId,
    program: &Path,
    args_csv: &str,
) -> io::Result<PathBuf> {
    let path = aux_script_path(out_dir, task_type, task_number);
    let program = program.display();
    let contents = match task_type {
        TaskType::Pari => format!(
            "taskId = {task_number};\ntaskArgs = [{args_csv}];\n\\r {program}\n\\q\n"
        ),
        TaskType::Sage => format!(
            "taskId = {task_number}\ntaskArgs = [{args_csv}]\nload('{program}')\n"
        ),
        TaskType::Octave => format!(
            "taskId = {task_number};\ntaskArgs = [{args_csv}];\nsource('{program}');\n"
        ),
        _ => unreachable!("no auxiliary script for {}", task_type.name()),
    };
    fs::write(&path, contents)?;
    Ok(path)
}

/// Removes every transient script left in the output directory.
pub fn remove_aux_scripts(out_dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(out_dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().contains(AUX_MARKER) {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Rewrites a Maple library to pin the kernel to one core, keeping the
/// original next to it as `<program>.bak` for [`restore_maple_backup`].
pub fn maple_single_core(program: &Path) -> io::Result<()> {
    let original = fs::read_to_string(program)?;
    fs::write(backup_path(program), &original)?;
    fs::write(program, format!("kernelopts(numcpus=1):\n{original}"))
}

/// Puts the pre-rewrite library back. A missing backup is fine (nothing
/// was rewritten, or a previous run already restored it).
pub fn restore_maple_backup(program: &Path) -> io::Result<()> {
    let backup = backup_path(program);
    match fs::rename(&backup, program) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn backup_path(program: &Path) -> PathBuf {
    let mut name = program.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}
