//! Run an arbitrary external command as a post-processing step.

use std::path::{Path, PathBuf};

use ef_core::Result;
use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;

/// Replace `{name}` placeholders in `args` with the given values.
pub fn substitute_vars(args: &[String], vars: &[(&str, String)]) -> Vec<String> {
    args.iter()
        .map(|a| {
            vars.iter()
                .fold(a.clone(), |acc, (name, value)| acc.replace(&format!("{{{name}}}"), value))
        })
        .collect()
}

/// Execute `program` with placeholder-substituted `args` in `cwd`.
///
/// This is the escape hatch for steps not covered by the built-in actions.
pub async fn exec_command(
    program: &str,
    args: &[String],
    vars: &[(&str, String)],
    cwd: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let resolved = substitute_vars(args, vars);
    let mut cmd = ToolCommand::new(PathBuf::from(program));
    cmd.args(resolved).current_dir(cwd);
    tracing::info!(command = %cmd, "exec");
    cmd.supervise(cancel, |_, line| tracing::debug!(target: "ef_av::exec", "{line}"))
        .await?;
    Ok(())
}
