//! Tracked-subprocess transport: run a stage by re-invoking this binary.
//!
//! The child runs `run-stage <stage>` with the stage core wired to print
//! structured markers on stdout; this side streams those markers back into
//! typed events through the parser chain and registers the child's pid so
//! the session can be stopped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::Stream;

use crate::error::StageError;
use crate::process_registry::ProcessRegistry;
use crate::progress::{ProgressEvent, SubprocessCommand, run_with_progress};

use super::StageKind;

/// Command line for running `stage` over a session in a child process.
pub fn stage_command(
    kind: StageKind,
    session_id: &str,
    session_dir: &Path,
) -> Result<SubprocessCommand, StageError> {
    let exe = std::env::current_exe()?;
    Ok(SubprocessCommand::new(
        exe.display().to_string(),
        vec![
            "run-stage".to_string(),
            kind.as_str().to_string(),
            "--session".to_string(),
            session_id.to_string(),
            "--dir".to_string(),
            session_dir.display().to_string(),
        ],
    ))
}

/// Spawn the stage subprocess and stream its progress events.
///
/// The returned stream owns everything it needs; it does not borrow the
/// session id or directory, so it can outlive the request that built it.
pub fn run_stage_subprocess(
    kind: StageKind,
    session_id: &str,
    session_dir: &Path,
    registry: Arc<ProcessRegistry>,
    timeout: Duration,
) -> Result<impl Stream<Item = ProgressEvent> + use<>, StageError> {
    let command = stage_command(kind, session_id, session_dir)?;
    Ok(run_with_progress(
        command,
        kind.parsers(),
        Some(session_id.to_string()),
        registry,
        timeout,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{StreamExt, pin_mut};
    use std::path::PathBuf;

    #[tokio::test]
    async fn stream_outlives_the_borrowed_arguments() {
        let registry = Arc::new(ProcessRegistry::new());
        let stream = {
            let session = String::from("short-lived");
            let dir = PathBuf::from("/tmp/short-lived");
            run_stage_subprocess(
                StageKind::Chunking,
                &session,
                &dir,
                registry.clone(),
                Duration::from_secs(30),
            )
            .unwrap()
        };

        // The child is this test binary, which rejects the stage arguments
        // and exits quickly; the stream still ends with a terminal event.
        pin_mut!(stream);
        let mut last = None;
        while let Some(event) = stream.next().await {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(ProgressEvent::Error { .. }) | Some(ProgressEvent::Complete { .. })
        ));
        assert!(registry.get_pids("short-lived").is_empty());
    }

    #[test]
    fn command_targets_current_binary_with_stage_args() {
        let command =
            stage_command(StageKind::Chunking, "s1", Path::new("/data/uploads/s1")).unwrap();
        assert!(!command.program.is_empty());
        assert_eq!(
            command.args,
            vec![
                "run-stage",
                "chunking",
                "--session",
                "s1",
                "--dir",
                "/data/uploads/s1",
            ]
        );
    }
}
