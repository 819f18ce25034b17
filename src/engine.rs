//! Engine Invoker (C3): locate, configure, and hand off to the external
//! checkpoint/restore engine.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execv, fork};

use crate::args_grammar::tokenize_bounded;
use crate::error::CrError;
use crate::shm::{ShmWriter, blob_name};
use crate::signal::{self, ThawNotice};

/// Environment variable carrying the restore-blob shared-memory id across
/// `execv` (spec §6, `NEW_ARGS_ID`).
pub const NEW_ARGS_ID_VAR: &str = "NEW_ARGS_ID";

/// Overrides engine-path resolution entirely; not part of the distilled
/// contract, but every other path-locating helper in this codebase's
/// lineage (`fusermount`, `mount.fuse3`) supports an env override ahead of
/// its filesystem probe, so the engine invoker does too.
pub const ENGINE_PATH_OVERRIDE_VAR: &str = "CR_ENGINE_PATH";

/// Upper bound on extra engine tokens (spec §4.3: "length-bounded;
/// overflow is reported").
const MAX_EXTRA_TOKENS: usize = 64;

/// How an `AwaitingEngine` wait resolved (spec §4.3 state machine).
#[derive(Debug)]
pub enum EngineOutcome {
    /// Child exited zero without ever delivering a thaw signal.
    Skipped,
    /// Child exited non-zero, or terminated abnormally, or signalled failure.
    Failed(String),
    /// Thaw observed; carries the restore-blob shared-memory id (0 = none).
    Restoring(i32),
}

/// Resolves the engine path (spec §4.3 "Engine location"), honoring
/// `CR_ENGINE_PATH` before the configured string, and the configured
/// string directly when absolute, otherwise relative to two path
/// components above `vm_library_dir`.
pub fn resolve_engine_path(configured: &str, vm_library_dir: &Path) -> Result<PathBuf, CrError> {
    if let Ok(override_path) = std::env::var(ENGINE_PATH_OVERRIDE_VAR) {
        debug!("engine path overridden by {ENGINE_PATH_OVERRIDE_VAR}={override_path}");
        return stat_or_setup_error(PathBuf::from(override_path));
    }

    let configured_path = Path::new(configured);
    if configured_path.is_absolute() {
        return stat_or_setup_error(configured_path.to_path_buf());
    }

    let install_dir = vm_library_dir
        .parent()
        .and_then(Path::parent)
        .ok_or_else(|| CrError::Setup(format!("{} has no grandparent directory", vm_library_dir.display())))?;
    stat_or_setup_error(install_dir.join(configured_path))
}

fn stat_or_setup_error(path: PathBuf) -> Result<PathBuf, CrError> {
    nix::sys::stat::stat(&path).map_err(|e| CrError::Setup(format!("engine not found at {}: {e}", path.display())))?;
    Ok(path)
}

/// Parses the comma-separated, backslash-escaped extra-token configuration
/// string (spec §4.3 "Engine arguments").
pub fn parse_extra_tokens(raw: &str) -> Result<Vec<String>, CrError> {
    tokenize_bounded(raw, ',', MAX_EXTRA_TOKENS)
        .map_err(|count| CrError::Setup(format!("engine extra-token overflow: {count} tokens (max {MAX_EXTRA_TOKENS})")))
}

fn to_cstring(s: impl AsRef<str>) -> Result<CString, CrError> {
    CString::new(s.as_ref()).map_err(|_| CrError::Setup(format!("argument contains NUL: {:?}", s.as_ref())))
}

/// Runs the checkpoint handshake (spec §4.3 steps 1-3): forks, execs the
/// engine as `engine checkpoint <image-dir> [extras...]`, and multiplexes
/// the two ways `AwaitingEngine` can resolve.
pub fn checkpoint(engine_path: &Path, image_dir: &Path, extra_tokens: &[String]) -> Result<EngineOutcome, CrError> {
    let previous_mask = signal::block_restore_signal()?;
    let outcome = run_engine(engine_path, "checkpoint", image_dir, extra_tokens);
    signal::restore_mask(&previous_mask)?;
    outcome
}

fn run_engine(
    engine_path: &Path,
    verb: &str,
    image_dir: &Path,
    extra_tokens: &[String],
) -> Result<EngineOutcome, CrError> {
    let path_c = to_cstring(engine_path.to_string_lossy())?;
    let mut args_c = vec![path_c.clone(), to_cstring(verb)?, to_cstring(image_dir.to_string_lossy())?];
    for token in extra_tokens {
        args_c.push(to_cstring(token)?);
    }

    // SAFETY: the child performs only async-signal-safe work (execv or
    // _exit) before any other thread state is touched, mirroring the
    // teacher's `setup_auto_unmount` fork discipline.
    match unsafe { fork() }.map_err(|e| CrError::Io("fork".into(), e.into()))? {
        ForkResult::Child => {
            let _ = execv(&path_c, &args_c);
            unsafe { libc::_exit(127) };
        }
        ForkResult::Parent { child } => {
            info!("engine {verb} pid={child}");
            wait_for_child_or_thaw(child)
        }
    }
}

/// Races `waitpid` against the thaw signal in one thread, since a blocked
/// real-time signal does not itself interrupt a blocking `waitpid` (spec
/// §4.3 leaves the multiplexing mechanism undocumented; see DESIGN.md).
fn wait_for_child_or_thaw(child: Pid) -> Result<EngineOutcome, CrError> {
    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(_, 0)) => return Ok(EngineOutcome::Skipped),
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(EngineOutcome::Failed(format!("engine exited with status {code}")));
            }
            Ok(other) => return Ok(EngineOutcome::Failed(format!("engine terminated abnormally: {other:?}"))),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(CrError::Io("waitpid".into(), e.into())),
        }

        match signal::poll_for_thaw(Duration::from_millis(50))? {
            Some(ThawNotice::BlobReady(id)) => return Ok(EngineOutcome::Restoring(id)),
            Some(ThawNotice::NoBlob) => return Ok(EngineOutcome::Restoring(0)),
            Some(ThawNotice::EngineFailed(code)) => {
                return Ok(EngineOutcome::Failed(format!("engine reported failure code {code}")));
            }
            None => continue,
        }
    }
}

/// Runs the restore handshake (spec §4.3 "Restore handshake"): writes the
/// blob, sets `NEW_ARGS_ID`, and `execv`'s the engine as
/// `engine restore <image-dir> [extras...]`. Never returns on success —
/// `execv` replaces this process image; thaw of the *original* process
/// happens independently via `RESTORE_SIGNAL` delivered to it.
pub fn restore(
    engine_path: &Path,
    image_dir: &Path,
    extra_tokens: &[String],
    blob_bytes: &[u8],
) -> Result<std::convert::Infallible, CrError> {
    let name = blob_name("cr_restore", std::process::id());
    let mut writer = ShmWriter::create(&name).map_err(|e| CrError::Io("shm_open restore blob".into(), e))?;
    writer
        .write_all(blob_bytes)
        .map_err(|e| CrError::Io("write restore blob".into(), e))?;

    // SAFETY: single-threaded at this point in the driver; the buffer
    // backing the value must outlive the process per libc::setenv's
    // documented non-copying behavior on some platforms.
    unsafe {
        std::env::set_var(NEW_ARGS_ID_VAR, writer.name());
    }

    let path_c = to_cstring(engine_path.to_string_lossy())?;
    let mut args_c = vec![path_c.clone(), to_cstring("restore")?, to_cstring(image_dir.to_string_lossy())?];
    for token in extra_tokens {
        args_c.push(to_cstring(token)?);
    }

    let err = execv(&path_c, &args_c).unwrap_err();
    warn!("execv restore engine failed: {err}");
    Err(CrError::Engine(format!("execv restore engine: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_configured_path_is_used_directly() {
        let resolved = resolve_engine_path("/bin/sh", Path::new("/opt/vm/lib/libjvm.so")).unwrap();
        assert_eq!(resolved, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn relative_configured_path_resolves_two_levels_above_vm_library() {
        let dir = tempfile::tempdir().unwrap();
        let vm_lib_dir = dir.path().join("lib/server");
        std::fs::create_dir_all(&vm_lib_dir).unwrap();
        let engine_path = dir.path().join("bin/engine");
        std::fs::create_dir_all(engine_path.parent().unwrap()).unwrap();
        std::fs::write(&engine_path, b"#!/bin/sh\n").unwrap();

        let resolved = resolve_engine_path("bin/engine", &vm_lib_dir.join("libjvm.so")).unwrap();
        assert_eq!(resolved, engine_path);
    }

    #[test]
    fn missing_engine_is_a_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let vm_lib_dir = dir.path().join("lib");
        std::fs::create_dir_all(&vm_lib_dir).unwrap();
        assert!(resolve_engine_path("bin/nope", &vm_lib_dir.join("libjvm.so")).is_err());
    }

    #[test]
    fn extra_token_overflow_is_rejected() {
        let raw = (0..100).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        assert!(parse_extra_tokens(&raw).is_err());
    }

    #[test]
    fn extra_tokens_parse_within_bound() {
        assert_eq!(
            parse_extra_tokens("--leave-running,--verbose").unwrap(),
            vec!["--leave-running", "--verbose"]
        );
    }

    // S6: exercise the checkpoint handshake against a scripted engine that
    // exits zero immediately (the "Skipped" arm of AwaitingEngine).
    #[test]
    fn checkpoint_with_immediately_exiting_engine_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("image");
        std::fs::create_dir_all(&image_dir).unwrap();
        let outcome = checkpoint(Path::new("/bin/true"), &image_dir, &[]).unwrap();
        assert!(matches!(outcome, EngineOutcome::Skipped));
    }

    #[test]
    fn checkpoint_with_failing_engine_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("image");
        std::fs::create_dir_all(&image_dir).unwrap();
        let outcome = checkpoint(Path::new("/bin/false"), &image_dir, &[]).unwrap();
        assert!(matches!(outcome, EngineOutcome::Failed(_)));
    }
}
