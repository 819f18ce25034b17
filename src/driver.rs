//! Checkpoint Driver (C6): the top-level sequencer implementing spec §4.6
//! steps 1-9, modeled on `fuser::session`'s `main_request_loop` as the one
//! place that owns the whole request lifecycle end to end.

use std::path::Path;

use log::trace;

use crate::claims::ClaimedFds;
use crate::context::CheckpointContext;
use crate::engine::{self, EngineOutcome};
use crate::error::{CrError, ResultCode};
use crate::fd_inventory::{self, PreexistingFd};
use crate::{args_grammar, claims, restore_blob, shm};

/// The structured outcome of one checkpoint attempt (spec §4.6 step 9).
#[derive(Debug, Default, Clone)]
pub struct CheckpointResult {
    /// Whether the attempt succeeded, failed, or never ran (unconfigured).
    pub result_code: ResultCode,
    /// New `(program, args)` from the restore blob, if the attempt restored.
    pub new_program_args: Option<(String, Vec<String>)>,
    /// New properties from the restore blob, if the attempt restored.
    pub new_properties: Option<Vec<(String, String)>>,
    /// FD-classified failure codes (spec §6 vocabulary); empty for callback-only failures.
    pub failure_codes: Vec<i32>,
    /// Human-readable messages for every accumulated callback or FD failure.
    pub failure_messages: Vec<String>,
}

impl CheckpointResult {
    fn none() -> Self {
        Self {
            result_code: ResultCode::None,
            ..Default::default()
        }
    }

    fn ok_empty() -> Self {
        Self {
            result_code: ResultCode::Ok,
            ..Default::default()
        }
    }
}

/// Runs one checkpoint attempt (spec §4.6).
///
/// `claims` is the claim registry built up by resources during
/// `beforeCheckpoint` dispatch — callers typically pass an empty registry
/// and let `ResourceBus`-driven resources populate it, but it is accepted
/// here so tests can pre-seed claims without a full resource object.
/// `preexisting` is the identity of every descriptor observed open at
/// VM-init time (see [`fd_inventory::capture_preexisting`]).
///
/// A callback or FD-validation failure is folded into the returned
/// `CheckpointResult` (`ResultCode::Error` plus `failure_codes`/
/// `failure_messages`) rather than propagated as `Err`, matching §4.6's
/// "structured result" contract; `Err` is reserved for structural failures
/// (missing config, a bad engine path, OS errors) that have no place in
/// that result shape.
pub fn checkpoint(
    ctx: &CheckpointContext,
    claims: ClaimedFds,
    preexisting: &[PreexistingFd],
    dry_run: bool,
) -> Result<CheckpointResult, CrError> {
    let _guard = ctx.acquire_recursion_guard()?;
    let _driving = ctx.driving_lock();

    let image_dir = match ctx.config.require_image_dir() {
        Ok(dir) => dir.to_path_buf(),
        Err(_) => return Ok(CheckpointResult::none()),
    };

    ctx.hooks().abort_diagnostic_listener();
    ctx.hooks().request_gc();

    ctx.bus.begin_checkpoint();
    let callback_result = ctx.bus.dispatch_before_checkpoint();

    let inventory = fd_inventory::initialize()?;
    let fd_failures = claims::validate(&inventory, &claims, preexisting, ctx.config.diagnostic_fd);

    let mut failure_codes = Vec::new();
    let mut failure_messages = Vec::new();
    if let Err(err) = &callback_result {
        failure_messages.push(err.to_string());
    }
    for failure in &fd_failures {
        failure_codes.push(failure.kind.code());
        failure_messages.push(failure.to_string());
    }
    let has_failures = callback_result.is_err() || !fd_failures.is_empty();

    if has_failures && ctx.config.heap_dump_on_failure {
        ctx.hooks().heap_dump("checkpoint validation failed");
    }

    if has_failures {
        ctx.bus.end_checkpoint();
        return Ok(CheckpointResult {
            result_code: ResultCode::Error,
            new_program_args: None,
            new_properties: None,
            failure_codes,
            failure_messages,
        });
    }

    if dry_run {
        ctx.bus.end_checkpoint();
        return Ok(CheckpointResult::ok_empty());
    }

    ctx.hooks().detach_perf_shared_file();

    if ctx.config.skip_checkpoint {
        trace!("skip-checkpoint flag set, returning without invoking the engine");
        ctx.bus.end_checkpoint();
        ctx.hooks().reattach_perf_shared_file();
        return Ok(CheckpointResult::ok_empty());
    }

    let extra_tokens = engine::parse_extra_tokens(&ctx.config.engine_extra_tokens_raw)?;
    let engine_path = engine::resolve_engine_path(&ctx.config.engine, &ctx.config.vm_library_dir)?;

    let outcome = engine::checkpoint(&engine_path, &image_dir, &extra_tokens);
    match outcome {
        Err(err) => {
            ctx.bus.end_checkpoint();
            ctx.hooks().reattach_perf_shared_file();
            Err(err)
        }
        Ok(EngineOutcome::Skipped) => {
            ctx.bus.end_checkpoint();
            ctx.hooks().reattach_perf_shared_file();
            Ok(CheckpointResult::ok_empty())
        }
        Ok(EngineOutcome::Failed(msg)) => {
            ctx.bus.end_checkpoint();
            ctx.hooks().reattach_perf_shared_file();
            // Boundary case: "Engine fails before signal delivery: result is
            // ERROR, failure list is empty, a synthetic message is surfaced."
            Ok(CheckpointResult {
                result_code: ResultCode::Error,
                new_program_args: None,
                new_properties: None,
                failure_codes: Vec::new(),
                failure_messages: vec![format!("native checkpoint failed: {msg}")],
            })
        }
        Ok(EngineOutcome::Restoring(blob_id)) => finish_restore(ctx, blob_id),
    }
}

/// The `[Restoring] -> [PostRestore] -> [Idle]` tail of the state machine:
/// read the blob (or fall back), apply it, dispatch `afterRestore`.
///
/// The restore-blob identifier delivered in `si_int` is modeled as the
/// writer process's pid, so the segment name can be reconstructed the same
/// way it was built at write time (see DESIGN.md open-question notes).
fn finish_restore(ctx: &CheckpointContext, blob_id: i32) -> Result<CheckpointResult, CrError> {
    let (blob, _wall_ms, _mono_ns) = read_restore_blob(blob_id);

    for flag in &blob.flags {
        ctx.hooks().apply_restore_flag(restore_blob::FLAG_ORIGIN_TAG, flag);
    }

    for (key, value) in &blob.env {
        // SAFETY: single-threaded at this point; the restore-blob buffer
        // backing these strings is intentionally leaked for process
        // lifetime (spec §9 "Environment persistence").
        unsafe {
            std::env::set_var(key, value);
        }
    }
    let new_program_args = args_grammar::parse_program_args(&blob.program_args);
    let new_properties = if blob.properties.is_empty() {
        None
    } else {
        Some(blob.properties.clone())
    };

    let restore_result = ctx.bus.dispatch_after_restore();
    ctx.bus.end_checkpoint();
    ctx.hooks().reattach_perf_shared_file();

    let (result_code, failure_messages) = match restore_result {
        Ok(()) => (ResultCode::Ok, Vec::new()),
        Err(err) => (ResultCode::Error, vec![err.to_string()]),
    };

    Ok(CheckpointResult {
        result_code,
        new_program_args,
        new_properties,
        failure_codes: Vec::new(),
        failure_messages,
    })
}

fn read_restore_blob(blob_id: i32) -> (restore_blob::RestoreBlob, i64, i64) {
    if blob_id <= 0 {
        let (wall_ms, mono_ns) = restore_blob::capture_clock();
        return (restore_blob::RestoreBlob::default(), wall_ms, mono_ns);
    }

    let name = shm::blob_name("cr_restore", blob_id as u32);
    match shm::ShmReader::open_and_unlink(&name) {
        Ok(mut reader) => match reader.read_all() {
            Ok(bytes) => match restore_blob::parse(&bytes) {
                Ok(result) => result,
                Err(err) => restore_blob::fallback_on_parse_failure(&err),
            },
            Err(err) => restore_blob::fallback_on_parse_failure(&CrError::Io("read restore blob".into(), err)),
        },
        Err(err) => restore_blob::fallback_on_parse_failure(&CrError::Io("open restore blob".into(), err)),
    }
}

/// Initiates a restore (spec §4.3 "Restore handshake" + §4.2 write path):
/// serializes `blob`, writes it to shared memory, and `execv`'s the engine.
/// Run from a fresh process dedicated to asking the engine to thaw an
/// existing image — distinct from the frozen process itself, which resumes
/// independently inside [`checkpoint`]'s engine-invocation wait.
pub fn initiate_restore(
    ctx: &CheckpointContext,
    image_dir: &Path,
    blob: &restore_blob::RestoreBlob,
) -> Result<std::convert::Infallible, CrError> {
    let extra_tokens = engine::parse_extra_tokens(&ctx.config.engine_extra_tokens_raw)?;
    let engine_path = engine::resolve_engine_path(&ctx.config.engine, &ctx.config.vm_library_dir)?;
    let (wall_ms, mono_ns) = restore_blob::capture_clock();
    let bytes = restore_blob::serialize(blob, wall_ms, mono_ns);
    engine::restore(&engine_path, image_dir, &extra_tokens, &bytes)
}
