//! Process-level scenarios exercising the public surface end to end, the
//! way `tests/slow_fs.rs` exercises a whole mount/unmount cycle rather than
//! one module in isolation.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use cr_core::{
    CheckpointContext, ClaimedFds, Config, NoopHooks, PriorityTier, Resource, ResultCode,
};
use serial_test::serial;

fn preexisting_fds() -> Vec<cr_core::PreexistingFd> {
    cr_core::capture_preexisting().unwrap()
}

fn context_with_env(image_dir: &std::path::Path, extra: &[(&str, &str)]) -> CheckpointContext {
    unsafe {
        std::env::set_var("CR_IMAGE_DIR", image_dir);
        for (key, value) in extra {
            std::env::set_var(key, value);
        }
    }
    let config = Config::from_env();
    unsafe {
        std::env::remove_var("CR_IMAGE_DIR");
        for (key, _) in extra {
            std::env::remove_var(key);
        }
    }
    CheckpointContext::new(config, Box::new(NoopHooks))
}

struct NoopResource;

impl Resource for NoopResource {
    fn before_checkpoint(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    fn after_restore(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

// S3: an unclaimed, non-preexisting descriptor fails validation with a
// FdUnclaimed-classified message, even though beforeCheckpoint itself
// succeeds.
#[test]
#[serial]
fn unclaimed_descriptor_fails_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context_with_env(dir.path(), &[]);
    ctx.bus
        .register(PriorityTier::Normal, Arc::new(NoopResource), &Default::default())
        .unwrap();

    let preexisting = preexisting_fds();
    let stray = tempfile::tempfile().unwrap();
    let stray_fd: RawFd = std::os::unix::io::AsRawFd::as_raw_fd(&stray);

    let result = cr_core::checkpoint(&ctx, ClaimedFds::new(), &preexisting, true).unwrap();
    assert!(matches!(result.result_code, ResultCode::Error));
    assert!(
        result
            .failure_messages
            .iter()
            .any(|m| m.contains(&format!("fd={stray_fd}")))
    );
}

// Inverse of the above: claiming the same descriptor clears the failure.
#[test]
#[serial]
fn claimed_descriptor_passes_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context_with_env(dir.path(), &[]);

    let preexisting = preexisting_fds();
    let stray = tempfile::tempfile().unwrap();
    let stray_fd: RawFd = std::os::unix::io::AsRawFd::as_raw_fd(&stray);

    let mut claims = ClaimedFds::new();
    claims.claim(stray_fd, "test", None).unwrap();

    let result = cr_core::checkpoint(&ctx, claims, &preexisting, true).unwrap();
    assert!(matches!(result.result_code, ResultCode::Ok));
    assert!(result.failure_messages.is_empty());
}

// S5: a resource that tries to start a second checkpoint from inside its
// own beforeCheckpoint callback observes the recursion guard reject it,
// without disturbing the outer attempt's own success.
#[test]
#[serial]
fn recursive_checkpoint_from_callback_is_rejected() {
    struct RecursingResource {
        ctx: *const CheckpointContext,
        inner_result: std::sync::Mutex<Option<String>>,
    }

    // SAFETY: `ctx` outlives the resource; both are dropped at the end of
    // the test on the same thread that created them.
    unsafe impl Send for RecursingResource {}
    unsafe impl Sync for RecursingResource {}

    impl Resource for RecursingResource {
        fn before_checkpoint(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let ctx = unsafe { &*self.ctx };
            let inner = cr_core::checkpoint(ctx, ClaimedFds::new(), &[], true);
            *self.inner_result.lock().unwrap() = Some(match inner {
                Err(err) => err.to_string(),
                Ok(result) => format!("unexpectedly succeeded: {result:?}"),
            });
            Ok(())
        }

        fn after_restore(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }

        fn name(&self) -> &str {
            "recursing"
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let ctx = context_with_env(dir.path(), &[]);
    let ctx_ptr: *const CheckpointContext = &ctx;
    let resource = Arc::new(RecursingResource {
        ctx: ctx_ptr,
        inner_result: std::sync::Mutex::new(None),
    });
    ctx.bus
        .register(PriorityTier::Normal, resource.clone(), &Default::default())
        .unwrap();

    let preexisting = preexisting_fds();
    let outer = cr_core::checkpoint(&ctx, ClaimedFds::new(), &preexisting, true).unwrap();
    assert!(matches!(outer.result_code, ResultCode::Ok));

    let inner_message = resource.inner_result.lock().unwrap().clone().unwrap();
    assert!(inner_message.contains("recursive checkpoint"));
}

// A full (non-dry-run) checkpoint against a scripted engine that exits
// immediately, exercising driver -> config -> engine -> claims/fd_inventory
// together rather than any one module in isolation (the engine-handshake
// arms themselves are covered directly in src/engine.rs).
#[test]
#[serial]
fn full_checkpoint_against_immediately_exiting_engine_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let image_dir = dir.path().join("image");
    std::fs::create_dir_all(&image_dir).unwrap();

    let script_path = dir.path().join("mock-engine.sh");
    {
        let mut script = std::fs::File::create(&script_path).unwrap();
        script.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = script.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        script.set_permissions(perms).unwrap();
    }

    let ctx = context_with_env(
        &image_dir,
        &[("CR_ENGINE_PATH", script_path.to_str().unwrap())],
    );
    let preexisting = preexisting_fds();
    let result = cr_core::checkpoint(&ctx, ClaimedFds::new(), &preexisting, false).unwrap();
    assert!(matches!(result.result_code, ResultCode::Ok));
    assert!(result.failure_messages.is_empty());
}

// Boundary case from spec §8: the engine exits non-zero before ever
// delivering a thaw signal; the result is ERROR with an empty failure list
// and a synthetic message rather than a parsed FdUnclaimed failure.
#[test]
#[serial]
fn full_checkpoint_against_failing_engine_reports_synthetic_error() {
    let dir = tempfile::tempdir().unwrap();
    let image_dir = dir.path().join("image");
    std::fs::create_dir_all(&image_dir).unwrap();

    let script_path = dir.path().join("mock-engine-fail.sh");
    {
        let mut script = std::fs::File::create(&script_path).unwrap();
        script.write_all(b"#!/bin/sh\nexit 17\n").unwrap();
        let mut perms = script.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        script.set_permissions(perms).unwrap();
    }

    let ctx = context_with_env(
        &image_dir,
        &[("CR_ENGINE_PATH", script_path.to_str().unwrap())],
    );
    let preexisting = preexisting_fds();
    let result = cr_core::checkpoint(&ctx, ClaimedFds::new(), &preexisting, false).unwrap();
    assert!(matches!(result.result_code, ResultCode::Error));
    assert!(result.failure_codes.is_empty());
    assert_eq!(result.failure_messages.len(), 1);
    assert!(result.failure_messages[0].contains("native checkpoint failed"));
}
