//! Ambient configuration: everything the driver needs that is neither
//! spec-mandated wire format nor VM-callback, assembled from environment
//! variables with `debug!`-logged fallbacks, the way
//! `fusermount::detect_fusermount_bin` probes `FUSERMOUNT_PATH` before
//! falling back to a `PATH` search.

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use log::debug;

use crate::error::CrError;

const ENV_IMAGE_DIR: &str = "CR_IMAGE_DIR";
const ENV_ENGINE: &str = "CR_ENGINE";
const ENV_ENGINE_EXTRA: &str = "CR_ENGINE_EXTRA";
const ENV_VM_LIBRARY_DIR: &str = "CR_VM_LIBRARY_DIR";
const ENV_HEAP_DUMP_ON_FAILURE: &str = "CR_HEAP_DUMP_ON_FAILURE";
const ENV_SKIP_CHECKPOINT: &str = "CR_SKIP_CHECKPOINT";
const ENV_DIAGNOSTIC_FD: &str = "CR_DIAGNOSTIC_FD";

const DEFAULT_ENGINE: &str = "criu";

/// Everything the driver reads once, at construction, rather than on every
/// checkpoint attempt.
#[derive(Debug, Clone)]
pub struct Config {
    /// `None` means the feature is not configured (spec §4.6: "`NONE` means
    /// the feature is not configured").
    pub image_dir: Option<PathBuf>,
    pub engine: String,
    pub engine_extra_tokens_raw: String,
    pub vm_library_dir: PathBuf,
    pub heap_dump_on_failure: bool,
    pub skip_checkpoint: bool,
    pub diagnostic_fd: Option<RawFd>,
}

impl Config {
    /// Reads configuration from the process environment. Never fails by
    /// itself; an absent image directory simply yields `image_dir: None`,
    /// which the driver turns into `ResultCode::None`.
    pub fn from_env() -> Self {
        let image_dir = std::env::var(ENV_IMAGE_DIR).ok().map(PathBuf::from);
        if image_dir.is_none() {
            debug!("{ENV_IMAGE_DIR} unset, checkpoint/restore is unconfigured");
        }

        let engine = std::env::var(ENV_ENGINE).unwrap_or_else(|_| {
            debug!("{ENV_ENGINE} unset, falling back to {DEFAULT_ENGINE:?}");
            DEFAULT_ENGINE.to_owned()
        });

        let engine_extra_tokens_raw = std::env::var(ENV_ENGINE_EXTRA).unwrap_or_default();

        let vm_library_dir = std::env::var(ENV_VM_LIBRARY_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let fallback = std::env::current_exe()
                    .ok()
                    .and_then(|p| p.parent().map(|p| p.to_path_buf()))
                    .unwrap_or_else(|| PathBuf::from("."));
                debug!("{ENV_VM_LIBRARY_DIR} unset, falling back to {}", fallback.display());
                fallback
            });

        let heap_dump_on_failure = bool_env(ENV_HEAP_DUMP_ON_FAILURE);
        let skip_checkpoint = bool_env(ENV_SKIP_CHECKPOINT);

        let diagnostic_fd = std::env::var(ENV_DIAGNOSTIC_FD)
            .ok()
            .and_then(|v| v.parse::<RawFd>().ok());

        Self {
            image_dir,
            engine,
            engine_extra_tokens_raw,
            vm_library_dir,
            heap_dump_on_failure,
            skip_checkpoint,
            diagnostic_fd,
        }
    }

    pub fn require_image_dir(&self) -> Result<&std::path::Path, CrError> {
        self.image_dir.as_deref().ok_or(CrError::ConfigMissing)
    }
}

fn bool_env(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true") | Ok("yes"))
}
