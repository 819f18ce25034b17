//! Restore-Parameter Channel (C2): the byte-level blob format and its
//! semantics when applied to a resurrected process.

use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use ref_cast::RefCast;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::CrError;

/// The fixed-size header, laid out exactly as spec §6 describes (little-endian
/// host). `_pad` exists only to make the struct's size equal to the sum of
/// its fields' sizes, which `zerocopy`'s derives require.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawHeader {
    restore_wall_ms: i64,
    restore_mono_ns: i64,
    n_flags: i32,
    n_props: i32,
    env_bytes: i32,
    _pad: i32,
}

/// A read-only, zero-cost view over the raw header bytes, the same
/// `ref_cast` technique the teacher uses to wrap a raw kernel-protocol
/// struct behind a public-facing type.
#[derive(Debug, RefCast)]
#[repr(transparent)]
pub struct RestoreBlobHeader(RawHeader);

impl RestoreBlobHeader {
    pub fn restore_wall_ms(&self) -> i64 {
        self.0.restore_wall_ms
    }

    pub fn restore_mono_ns(&self) -> i64 {
        self.0.restore_mono_ns
    }
}

/// One parsed flag token (spec §4.2/§6 "Flag token grammar").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagToken {
    /// `+NAME`
    True(String),
    /// `-NAME`
    False(String),
    /// `NAME=VALUE`, delegated interpretation; `=` splits greedily on the
    /// first occurrence (spec §9 open question).
    Assign(String, String),
}

impl FlagToken {
    fn parse(raw: &str) -> Result<Self, CrError> {
        if let Some(name) = raw.strip_prefix('+') {
            return Ok(FlagToken::True(name.to_owned()));
        }
        if let Some(name) = raw.strip_prefix('-') {
            return Ok(FlagToken::False(name.to_owned()));
        }
        match raw.split_once('=') {
            Some((name, value)) => Ok(FlagToken::Assign(name.to_owned(), value.to_owned())),
            None => Err(CrError::RestoreParamParse(format!(
                "flag token missing '=': {raw:?}"
            ))),
        }
    }

    fn render(&self) -> String {
        match self {
            FlagToken::True(name) => format!("+{name}"),
            FlagToken::False(name) => format!("-{name}"),
            FlagToken::Assign(name, value) => format!("{name}={value}"),
        }
    }
}

/// The fully-parsed contents of a restore blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreBlob {
    pub flags: Vec<FlagToken>,
    pub properties: Vec<(String, String)>,
    pub env: Vec<(String, String)>,
    pub program_args: String,
}

/// Serialize `blob` (spec §4.2 "Write path"). Fails atomically: any
/// serialization error means nothing is written.
pub fn serialize(blob: &RestoreBlob, restore_wall_ms: i64, restore_mono_ns: i64) -> Vec<u8> {
    let mut flag_bytes = Vec::new();
    for flag in &blob.flags {
        flag_bytes.extend_from_slice(flag.render().as_bytes());
        flag_bytes.push(0);
    }

    let mut prop_bytes = Vec::new();
    for (k, v) in &blob.properties {
        prop_bytes.extend_from_slice(k.as_bytes());
        prop_bytes.push(b'=');
        prop_bytes.extend_from_slice(v.as_bytes());
        prop_bytes.push(0);
    }

    let mut env_bytes = Vec::new();
    for (k, v) in &blob.env {
        env_bytes.extend_from_slice(k.as_bytes());
        env_bytes.push(b'=');
        env_bytes.extend_from_slice(v.as_bytes());
        env_bytes.push(0);
    }

    let header = RawHeader {
        restore_wall_ms,
        restore_mono_ns,
        n_flags: blob.flags.len() as i32,
        n_props: blob.properties.len() as i32,
        env_bytes: env_bytes.len() as i32,
        _pad: 0,
    };

    let mut out = Vec::with_capacity(
        size_of::<RawHeader>() + flag_bytes.len() + prop_bytes.len() + env_bytes.len() + blob.program_args.len() + 1,
    );
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&flag_bytes);
    out.extend_from_slice(&prop_bytes);
    out.extend_from_slice(&env_bytes);
    out.extend_from_slice(blob.program_args.as_bytes());
    out.push(0);
    out
}

/// A small NUL-delimited string cursor, the same shape as the teacher's
/// `ArgumentIterator::fetch_str` (`memchr::memchr(0, ..)` then split).
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn fetch_nul_terminated(&mut self) -> Result<&'a [u8], CrError> {
        let len = memchr::memchr(0, self.data)
            .ok_or_else(|| CrError::RestoreParamParse("missing NUL terminator".into()))?;
        let (out, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Ok(out)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CrError> {
        if self.data.len() < n {
            return Err(CrError::RestoreParamParse("buffer too short".into()));
        }
        let (out, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(out)
    }
}

/// Parse strictly in write order (spec §4.2 "Read path").
pub fn parse(buf: &[u8]) -> Result<(RestoreBlob, i64, i64), CrError> {
    if buf.len() < size_of::<RawHeader>() {
        return Err(CrError::RestoreParamParse("buffer shorter than header".into()));
    }
    let mut cursor = Cursor::new(buf);
    let header_bytes = cursor.take(size_of::<RawHeader>())?;
    let header =
        RawHeader::read_from_bytes(header_bytes).map_err(|_| CrError::RestoreParamParse("bad header".into()))?;
    let header = RestoreBlobHeader::ref_cast(&header);

    let mut flags = Vec::with_capacity(header.0.n_flags.max(0) as usize);
    for _ in 0..header.0.n_flags {
        let raw = str_from(cursor.fetch_nul_terminated()?)?;
        flags.push(FlagToken::parse(raw)?);
    }

    let mut properties = Vec::with_capacity(header.0.n_props.max(0) as usize);
    for _ in 0..header.0.n_props {
        let raw = str_from(cursor.fetch_nul_terminated()?)?;
        properties.push(split_kv(raw)?);
    }

    let env_region = cursor.take(header.0.env_bytes.max(0) as usize)?;
    let mut env_cursor = Cursor::new(env_region);
    let mut env = Vec::new();
    while !env_cursor.data.is_empty() {
        let raw = str_from(env_cursor.fetch_nul_terminated()?)?;
        env.push(split_kv(raw)?);
    }

    let program_args = str_from(cursor.fetch_nul_terminated()?)?.to_owned();

    Ok((
        RestoreBlob {
            flags,
            properties,
            env,
            program_args,
        },
        header.restore_wall_ms(),
        header.restore_mono_ns(),
    ))
}

fn str_from(bytes: &[u8]) -> Result<&str, CrError> {
    std::str::from_utf8(bytes).map_err(|e| CrError::RestoreParamParse(format!("invalid utf8: {e}")))
}

/// Exactly one split on the first `=` (spec §4.2: "left-of-=... right-of-=
/// (possibly empty)... Exactly one split").
fn split_kv(raw: &str) -> Result<(String, String), CrError> {
    match raw.split_once('=') {
        Some((k, v)) => Ok((k.to_owned(), v.to_owned())),
        None => Err(CrError::RestoreParamParse(format!(
            "property/env entry missing '=': {raw:?}"
        ))),
    }
}

/// Captures `(wall_ms, mono_ns)` at restore-image-production time. A
/// read-back failure (spec §4.2 "Monotonic clock") falls back to "now".
pub fn capture_clock() -> (i64, i64) {
    let wall_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let mono_ns = monotonic_now_ns();
    (wall_ms, mono_ns)
}

fn monotonic_now_ns() -> i64 {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .unwrap_or(nix::sys::time::TimeSpec::new(0, 0));
    ts.tv_sec() * 1_000_000_000 + ts.tv_nsec()
}

/// The origin tag flags are applied with (spec §4.2), so the runtime can
/// later tell which settings came from restore.
pub const FLAG_ORIGIN_TAG: &str = "CRaC_RESTORE";

/// Logs (rather than silently drops) a blob that failed to parse, and
/// returns the "restore proceeds best-effort" fallback counters (spec §7
/// `RESTORE_PARAM_PARSE`).
pub fn fallback_on_parse_failure(err: &CrError) -> (RestoreBlob, i64, i64) {
    warn!("restore blob unreadable, falling back to defaults: {err}");
    let (wall_ms, mono_ns) = capture_clock();
    (RestoreBlob::default(), wall_ms, mono_ns)
}
