// Copyright 2023 Oxide Computer Company
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use ErrorKind::NotFound;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};
use tempfile::NamedTempFile;

mod error;
pub mod info;
pub mod types;

pub use error::SepError;
pub use info::{composite_is_degraded, RaidGroupInfo, VerifyReport};
pub use types::*;

pub fn read_json_maybe<P, T>(file: P) -> Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == NotFound => return Ok(None),
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = Vec::<u8>::new();
    f.read_to_end(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    Ok(serde_json::from_slice(buf.as_slice())
        .with_context(|| anyhow!("parse {:?}", file))?)
}

pub fn read_json<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    read_json_maybe(file)?
        .ok_or_else(|| anyhow!("open {:?}: file not found", file))
}

pub fn write_json<P, T>(file: P, data: &T, clobber: bool) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let dir = file
        .parent()
        .ok_or_else(|| anyhow!("{:?} has no parent directory", file))?;
    let mut buf = serde_json::to_vec_pretty(data)?;
    buf.push(b'\n');
    let mut tmpf = NamedTempFile::new_in(dir)?;
    tmpf.write_all(&buf)?;
    tmpf.flush()?;

    if clobber {
        tmpf.persist(file)?;
    } else {
        tmpf.persist_noclobber(file)?;
    }
    Ok(())
}

/// Read a TOML file into `T`, for test session and array configuration.
pub fn read_toml<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let text = std::fs::read_to_string(file)
        .with_context(|| anyhow!("read {:?}", file))?;
    toml::from_str(&text).with_context(|| anyhow!("parse {:?}", file))
}

/// Terminal logger on stderr, used by the engine, the harness, and tests.
pub fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// JSON (bunyan) logger on stdout, for runs whose output gets collected.
pub fn build_bunyan_logger(name: &'static str) -> Logger {
    let drain = slog_bunyan::with_name(name, std::io::stdout())
        .build()
        .fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
