//! snapwire-testplugin - reference plugin for end-to-end tests
//!
//! ```text
//! snapwire-testplugin <storage|importer|exporter> [--min-version N] [--max-version N] [--serialized]
//! ```
//!
//! - **storage**: in-memory content-addressed store
//! - **importer**: scans the directory named by the `root` config key
//! - **exporter**: restores into the directory named by the `root` config key
//!
//! The endpoint is picked by the runtime: the socket in `SNAPWIRE_ENDPOINT`
//! when set, stdin/stdout otherwise. When `SNAPWIRE_TESTPLUGIN_PIDFILE` is set
//! the process writes its pid there before the handshake.

mod exporter;
mod importer;
mod storage;

use anyhow::{bail, Context, Result};
use snapwire::{
    exporter_methods, importer_methods, storage_methods, CapabilityKind, Concurrency, PluginRuntime,
};
use std::sync::Arc;
use tracing::info;

const PIDFILE_ENV: &str = "SNAPWIRE_TESTPLUGIN_PIDFILE";

struct Options {
    kind: CapabilityKind,
    min_version: u32,
    max_version: u32,
    concurrency: Concurrency,
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let kind = args.next().context("missing capability (storage, importer or exporter)")?;
        let kind = match CapabilityKind::parse(&kind) {
            Some(kind) => kind,
            None => bail!("unknown capability {:?}", kind),
        };

        let mut options = Options {
            kind,
            min_version: snapwire::bridge::frame::PROTOCOL_VERSION_MIN,
            max_version: snapwire::bridge::frame::PROTOCOL_VERSION_MAX,
            concurrency: Concurrency::Concurrent,
        };
        while let Some(flag) = args.next() {
            match flag.as_str() {
                "--min-version" => options.min_version = version_arg(&flag, args.next())?,
                "--max-version" => options.max_version = version_arg(&flag, args.next())?,
                "--serialized" => options.concurrency = Concurrency::Serialized,
                other => bail!("unknown flag {:?}", other),
            }
        }
        Ok(options)
    }
}

fn version_arg(flag: &str, value: Option<String>) -> Result<u32> {
    let value = value.with_context(|| format!("{} needs a value", flag))?;
    value
        .parse()
        .with_context(|| format!("{} expects a number, got {:?}", flag, value))
}

fn main() -> Result<()> {
    snapwire::logging::init();
    let options = Options::parse(std::env::args().skip(1))?;

    if let Some(path) = std::env::var_os(PIDFILE_ENV) {
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("writing pid file {:?}", path))?;
    }

    info!(
        capability = %options.kind,
        min_version = options.min_version,
        max_version = options.max_version,
        "starting test plugin"
    );

    let runtime = PluginRuntime::new(options.kind, "snapwire-testplugin", env!("CARGO_PKG_VERSION"))
        .with_versions(options.min_version, options.max_version)
        .with_concurrency(options.concurrency);

    let runtime = match options.kind {
        CapabilityKind::Storage => runtime.with_factory(|config| {
            Ok(storage_methods(Arc::new(storage::MemStorage::new(config))))
        }),
        CapabilityKind::Importer => runtime.with_factory(|config| {
            Ok(importer_methods(Arc::new(importer::DirImporter::new(config)?)))
        }),
        CapabilityKind::Exporter => runtime.with_factory(|config| {
            Ok(exporter_methods(Arc::new(exporter::DirExporter::new(config)?)))
        }),
    };

    runtime.run()?;
    info!("test plugin exiting");
    Ok(())
}
