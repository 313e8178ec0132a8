// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Zip bundles for Lambda uploads.
//!
//! Layout of a bundle built from an inline or module unit:
//!
//! ```text
//! index.js                    generated entry point
//! <module>.js                 module file (module units only)
//! helpers.js                  file dependencies, by file name
//! node_modules/left-pad/...   directory dependencies, recursively
//! ```
//!
//! Built-in dependencies are provided by the runtime and never shipped.
//! Archive units are returned unchanged.

use std::collections::BTreeSet;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

use nimbus_core::deployer::ComputeError;
use nimbus_core::packager::{DeployableUnit, UnitCode, bundled_module_name};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Directory dependency directories are placed under.
pub const PACKAGES_DIR: &str = "node_modules";

type Result<T> = std::result::Result<T, ComputeError>;

/// Produce the bytes to upload for `unit`.
pub fn build_zip(unit: &DeployableUnit) -> Result<Vec<u8>> {
    let (entry, module) = match &unit.code {
        UnitCode::Archive { bytes } => return Ok(bytes.clone()),
        UnitCode::Inline { entry } => (entry, None),
        UnitCode::Module { entry, module } => (entry, Some(module)),
    };

    let mut bundle = Bundle::new();
    bundle.add(&entry.file_name, entry.source.as_bytes())?;

    if let Some(module) = module {
        let file_name = file_name(module)?;
        bundle.add(&bundled_module_name(&file_name), &fs::read(module)?)?;
    }

    for dependency in unit.shipped_dependencies() {
        if dependency.is_dir() {
            let prefix = format!("{}/{}", PACKAGES_DIR, file_name(dependency)?);
            bundle.add_dir(dependency, &prefix)?;
        } else {
            bundle.add(&file_name(dependency)?, &fs::read(dependency)?)?;
        }
    }

    let bytes = bundle.finish()?;
    debug!(
        function = %unit.function_name,
        size = bytes.len(),
        "Built bundle"
    );
    Ok(bytes)
}

struct Bundle {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
    names: BTreeSet<String>,
}

impl Bundle {
    fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
            options: SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(0o644),
            names: BTreeSet::new(),
        }
    }

    fn add(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        if !self.names.insert(name.to_string()) {
            return Err(ComputeError::Bundle(format!(
                "two bundle entries would be named {}",
                name
            )));
        }
        self.writer
            .start_file(name, self.options)
            .map_err(|e| ComputeError::Bundle(format!("failed to add {}: {}", name, e)))?;
        self.writer.write_all(contents)?;
        Ok(())
    }

    fn add_dir(&mut self, dir: &Path, prefix: &str) -> Result<()> {
        let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = format!("{}/{}", prefix, entry.file_name().to_string_lossy());
            if entry.file_type()?.is_dir() {
                self.add_dir(&path, &name)?;
            } else {
                self.add(&name, &fs::read(&path)?)?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>> {
        let cursor = self
            .writer
            .finish()
            .map_err(|e| ComputeError::Bundle(format!("failed to finalize bundle: {}", e)))?;
        Ok(cursor.into_inner())
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ComputeError::Bundle(format!("{} has no file name", path.display())))
}
