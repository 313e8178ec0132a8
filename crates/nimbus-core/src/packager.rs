// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Packaging of sources into deployable units.
//!
//! A source is one of three shapes, each with its own fixed parameters:
//!
//! | Source | Dependencies | Entry point |
//! |--------|--------------|-------------|
//! | [`InlineSource`] | resolved + baseline | synthesized around the function expression |
//! | [`ModuleSource`] | resolved + baseline | synthesized around `require(module)[handler]` |
//! | [`ArchiveSource`] | none (baseline recorded only) | provided by the archive |
//!
//! Packaging never touches the network. It reads the local file system for
//! dependency resolution and for the content digest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::resolver::{BASELINE_DEPENDENCY, DependencyResolver, Location, ensure_baseline};

/// Handler name used for module sources when none is given.
pub const DEFAULT_HANDLER: &str = "default";

/// Handler name used for archives when none is given.
pub const DEFAULT_ARCHIVE_HANDLER: &str = "index.handler";

/// File name of the synthesized entry point inside a bundle.
pub const ENTRY_FILE: &str = "index.js";

/// Export name of the synthesized entry point.
pub const ENTRY_EXPORT: &str = "handler";

const FUNCTION_PREFIX: &str = "nimbus";
const MODULE_NAME_PREFIX: &str = "fromModule";
const MAX_FUNCTION_NAME: usize = 64;

const ENTRY_TEMPLATE: &str = r#"'use strict';
const { SQSClient, SendMessageCommand } = require('__NIMBUS_SDK__');
const sqs = new SQSClient({});

__NIMBUS_TARGET__

async function post(event, status, payload) {
  const body = JSON.stringify({
    id: event.id,
    status: status,
    payload: payload === undefined ? null : payload
  });
  await sqs.send(new SendMessageCommand({ QueueUrl: event.queue, MessageBody: body }));
}

exports.handler = async function (event) {
  let value;
  try {
    value = await target.apply(null, event.args || []);
  } catch (err) {
    await post(event, 'error', { message: String((err && err.message) || err) });
    return;
  }
  await post(event, 'success', value);
};
"#;

fn entry_source(target: &str) -> String {
    ENTRY_TEMPLATE
        .replace("__NIMBUS_SDK__", BASELINE_DEPENDENCY)
        .replace("__NIMBUS_TARGET__", target)
}

/// Which source variant produced a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Inline function expression.
    Inline,
    /// Module file plus handler name.
    Module,
    /// Prebuilt archive.
    Archive,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Inline => write!(f, "inline"),
            SourceKind::Module => write!(f, "module"),
            SourceKind::Archive => write!(f, "archive"),
        }
    }
}

/// Run configuration of the remote function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Explicit remote function name; derived from the source when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Remote runtime identifier.
    pub runtime: String,
    /// Memory in megabytes.
    pub memory_mb: u32,
    /// Remote execution timeout in seconds.
    pub timeout_secs: u32,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Environment variables for the remote function.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: None,
            runtime: "nodejs20.x".to_string(),
            memory_mb: 128,
            timeout_secs: 3,
            description: None,
            environment: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    /// Set an explicit function name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the memory size.
    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Set the remote timeout.
    pub fn with_timeout_secs(mut self, timeout_secs: u32) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set the runtime identifier.
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// An inline function expression.
#[derive(Debug, Clone)]
pub struct InlineSource {
    /// Function expression text, e.g. `function (a, b) { return a + b; }`.
    pub code: String,
    /// Dependency references.
    pub dependencies: Vec<String>,
    /// Run configuration.
    pub config: RunConfig,
    /// Directory that relative dependency references are resolved against.
    pub base_dir: PathBuf,
}

impl InlineSource {
    /// Create an inline source resolving relative references against `.`.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            dependencies: Vec::new(),
            config: RunConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }

    /// Set the dependency references.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the run configuration.
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve relative references against `base_dir`.
    pub fn relative_to(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }
}

/// One positional argument following the module path.
///
/// Mirrors the call shapes `(path, handler, deps, config)` and
/// `(path, deps, config)`.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleArg {
    /// Textual argument: the handler name.
    Text(String),
    /// List argument: dependency references.
    List(Vec<String>),
    /// Run configuration.
    Config(RunConfig),
}

impl From<&str> for ModuleArg {
    fn from(value: &str) -> Self {
        ModuleArg::Text(value.to_string())
    }
}

impl From<String> for ModuleArg {
    fn from(value: String) -> Self {
        ModuleArg::Text(value)
    }
}

impl From<Vec<String>> for ModuleArg {
    fn from(value: Vec<String>) -> Self {
        ModuleArg::List(value)
    }
}

impl From<Vec<&str>> for ModuleArg {
    fn from(value: Vec<&str>) -> Self {
        ModuleArg::List(value.into_iter().map(str::to_string).collect())
    }
}

impl From<RunConfig> for ModuleArg {
    fn from(value: RunConfig) -> Self {
        ModuleArg::Config(value)
    }
}

/// A module file and the handler it exports.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    /// Module reference, resolved like a dependency.
    pub path: String,
    /// Exported handler; [`DEFAULT_HANDLER`] when absent.
    pub handler: Option<String>,
    /// Dependency references.
    pub dependencies: Vec<String>,
    /// Run configuration.
    pub config: RunConfig,
    /// Directory that relative references are resolved against.
    pub base_dir: PathBuf,
}

impl ModuleSource {
    /// Create a module source resolving relative references against `.`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            handler: None,
            dependencies: Vec::new(),
            config: RunConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }

    /// Build a module source from positional arguments.
    ///
    /// If the first argument is textual it is the handler name and the next
    /// argument is the dependency list; otherwise the first argument is the
    /// dependency list and the handler keeps its default.
    pub fn from_args<I>(path: impl Into<String>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = ModuleArg>,
    {
        let mut source = Self::new(path);
        let mut args = args.into_iter().peekable();

        if let Some(ModuleArg::Text(handler)) = args.peek() {
            source.handler = Some(handler.clone());
            args.next();
        }

        for arg in args {
            match arg {
                ModuleArg::List(deps) => source.dependencies = deps,
                ModuleArg::Config(config) => source.config = config,
                ModuleArg::Text(text) => {
                    return Err(Error::InvalidSource(format!(
                        "unexpected textual argument [{}] for module {}",
                        text, source.path
                    )));
                }
            }
        }

        Ok(source)
    }

    /// Set the handler name.
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Set the dependency references.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the run configuration.
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve relative references against `base_dir`.
    pub fn relative_to(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// The effective handler name.
    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(DEFAULT_HANDLER)
    }
}

/// An already packaged archive.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    /// Archive bytes, shipped as-is.
    pub bytes: Vec<u8>,
    /// Remote handler; [`DEFAULT_ARCHIVE_HANDLER`] when absent.
    pub handler: Option<String>,
    /// Run configuration.
    pub config: RunConfig,
}

impl ArchiveSource {
    /// Create an archive source.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            handler: None,
            config: RunConfig::default(),
        }
    }

    /// Set the remote handler.
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Set the run configuration.
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }
}

/// Any of the three source shapes.
#[derive(Debug, Clone)]
pub enum Source {
    /// Inline function expression.
    Inline(InlineSource),
    /// Module plus handler.
    Module(ModuleSource),
    /// Prebuilt archive.
    Archive(ArchiveSource),
}

impl Source {
    /// Kind of this source.
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Inline(_) => SourceKind::Inline,
            Source::Module(_) => SourceKind::Module,
            Source::Archive(_) => SourceKind::Archive,
        }
    }
}

impl From<InlineSource> for Source {
    fn from(value: InlineSource) -> Self {
        Source::Inline(value)
    }
}

impl From<ModuleSource> for Source {
    fn from(value: ModuleSource) -> Self {
        Source::Module(value)
    }
}

impl From<ArchiveSource> for Source {
    fn from(value: ArchiveSource) -> Self {
        Source::Archive(value)
    }
}

/// A generated source file shipped with the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// File name inside the bundle.
    pub file_name: String,
    /// File contents.
    pub source: String,
}

/// The code part of a deployable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitCode {
    /// Synthesized entry point wrapping the inline function.
    Inline {
        /// Entry point.
        entry: EntryPoint,
    },
    /// Synthesized entry point plus the module file it requires.
    Module {
        /// Entry point.
        entry: EntryPoint,
        /// Resolved module file.
        module: PathBuf,
    },
    /// Archive bytes shipped untouched.
    Archive {
        /// Archive contents.
        bytes: Vec<u8>,
    },
}

/// The packaged form submitted to the compute service.
#[derive(Debug, Clone)]
pub struct DeployableUnit {
    /// Source variant that produced this unit.
    pub kind: SourceKind,
    /// Remote function name.
    pub function_name: String,
    /// Handler name (module export, entry export, or archive handler).
    pub handler: String,
    /// Resolved dependency closure; always contains the baseline binding.
    pub dependencies: Vec<Location>,
    /// Code to ship.
    pub code: UnitCode,
    /// Run configuration.
    pub config: RunConfig,
    /// SHA-256 over everything above, hex encoded.
    pub digest: String,
}

impl DeployableUnit {
    /// Handler string the compute service should call.
    pub fn remote_handler(&self) -> String {
        match self.code {
            UnitCode::Archive { .. } => self.handler.clone(),
            UnitCode::Inline { .. } | UnitCode::Module { .. } => {
                let stem = ENTRY_FILE.trim_end_matches(".js");
                format!("{}.{}", stem, ENTRY_EXPORT)
            }
        }
    }

    /// Dependencies that have to be shipped (built-ins excluded).
    pub fn shipped_dependencies(&self) -> impl Iterator<Item = &Path> {
        self.dependencies.iter().filter_map(|d| match d {
            Location::Path(path) => Some(path.as_path()),
            Location::Builtin(_) => None,
        })
    }
}

/// Turns sources into deployable units.
#[derive(Debug, Clone, Default)]
pub struct Packager {
    resolver: DependencyResolver,
}

impl Packager {
    /// Create a packager around a resolver.
    pub fn new(resolver: DependencyResolver) -> Self {
        Self { resolver }
    }

    /// The resolver used for dependencies and module paths.
    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Package any source shape.
    pub fn package(&self, source: Source) -> Result<DeployableUnit> {
        match source {
            Source::Inline(inline) => self.from_inline(inline),
            Source::Module(module) => self.from_module(module),
            Source::Archive(archive) => self.from_archive(archive),
        }
    }

    /// Package an inline function expression.
    pub fn from_inline(&self, source: InlineSource) -> Result<DeployableUnit> {
        let code = source.code.trim();
        if !is_invocable(code) {
            return Err(Error::InvalidSource(
                "inline code is not an invocable function expression".to_string(),
            ));
        }

        let mut deps = source.dependencies;
        ensure_baseline(&mut deps);
        let dependencies = self.resolver.resolve_all(&deps, &source.base_dir)?;

        let target = format!("const target = ({});", code);
        let entry = EntryPoint {
            file_name: ENTRY_FILE.to_string(),
            source: entry_source(&target),
        };

        let identity = hash_hex(&[b"inline".as_slice(), code.as_bytes()]);
        let function_name = function_name(
            &source.config,
            &format!("{}-{}-{}", FUNCTION_PREFIX, SourceKind::Inline, &identity[..12]),
        );

        let unit = finish_unit(
            SourceKind::Inline,
            function_name,
            ENTRY_EXPORT.to_string(),
            dependencies,
            UnitCode::Inline { entry },
            source.config,
        )?;
        info!(function = %unit.function_name, kind = %unit.kind, "Packaged inline source");
        Ok(unit)
    }

    /// Package a module reference.
    pub fn from_module(&self, source: ModuleSource) -> Result<DeployableUnit> {
        let module = match self.resolver.resolve(&source.path, &source.base_dir)? {
            Location::Path(path) if path.is_dir() => {
                let index = path.join(ENTRY_FILE);
                if !index.is_file() {
                    return Err(Error::InvalidSource(format!(
                        "module directory {} has no {}",
                        path.display(),
                        ENTRY_FILE
                    )));
                }
                index
            }
            Location::Path(path) => path,
            Location::Builtin(name) => {
                return Err(Error::InvalidSource(format!(
                    "module [{}] is a built-in binding, not a local module",
                    name
                )));
            }
        };

        let module_file = module
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .ok_or_else(|| {
                Error::InvalidSource(format!("module path {} has no file name", module.display()))
            })?;
        debug!(module = %module.display(), "Resolved module");

        let handler = source.handler_name().to_string();
        let mut deps = source.dependencies;
        ensure_baseline(&mut deps);
        let dependencies = self.resolver.resolve_all(&deps, &source.base_dir)?;

        let entry = EntryPoint {
            file_name: ENTRY_FILE.to_string(),
            source: entry_source(&module_target(&bundled_module_name(&module_file), &handler)?),
        };

        let identity = hash_hex(&[
            b"module".as_slice(),
            module.to_string_lossy().as_bytes(),
            handler.as_bytes(),
        ]);
        let stem = module
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let function_name = function_name(
            &source.config,
            &format!(
                "{}-{}-{}-{}",
                FUNCTION_PREFIX,
                MODULE_NAME_PREFIX,
                sanitize(&stem),
                &identity[..12]
            ),
        );

        let unit = finish_unit(
            SourceKind::Module,
            function_name,
            handler,
            dependencies,
            UnitCode::Module { entry, module },
            source.config,
        )?;
        info!(
            function = %unit.function_name,
            handler = %unit.handler,
            dependencies = unit.dependencies.len(),
            "Packaged module source"
        );
        Ok(unit)
    }

    /// Package a prebuilt archive.
    pub fn from_archive(&self, source: ArchiveSource) -> Result<DeployableUnit> {
        if source.bytes.is_empty() {
            return Err(Error::InvalidSource("archive is empty".to_string()));
        }

        let identity = hash_hex(&[b"archive".as_slice(), source.bytes.as_slice()]);
        let function_name = function_name(
            &source.config,
            &format!("{}-{}-{}", FUNCTION_PREFIX, SourceKind::Archive, &identity[..12]),
        );
        let handler = source
            .handler
            .unwrap_or_else(|| DEFAULT_ARCHIVE_HANDLER.to_string());

        let unit = finish_unit(
            SourceKind::Archive,
            function_name,
            handler,
            vec![Location::Builtin(BASELINE_DEPENDENCY.to_string())],
            UnitCode::Archive {
                bytes: source.bytes,
            },
            source.config,
        )?;
        info!(function = %unit.function_name, size = unit_size(&unit), "Packaged archive source");
        Ok(unit)
    }
}

/// Name the module is shipped under inside the bundle.
///
/// A module called `index.js` would collide with the entry point.
pub fn bundled_module_name(module_file: &str) -> String {
    if module_file == ENTRY_FILE {
        format!("module_{}", module_file)
    } else {
        module_file.to_string()
    }
}

fn module_target(module_file: &str, handler: &str) -> Result<String> {
    let module_literal = serde_json::to_string(&format!("./{}", module_file))?;
    let handler_literal = serde_json::to_string(handler)?;
    Ok(format!(
        "const loaded = require({module});\n\
         const target = (typeof loaded === 'function' && {handler} === 'default')\n  \
         ? loaded\n  : loaded[{handler}];\n\
         if (typeof target !== 'function') {{\n  \
         throw new Error('handler ' + {handler} + ' is not exported by ' + {module});\n\
         }}",
        module = module_literal,
        handler = handler_literal,
    ))
}

fn finish_unit(
    kind: SourceKind,
    function_name: String,
    handler: String,
    dependencies: Vec<Location>,
    code: UnitCode,
    config: RunConfig,
) -> Result<DeployableUnit> {
    let mut hasher = Sha256::new();
    hasher.update(kind.to_string().as_bytes());
    hasher.update(function_name.as_bytes());
    hasher.update(handler.as_bytes());
    hasher.update(serde_json::to_vec(&config)?);

    for dep in &dependencies {
        hasher.update(dep.to_string().as_bytes());
        if let Location::Path(path) = dep
            && path.is_file()
        {
            hasher.update(std::fs::read(path)?);
        }
    }

    match &code {
        UnitCode::Inline { entry } => hasher.update(entry.source.as_bytes()),
        UnitCode::Module { entry, module } => {
            hasher.update(entry.source.as_bytes());
            hasher.update(std::fs::read(module)?);
        }
        UnitCode::Archive { bytes } => hasher.update(bytes),
    }

    Ok(DeployableUnit {
        kind,
        function_name,
        handler,
        dependencies,
        code,
        config,
        digest: to_hex(&hasher.finalize()),
    })
}

fn function_name(config: &RunConfig, derived: &str) -> String {
    match &config.name {
        Some(name) => name.clone(),
        None => derived.chars().take(MAX_FUNCTION_NAME).collect(),
    }
}

fn unit_size(unit: &DeployableUnit) -> usize {
    match &unit.code {
        UnitCode::Archive { bytes } => bytes.len(),
        UnitCode::Inline { entry } | UnitCode::Module { entry, .. } => entry.source.len(),
    }
}

/// Whether `code` looks like a callable function expression.
fn is_invocable(code: &str) -> bool {
    if code.is_empty() || !balanced(code) {
        return false;
    }

    let unprefixed = code.strip_prefix("async").map(str::trim_start).unwrap_or(code);
    if unprefixed.starts_with("function") {
        return unprefixed.contains('{');
    }

    match unprefixed.split_once("=>") {
        Some((params, body)) => {
            let params = params.trim();
            let simple_param = !params.is_empty()
                && params
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
            let param_list = params.starts_with('(') && params.ends_with(')');
            (simple_param || param_list) && !body.trim().is_empty()
        }
        None => false,
    }
}

fn balanced(code: &str) -> bool {
    let mut stack = Vec::new();
    for c in code.chars() {
        match c {
            '(' | '{' | '[' => stack.push(c),
            ')' => {
                if stack.pop() != Some('(') {
                    return false;
                }
            }
            '}' => {
                if stack.pop() != Some('{') {
                    return false;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty()
}

fn sanitize(stem: &str) -> String {
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(24)
        .collect()
}

fn hash_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
