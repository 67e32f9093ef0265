//! Build hook
//!
//! Glue between a compiler pipeline and the weaver: every module image the
//! compiler produces is woven in place when it passes the inclusion rules.

use crate::error::WeaveError;
#[cfg(feature = "logging")]
use crate::logging::{self, LoggingBuilder};
use crate::metadata::ModuleImage;
use crate::settings::{SettingsLoader, WeaverSettings};
use crate::synthesizer::{self, WeaveOutcome};
use std::path::{Path, PathBuf};

#[cfg(feature = "logging")]
use tracing::{debug, info, trace};

/// Severity of a compiler diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    Warning,
    Info,
}

/// A compiler diagnostic reported with a finished module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerMessage {
    pub kind: MessageKind,
    pub message: String,
}

impl CompilerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Warning,
            message: message.into(),
        }
    }
}

/// Weaves module images after compilation
#[derive(Debug, Clone, Default)]
pub struct BuildHook {
    settings: WeaverSettings,
}

impl BuildHook {
    /// Hook using the default inclusion rule
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: WeaverSettings) -> Self {
        Self { settings }
    }

    /// Hook configured from a settings file and the environment.
    ///
    /// Also installs the hook's subscriber when a subscriber feature is on.
    pub fn from_settings_file(path: impl AsRef<Path>) -> Result<Self, WeaveError> {
        let hook = SettingsLoader::new().with_path(path).load().map(Self::with_settings)?;

        #[cfg(feature = "logging")]
        hook.logging().init();

        Ok(hook)
    }

    /// Subscriber limited to this crate's events; `RUST_LOG` wins when set
    #[cfg(feature = "logging")]
    pub fn logging(&self) -> LoggingBuilder {
        let builder = logging::builder().injector_only().from_env();
        match &self.settings.log_filter {
            Some(filter) => builder.with_directive(filter.clone()),
            None => builder,
        }
    }

    pub fn settings(&self) -> &WeaverSettings {
        &self.settings
    }

    pub fn is_included(&self, module_path: &Path) -> bool {
        self.settings.is_included(module_path)
    }

    /// Weave a freshly compiled module unless compilation reported errors
    pub fn on_compilation_finished(
        &self,
        module_path: impl AsRef<Path>,
        messages: &[CompilerMessage],
    ) -> Result<WeaveOutcome, WeaveError> {
        let module_path = module_path.as_ref();
        if messages.iter().any(|message| message.kind == MessageKind::Error) {
            #[cfg(feature = "logging")]
            debug!(target: "tree_injector", module = %module_path.display(), "Compilation failed, skipping weaving");
            return Ok(WeaveOutcome::Unchanged);
        }

        self.weave_if_included(module_path)
    }

    /// Weave every existing module once; modules already processed are skipped
    pub fn weave_all<I, P>(&self, module_paths: I) -> Result<Vec<(PathBuf, WeaveOutcome)>, WeaveError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut outcomes = Vec::new();
        for module_path in module_paths {
            let module_path = module_path.as_ref();
            if !module_path.exists() {
                continue;
            }

            let outcome = match self.weave_if_included(module_path) {
                Err(error) if error.is_already_processed() => {
                    #[cfg(feature = "logging")]
                    trace!(target: "tree_injector", module = %module_path.display(), "Module already processed");
                    WeaveOutcome::Unchanged
                }
                result => result?,
            };
            outcomes.push((module_path.to_path_buf(), outcome));
        }
        Ok(outcomes)
    }

    fn weave_if_included(&self, module_path: &Path) -> Result<WeaveOutcome, WeaveError> {
        if !self.is_included(module_path) {
            #[cfg(feature = "logging")]
            trace!(target: "tree_injector", module = %module_path.display(), "Module excluded from weaving");
            return Ok(WeaveOutcome::Unchanged);
        }

        weave_file(module_path)
    }
}

/// Weave one module image and its symbols in place; nothing is written when
/// the module has nothing to inject.
pub fn weave_file(module_path: impl AsRef<Path>) -> Result<WeaveOutcome, WeaveError> {
    let module_path = module_path.as_ref();
    let mut image = ModuleImage::read(module_path)?;

    let outcome = synthesizer::weave(&mut image.module)?;
    if outcome == WeaveOutcome::Modified {
        image.write(module_path)?;

        #[cfg(feature = "logging")]
        info!(target: "tree_injector", module = %image.module.name, path = %module_path.display(), "Module woven");
    }
    Ok(outcome)
}
