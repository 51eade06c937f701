//! The unpacking pipeline.
//!
//! The [`Unpacker`] is the main entry point. It runs the steps in a fixed order:
//!
//! 1. **Load**: read the container, resolve references, load the live artifact
//! 2. **Native helpers**: bind the first usable `Protect*.dll` next to the module
//! 3. **Activate**: run the module initializer
//! 4. **Discover**: find the lookup fields and seed the junk set
//! 5. **Recover methods**: restore every virtualized body
//! 6. **Recover strings**: replace string lookups with literals
//! 7. **Clean up**: remove the protection's types, members, stubs and resources
//! 8. **Save**: write `<stem>-unpacked.<ext>` next to the input
//!
//! Only loading, a missing method lookup, and saving are fatal. Every other failure is recorded
//! in the [`UnpackReport`] and the run continues.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use log::{info, warn};

use crate::{
    deobfuscation::{
        cleanup::cleanup,
        config::UnpackConfig,
        junk::JunkSet,
        methods::MethodRecoverer,
        patterns::{find_lookup_entry, LookupEntry},
        report::UnpackReport,
        strings::StringRecoverer,
    },
    emulation::{
        ExecutionBridge, ExecutionHost, Interceptor, LoadedTarget, MappedLoader, NativeLoader,
        SandboxHost, DEFAULT_SENTINEL,
    },
    image::ImageAccess,
    metadata::{Container, ContainerAccess, MethodAttributes, WriteMode},
    output::write_container,
    Error, Result,
};

/// Unpacks protected modules.
///
/// # Example
///
/// ```rust,no_run
/// use ilunpack::deobfuscation::{UnpackConfig, Unpacker};
/// use std::path::Path;
///
/// let unpacker = Unpacker::new(UnpackConfig::default());
/// let report = unpacker.run(Path::new("Protected.exe"))?;
/// println!("{}", report.summary());
/// # Ok::<(), ilunpack::Error>(())
/// ```
pub struct Unpacker {
    access: Box<dyn ContainerAccess>,
    host: Box<dyn ExecutionHost>,
    loader: Box<dyn NativeLoader>,
    interceptor: Arc<Interceptor>,
    config: UnpackConfig,
}

impl Default for Unpacker {
    fn default() -> Self {
        Self::new(UnpackConfig::default())
    }
}

impl Unpacker {
    /// Create an unpacker reading image files and executing them in the sandbox host.
    ///
    /// The process-wide [`Interceptor`] is used unless the configured sentinel differs from
    /// [`DEFAULT_SENTINEL`], in which case a private one is created.
    #[must_use]
    pub fn new(config: UnpackConfig) -> Self {
        let interceptor = if config.resolution_sentinel == DEFAULT_SENTINEL {
            Interceptor::global()
        } else {
            Arc::new(Interceptor::new(config.resolution_sentinel.clone()))
        };

        Unpacker {
            access: Box::new(ImageAccess::new(config.framework_prefixes.clone())),
            host: Box::new(SandboxHost),
            loader: Box::new(MappedLoader::default()),
            interceptor,
            config,
        }
    }

    /// Replace the container access layer.
    #[must_use]
    pub fn with_access(mut self, access: impl ContainerAccess + 'static) -> Self {
        self.access = Box::new(access);
        self
    }

    /// Replace the execution host.
    #[must_use]
    pub fn with_host(mut self, host: impl ExecutionHost + 'static) -> Self {
        self.host = Box::new(host);
        self
    }

    /// Replace the native helper loader.
    #[must_use]
    pub fn with_loader(mut self, loader: impl NativeLoader + 'static) -> Self {
        self.loader = Box::new(loader);
        self
    }

    /// Use `interceptor` instead of the default one.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &UnpackConfig {
        &self.config
    }

    /// The interceptor armed around method lookups.
    #[must_use]
    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    /// Load the module at `path`.
    ///
    /// # Errors
    /// Returns [`Error::Load`] if the module cannot be loaded.
    pub fn load(&self, path: &Path) -> Result<LoadedTarget> {
        ExecutionBridge::new(
            self.access.as_ref(),
            self.host.as_ref(),
            Arc::clone(&self.interceptor),
        )
        .load(path)
    }

    /// Recover and clean `target` in place.
    ///
    /// # Errors
    /// Returns [`Error::RequiredFieldMissing`] if the module has no method lookup, and any error
    /// of the module initializer or of preparing the lookups.
    pub fn unpack(&self, target: &mut LoadedTarget) -> Result<UnpackReport> {
        let start = Instant::now();
        let config = &self.config;
        let mut report = UnpackReport::new(&target.path);
        report.unresolved = target.unresolved_errors();

        if config.load_native_helpers {
            report.native_helper = target
                .load_native_helpers(
                    self.loader.as_ref(),
                    &config.helper_prefix,
                    &config.helper_suffix,
                )
                .map(|helper| helper.name.clone());
        }

        target.activate()?;

        let methods = find_lookup_entry(
            &target.container,
            &config.method_field,
            &config.lookup_method,
        )
        .ok_or_else(|| Error::RequiredFieldMissing(config.method_field.clone()))?;
        let strings = find_lookup_entry(
            &target.container,
            &config.string_field,
            &config.lookup_method,
        );
        if strings.is_none() {
            info!("No {} field, strings are not protected", config.string_field);
        }

        let mut junk = seed_junk(&target.container, &methods, strings.as_ref());

        let recovery = MethodRecoverer::new(
            &target.artifact,
            &self.interceptor,
            &methods,
            config.stub_helper_offset,
            config.lookup_timeout,
        )?
        .run(&mut target.container, &mut junk);
        report.stubs = recovery.stubs;
        report.methods_recovered = recovery.recovered.len();
        report.stub_failures = recovery.failures;

        if let Some(entry) = strings.as_ref().filter(|_| config.recover_strings) {
            match StringRecoverer::new(
                &target.artifact,
                entry,
                &config.lookup_method,
                config.lookup_timeout,
            ) {
                Ok(recoverer) => {
                    let strings = recoverer.run(&mut target.container);
                    report.string_sites = strings.sites;
                    report.strings_recovered = strings.recovered;
                    report.string_failures = strings.failures;
                }
                Err(error) => {
                    warn!("String lookup unavailable: {error}");
                    report.warnings.push(format!("String lookup unavailable: {error}"));
                }
            }
        }

        if config.cleanup.any_enabled() {
            report.cleanup = cleanup(&mut target.container, &mut junk, config);
            report.warnings.extend(report.cleanup.warnings.iter().cloned());
        }

        report.elapsed = start.elapsed();
        Ok(report)
    }

    /// Write the unpacked module next to its input, returning the output path.
    ///
    /// # Errors
    /// Returns [`Error::Serialization`] if the module cannot be written.
    pub fn save(&self, target: &LoadedTarget) -> Result<PathBuf> {
        write_container(
            self.access.as_ref(),
            &target.container,
            &target.path,
            &self.config.output_suffix,
            WriteMode::for_image(target.container.image_kind),
        )
    }

    /// Load, unpack and save the module at `path`.
    ///
    /// # Errors
    /// Returns the fatal errors of [`Unpacker::load`], [`Unpacker::unpack`] and
    /// [`Unpacker::save`].
    pub fn run(&self, path: &Path) -> Result<UnpackReport> {
        let mut target = self.load(path)?;
        let mut report = self.unpack(&mut target)?;
        report.output = Some(self.save(&target)?);
        info!("Unpacked {} in {:?}", path.display(), report.elapsed);
        Ok(report)
    }
}

/// The lookup fields and the global type's one-letter private static methods.
fn seed_junk(container: &Container, methods: &LookupEntry, strings: Option<&LookupEntry>) -> JunkSet {
    let mut junk = JunkSet::new();
    junk.add_field(methods.field);
    if let Some(strings) = strings {
        junk.add_field(strings.field);
    }

    let global = container.global_type_token();
    for method in container
        .methods
        .iter()
        .filter(|m| m.declaring_type == global)
        .filter(|m| m.flags.is_private() && m.flags.contains(MethodAttributes::STATIC))
        .filter(|m| m.name.chars().count() == 1)
    {
        junk.add_method(method.token);
    }
    junk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deobfuscation::junk::JunkEntry,
        emulation::InterceptionState,
        test::protected_image,
    };

    fn unpacker() -> Unpacker {
        Unpacker::new(UnpackConfig::strict())
            .with_interceptor(Arc::new(Interceptor::default()))
    }

    #[test]
    fn unpacks_fixture_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = protected_image();
        let path = fixture.write_to(dir.path());

        let unpacker = unpacker();
        let mut target = unpacker.load(&path).unwrap();
        let report = unpacker.unpack(&mut target).unwrap();

        assert!(report.is_complete(), "{:?}", report.stub_failures);
        assert_eq!(report.stubs, fixture.originals.len());
        assert_eq!(report.methods_recovered, fixture.originals.len());
        assert_eq!(report.strings_recovered, 1);
        assert!(report.native_helper.is_none());
        assert_eq!(unpacker.interceptor().state(), InterceptionState::Idle);

        let container = &target.container;
        for (token, original) in &fixture.originals {
            assert_eq!(container.method(*token).unwrap().body.as_ref(), Some(original));
        }
        for helper in &fixture.helpers {
            assert!(container.type_def(*helper).is_none());
        }
        let global = container.global_type().unwrap();
        assert!(global.fields.is_empty());
        assert!(container.static_constructor(global.token).is_none());
        assert!(container.resources.iter().all(|r| !r.name.starts_with("Protect")));
        assert!(container.methods.iter().all(|m| m.impl_map.is_none()));
    }

    #[test]
    fn missing_method_lookup_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = protected_image();
        let container = &mut fixture.image.container;
        let field = container
            .fields
            .iter()
            .find(|f| f.name == "Invoke")
            .map(|f| f.token)
            .unwrap();
        container.remove_field(field);
        let path = fixture.write_to(dir.path());

        let unpacker = unpacker();
        let mut target = unpacker.load(&path).unwrap();
        let error = unpacker.unpack(&mut target).unwrap_err();
        assert!(matches!(error, Error::RequiredFieldMissing(ref name) if name == "Invoke"));
        assert_eq!(error.to_string(), "Cannot find Invoke field!");
    }

    #[test]
    fn junk_seeding() {
        let fixture = protected_image();
        let container = &fixture.image.container;
        let methods = find_lookup_entry(container, "Invoke", "Invoke").unwrap();
        let strings = find_lookup_entry(container, "String", "Invoke").unwrap();

        let junk = seed_junk(container, &methods, Some(&strings));
        assert!(junk.contains(&JunkEntry::Field(methods.field)));
        assert!(junk.contains(&JunkEntry::Field(strings.field)));
        let global = container.global_type_token();
        let one_letter = container
            .methods
            .iter()
            .filter(|m| m.declaring_type == global && m.name.len() == 1)
            .count();
        assert_eq!(junk.len(), 2 + one_letter);
    }

    #[test]
    fn public_one_letter_methods_are_kept() {
        let fixture = protected_image();
        let mut container = fixture.image.container.clone();
        let global = container.global_type_token();
        let public = container.add_method(
            global,
            "z",
            MethodAttributes::PUBLIC | MethodAttributes::STATIC,
            None,
        );
        let methods = find_lookup_entry(&container, "Invoke", "Invoke").unwrap();

        let junk = seed_junk(&container, &methods, None);
        assert!(!junk.contains(&JunkEntry::Method(public)));
    }

    #[test]
    fn disabled_cleanup_keeps_protection() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = protected_image();
        let path = fixture.write_to(dir.path());

        let mut config = UnpackConfig::strict();
        config.cleanup = crate::deobfuscation::config::CleanupConfig::none();
        let unpacker =
            Unpacker::new(config).with_interceptor(Arc::new(Interceptor::default()));
        let mut target = unpacker.load(&path).unwrap();
        let before = target.container.types.len();
        let report = unpacker.unpack(&mut target).unwrap();

        assert!(report.cleanup.is_empty());
        assert_eq!(target.container.types.len(), before);
        assert_eq!(report.methods_recovered, fixture.originals.len());
    }

    #[test]
    fn run_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = protected_image().write_to(dir.path());

        let report = unpacker().run(&path).unwrap();
        let output = report.output.unwrap();
        assert_eq!(output, dir.path().join("Sample-unpacked.exe"));
        let written = crate::image::read_image(&output).unwrap();
        assert!(written.runtime.is_none());
    }
}
