//! Configuration for the unpacking pipeline.
//!
//! The defaults describe the protection as it is found in the wild: sentinel names, the stub
//! layout and the native helper naming. Presets trade completeness for speed or strictness.

use std::time::Duration;

/// Configuration for the unpacker.
#[derive(Debug, Clone)]
pub struct UnpackConfig {
    /// Name of the global field holding the method lookup delegate (default: `Invoke`).
    pub method_field: String,

    /// Name of the global field holding the string lookup delegate (default: `String`).
    pub string_field: String,

    /// Name of the lookup method on the delegate type (default: `Invoke`).
    pub lookup_method: String,

    /// Runtime frame name redirected during method lookups (default: `InvokeMethod`).
    pub resolution_sentinel: String,

    /// Instruction index in a stub whose operand names the helper type (default: 3).
    pub stub_helper_offset: usize,

    /// Literal marking protection-only methods whose referenced type is removed too
    /// (default: `P0`).
    pub junk_marker: String,

    /// Call opening the static constructor fragment (default: `GetIUnknownForObject`).
    pub cctor_window_start: String,

    /// Call closing the static constructor fragment (default: `Release`).
    pub cctor_window_end: String,

    /// Native modules whose P/Invoke stubs are removed (default: `Protect32.dll`,
    /// `Protect64.dll`).
    pub native_helpers: Vec<String>,

    /// File name prefix of native helpers and embedded helper resources (default: `Protect`).
    pub helper_prefix: String,

    /// File name suffix of native helpers and embedded helper resources (default: `.dll`).
    pub helper_suffix: String,

    /// Suffix appended to the input's file stem for the output (default: `-unpacked`).
    pub output_suffix: String,

    /// Upper bound for a single lookup, `None` to run lookups inline without a bound
    /// (default: 30 seconds).
    pub lookup_timeout: Option<Duration>,

    /// Assembly name prefixes treated as always resolvable (default: `mscorlib`, `System`,
    /// `Microsoft`, `netstandard`).
    pub framework_prefixes: Vec<String>,

    /// Load native helpers before activation (default: true).
    pub load_native_helpers: bool,

    /// Recover encrypted strings (default: true).
    pub recover_strings: bool,

    /// Post-recovery cleanup configuration.
    pub cleanup: CleanupConfig,
}

/// Configuration for post-recovery cleanup.
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct CleanupConfig {
    /// Remove collected protection fields, methods and helper types (default: true).
    pub remove_junk: bool,

    /// Remove the protection fragment from the global static constructor (default: true).
    pub clean_static_constructor: bool,

    /// Remove P/Invoke stubs bound to the native helpers (default: true).
    pub remove_native_stubs: bool,

    /// Remove embedded native helper resources (default: true).
    pub remove_helper_resources: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            remove_junk: true,
            clean_static_constructor: true,
            remove_native_stubs: true,
            remove_helper_resources: true,
        }
    }
}

impl CleanupConfig {
    /// Cleanup that leaves the container as recovery left it.
    #[must_use]
    pub fn none() -> Self {
        Self {
            remove_junk: false,
            clean_static_constructor: false,
            remove_native_stubs: false,
            remove_helper_resources: false,
        }
    }

    /// Returns true if any cleanup step is enabled.
    #[must_use]
    pub fn any_enabled(&self) -> bool {
        self.remove_junk
            || self.clean_static_constructor
            || self.remove_native_stubs
            || self.remove_helper_resources
    }
}

impl Default for UnpackConfig {
    fn default() -> Self {
        Self {
            method_field: "Invoke".to_string(),
            string_field: "String".to_string(),
            lookup_method: "Invoke".to_string(),
            resolution_sentinel: "InvokeMethod".to_string(),
            stub_helper_offset: 3,
            junk_marker: "P0".to_string(),
            cctor_window_start: "GetIUnknownForObject".to_string(),
            cctor_window_end: "Release".to_string(),
            native_helpers: vec!["Protect32.dll".to_string(), "Protect64.dll".to_string()],
            helper_prefix: "Protect".to_string(),
            helper_suffix: ".dll".to_string(),
            output_suffix: "-unpacked".to_string(),
            lookup_timeout: Some(Duration::from_secs(30)),
            framework_prefixes: vec![
                "mscorlib".to_string(),
                "System".to_string(),
                "Microsoft".to_string(),
                "netstandard".to_string(),
            ],
            load_native_helpers: true,
            recover_strings: true,
            cleanup: CleanupConfig::default(),
        }
    }
}

impl UnpackConfig {
    /// Short lookup bound, for batch runs over many files.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            lookup_timeout: Some(Duration::from_secs(5)),
            load_native_helpers: false,
            ..Self::default()
        }
    }

    /// Lookups run inline on the calling thread with no bound.
    ///
    /// A hung lookup hangs the run, but nothing is abandoned mid-call.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            lookup_timeout: None,
            ..Self::default()
        }
    }

    /// Returns true if `module` names one of the native helpers, ignoring ASCII case.
    #[must_use]
    pub fn is_native_helper(&self, module: &str) -> bool {
        self.native_helpers
            .iter()
            .any(|name| name.eq_ignore_ascii_case(module))
    }

    /// Returns true if `name` follows the helper naming convention, ignoring ASCII case.
    #[must_use]
    pub fn is_helper_name(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        name.starts_with(&self.helper_prefix.to_ascii_lowercase())
            && name.ends_with(&self.helper_suffix.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = UnpackConfig::default();
        assert_eq!(config.stub_helper_offset, 3);
        assert_eq!(config.resolution_sentinel, "InvokeMethod");
        assert!(config.cleanup.any_enabled());
        assert!(!CleanupConfig::none().any_enabled());
    }

    #[test]
    fn presets() {
        assert!(UnpackConfig::strict().lookup_timeout.is_none());
        assert!(!UnpackConfig::fast().load_native_helpers);
        assert_eq!(
            UnpackConfig::fast().lookup_timeout,
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn helper_names() {
        let config = UnpackConfig::default();
        assert!(config.is_native_helper("protect64.dll"));
        assert!(!config.is_native_helper("kernel32.dll"));
        assert!(config.is_helper_name("Protect64.dll"));
        assert!(config.is_helper_name("PROTECT.DLL"));
        assert!(!config.is_helper_name("Protect64.exe"));
        assert!(!config.is_helper_name("App.Protect.dll"));
    }
}
