//! Unit discovery: turns preset/plugin references into descriptors.
//!
//! References are drawn from four sources, unioned in this order:
//! 1. The explicit list handed to the service
//! 2. The `KILN_PRESETS` / `KILN_PLUGINS` comma lists
//! 3. Dependency-manifest entries matching the naming convention
//! 4. The `presets` / `plugins` arrays of user configuration
//!
//! Each resolved path then receives an id and a configuration key.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::KilnError;
use crate::package::{find_package_manifest, PackageManifest, PACKAGE_MANIFEST};

use super::loader::ModuleLoader;
use super::types::{PluginDescriptor, PluginKind, UnitRef};

pub const PRESETS_ENV: &str = "KILN_PRESETS";
pub const PLUGINS_ENV: &str = "KILN_PLUGINS";

/// Directory of the built-in plugins, shortened to `@@` in ids.
const BUILTIN_PLUGINS_PREFIX: &str = "@kiln/preset-built-in/lib/plugins";
const BUILTIN_ID_PREFIX: &str = "@@";
const OWN_SCOPE: &str = "@kiln/";
const EXTENSIONS: &[&str] = &["js", "ts"];

fn convention(kind: PluginKind) -> &'static Regex {
    static PRESET: OnceLock<Regex> = OnceLock::new();
    static PLUGIN: OnceLock<Regex> = OnceLock::new();
    match kind {
        PluginKind::Preset => {
            PRESET.get_or_init(|| Regex::new(r"^(@kiln/|kiln-)preset-").expect("valid preset pattern"))
        }
        PluginKind::Plugin => {
            PLUGIN.get_or_init(|| Regex::new(r"^(@kiln/|kiln-)plugin-").expect("valid plugin pattern"))
        }
    }
}

/// Returns true if a dependency name follows the convention for `kind`.
pub fn is_plugin_or_preset(kind: PluginKind, name: &str) -> bool {
    let re = convention(kind);
    if name.starts_with('@') {
        name.split('/').nth(1).is_some_and(|rest| re.is_match(rest)) || re.is_match(name)
    } else {
        re.is_match(name)
    }
}

/// Splits on non-alphanumerics and lower-to-upper boundaries, then joins in
/// camel case: `css-loader` -> `cssLoader`.
pub fn camel_case(input: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in input.chars() {
        if !ch.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.push(ch);
    }
    if !current.is_empty() {
        words.push(current);
    }

    let mut out = String::new();
    for (i, word) in words.iter().enumerate() {
        let lower = word.to_lowercase();
        if i == 0 {
            out.push_str(&lower);
            continue;
        }
        let mut chars = lower.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Camel-cases each dot-separated segment: `webpack.css-loader` ->
/// `webpack.cssLoader`.
pub fn name_to_key(name: &str) -> String {
    name.split('.').map(camel_case).collect::<Vec<_>>().join(".")
}

/// Derives a key from a package name, stripping foreign scopes and the
/// naming-convention prefix.
pub fn pkg_name_to_key(pkg_name: &str, kind: PluginKind) -> String {
    let mut name = pkg_name;
    if name.starts_with('@') && !name.starts_with(OWN_SCOPE) {
        name = name.split('/').nth(1).unwrap_or(name);
    }
    name_to_key(&convention(kind).replace(name, ""))
}

/// Renders a path with forward slashes.
pub fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Lexically removes `.` and resolves `..` components.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn with_extension_appended(path: &Path, ext: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_os_string();
    raw.push(".");
    raw.push(ext);
    PathBuf::from(raw)
}

fn resolve_as_file(base: &Path) -> Option<PathBuf> {
    if base.is_file() {
        return Some(base.to_path_buf());
    }
    EXTENSIONS
        .iter()
        .map(|ext| with_extension_appended(base, ext))
        .find(|candidate| candidate.is_file())
}

fn resolve_as_directory(base: &Path) -> Option<PathBuf> {
    if !base.is_dir() {
        return None;
    }
    let manifest = base.join(PACKAGE_MANIFEST);
    if manifest.is_file() {
        if let Ok(pkg) = PackageManifest::load(&manifest) {
            if let Some(main) = pkg.main.as_deref() {
                if let Some(found) = resolve_as_file(&base.join(main)) {
                    return Some(found);
                }
            }
        }
    }
    resolve_as_file(&base.join("index"))
}

fn resolve_path(base: &Path) -> Option<PathBuf> {
    let base = normalize(base);
    resolve_as_file(&base)
        .or_else(|| resolve_as_directory(&base))
        .map(|found| normalize(&found))
}

/// Everything a resolution pass reads.
#[derive(Debug, Clone, Copy)]
pub struct ResolveSources<'a> {
    pub explicit: &'a [UnitRef],
    /// Raw comma list from the environment.
    pub env: Option<&'a str>,
    pub pkg: &'a PackageManifest,
    /// The `presets` or `plugins` array of user configuration.
    pub user_config: &'a [Value],
}

/// One entry of a resolution pass, before identity assignment.
#[derive(Debug, Clone)]
pub enum Resolved {
    Path(PathBuf),
    Descriptor(PluginDescriptor),
}

/// Resolves references and assigns unit identities.
#[derive(Clone)]
pub struct PluginDiscovery {
    cwd: PathBuf,
    loader: Arc<dyn ModuleLoader>,
}

impl PluginDiscovery {
    pub fn new(cwd: &Path, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            cwd: normalize(cwd),
            loader,
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Resolves one reference to an existing file.
    ///
    /// Relative and absolute references are taken from `cwd`. Bare names are
    /// looked up in `node_modules` of `cwd` and then of each parent directory;
    /// the first hit wins.
    pub fn resolve_reference(&self, kind: PluginKind, reference: &str) -> Result<PathBuf> {
        let found = if reference.starts_with('.') || Path::new(reference).is_absolute() {
            resolve_path(&self.cwd.join(reference))
        } else {
            self.cwd
                .ancestors()
                .find_map(|dir| resolve_path(&dir.join("node_modules").join(reference)))
        };

        found.ok_or_else(|| {
            KilnError::UnresolvedReference(format!(
                "Cannot resolve {kind} '{reference}' from {}",
                self.cwd.display()
            ))
            .into()
        })
    }

    /// Collects the references for `kind` from every source, in precedence
    /// order, de-duplicated by path.
    pub fn resolve(&self, kind: PluginKind, sources: ResolveSources<'_>) -> Result<Vec<Resolved>> {
        let mut out = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut push = |resolved: Resolved, seen: &mut HashSet<PathBuf>| {
            let path = match &resolved {
                Resolved::Path(p) => p.clone(),
                Resolved::Descriptor(d) => d.path.clone(),
            };
            if seen.insert(path) {
                out.push(resolved);
            }
        };

        for reference in sources.explicit {
            match reference {
                UnitRef::Path(path) => {
                    let resolved = self.resolve_reference(kind, path)?;
                    push(Resolved::Path(resolved), &mut seen);
                }
                UnitRef::Descriptor(descriptor) => {
                    push(Resolved::Descriptor(descriptor.clone()), &mut seen);
                }
            }
        }

        for reference in sources.env.unwrap_or_default().split(',') {
            let reference = reference.trim();
            if reference.is_empty() {
                continue;
            }
            let resolved = self.resolve_reference(kind, reference)?;
            push(Resolved::Path(resolved), &mut seen);
        }

        for name in sources.pkg.dependency_names() {
            if is_plugin_or_preset(kind, name) {
                let resolved = self.resolve_reference(kind, name)?;
                push(Resolved::Path(resolved), &mut seen);
            }
        }

        for value in sources.user_config {
            let Value::String(reference) = value else {
                return Err(KilnError::UnresolvedReference(format!(
                    "{kind} resolved failed, please check your {kind}s config, it must be array of string.\nError {kind} config: {value}"
                ))
                .into());
            };
            let resolved = self.resolve_reference(kind, reference)?;
            push(Resolved::Path(resolved), &mut seen);
        }

        debug!("{} references resolved: {:?}", kind, out);
        Ok(out)
    }

    /// Resolves references and turns each into a descriptor.
    pub fn resolve_units(
        &self,
        kind: PluginKind,
        sources: ResolveSources<'_>,
    ) -> Result<Vec<PluginDescriptor>> {
        self.resolve(kind, sources)?
            .into_iter()
            .map(|resolved| match resolved {
                Resolved::Path(path) => self.path_to_descriptor(kind, &path),
                Resolved::Descriptor(mut descriptor) => {
                    descriptor.kind = kind;
                    Ok(descriptor)
                }
            })
            .collect()
    }

    /// Converts `UnitRef`s registered at runtime (`registerPresets`, preset
    /// returns) into descriptors.
    pub fn to_descriptor(&self, kind: PluginKind, reference: &UnitRef) -> Result<PluginDescriptor> {
        match reference {
            UnitRef::Descriptor(descriptor) => {
                let mut descriptor = descriptor.clone();
                descriptor.kind = kind;
                Ok(descriptor)
            }
            UnitRef::Path(path) => {
                let resolved = self.resolve_reference(kind, path)?;
                self.path_to_descriptor(kind, &resolved)
            }
        }
    }

    /// Assigns identity to a resolved path.
    ///
    /// The id is the package name for a package's main entry, `./<relative>`
    /// inside the working directory, `<package>/<relative>` inside another
    /// package, and the absolute path otherwise.
    pub fn path_to_descriptor(&self, kind: PluginKind, path: &Path) -> Result<PluginDescriptor> {
        let path = normalize(path);
        if !path.exists() {
            return Err(KilnError::UnresolvedReference(format!(
                "{kind} {} not exists, pathToObj failed",
                path.display()
            ))
            .into());
        }

        let manifest_path = find_package_manifest(&path);
        let pkg = manifest_path
            .as_deref()
            .and_then(|p| PackageManifest::load(p).ok());
        let pkg_root = manifest_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf);

        let pkg_main_name = match (&pkg, &pkg_root) {
            (Some(pkg), Some(root)) if normalize(&root.join(pkg.main_entry())) == path => {
                pkg.name.clone()
            }
            _ => None,
        };

        let mut id = if let Some(name) = &pkg_main_name {
            name.clone()
        } else if let Ok(relative) = path.strip_prefix(&self.cwd) {
            format!("./{}", to_slash(relative))
        } else if let (Some(name), Some(root)) = (pkg.as_ref().and_then(|p| p.name.as_ref()), &pkg_root) {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            to_slash(&Path::new(name).join(relative))
        } else {
            to_slash(&path)
        };
        id = id.replacen(BUILTIN_PLUGINS_PREFIX, BUILTIN_ID_PREFIX, 1);
        if let Some(stripped) = id.strip_suffix(".js") {
            id = stripped.to_string();
        }

        let key = match &pkg_main_name {
            Some(name) => pkg_name_to_key(name, kind),
            None => name_to_key(
                &path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
        };

        let loader = self.loader.clone();
        let entry_path = path.clone();
        debug!("Assigned {} id '{}' (key '{}') to {:?}", kind, id, key, path);
        Ok(PluginDescriptor::new(id, key, path, kind, move || {
            loader
                .load(&entry_path)
                .with_context(|| format!("Register {kind} {} failed", entry_path.display()))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::loader::StaticModules;
    use rstest::rstest;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn discovery(cwd: &Path) -> PluginDiscovery {
        PluginDiscovery::new(cwd, Arc::new(StaticModules::new()))
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[rstest]
    #[case("initial-state", "initialState")]
    #[case("webpack.css-loader", "webpack.cssLoader")]
    #[case("registerMethods", "registerMethods")]
    #[case("built_in", "builtIn")]
    fn test_name_to_key(#[case] name: &str, #[case] key: &str) {
        assert_eq!(name_to_key(name), key);
    }

    #[rstest]
    #[case("kiln-plugin-dva", PluginKind::Plugin, "dva")]
    #[case("@kiln/plugin-layout", PluginKind::Plugin, "layout")]
    #[case("@acme/kiln-preset-react", PluginKind::Preset, "react")]
    #[case("kiln-preset-mobile.ui", PluginKind::Preset, "mobile.ui")]
    fn test_pkg_name_to_key(#[case] name: &str, #[case] kind: PluginKind, #[case] key: &str) {
        assert_eq!(pkg_name_to_key(name, kind), key);
    }

    #[rstest]
    #[case(PluginKind::Plugin, "kiln-plugin-foo", true)]
    #[case(PluginKind::Plugin, "@kiln/plugin-foo", true)]
    #[case(PluginKind::Plugin, "@acme/kiln-plugin-foo", true)]
    #[case(PluginKind::Plugin, "kiln-preset-foo", false)]
    #[case(PluginKind::Preset, "@kiln/preset-built-in", true)]
    #[case(PluginKind::Preset, "react", false)]
    fn test_convention(#[case] kind: PluginKind, #[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_plugin_or_preset(kind, name), expected);
    }

    #[test]
    fn test_project_relative_id() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("plugins").join("css-modules.js"));

        let d = discovery(temp.path())
            .path_to_descriptor(PluginKind::Plugin, &temp.path().join("plugins/css-modules.js"))
            .unwrap();
        assert_eq!(d.id, "./plugins/css-modules");
        assert_eq!(d.key, "cssModules");
    }

    #[test]
    fn test_package_main_id_and_key() {
        let temp = TempDir::new().unwrap();
        let pkg_dir = temp.path().join("node_modules").join("kiln-plugin-foo");
        fs::create_dir_all(pkg_dir.join("lib")).unwrap();
        fs::write(
            pkg_dir.join(PACKAGE_MANIFEST),
            r#"{"name":"kiln-plugin-foo","main":"./lib/index.js"}"#,
        )
        .unwrap();
        touch(&pkg_dir.join("lib/index.js"));
        touch(&pkg_dir.join("lib/extra.js"));

        let discovery = discovery(temp.path());
        let main = discovery
            .resolve_reference(PluginKind::Plugin, "kiln-plugin-foo")
            .unwrap();
        assert_eq!(main, pkg_dir.join("lib/index.js"));

        let d = discovery.path_to_descriptor(PluginKind::Plugin, &main).unwrap();
        assert_eq!(d.id, "kiln-plugin-foo");
        assert_eq!(d.key, "foo");
    }

    #[test]
    fn test_bare_name_resolves_from_parent_node_modules() {
        let temp = TempDir::new().unwrap();
        let app = temp.path().join("packages").join("app");
        fs::create_dir_all(&app).unwrap();
        let pkg_dir = temp.path().join("node_modules").join("kiln-plugin-foo");
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::write(pkg_dir.join(PACKAGE_MANIFEST), r#"{"name":"kiln-plugin-foo"}"#).unwrap();
        touch(&pkg_dir.join("index.js"));

        let discovery = discovery(&app);
        let found = discovery
            .resolve_reference(PluginKind::Plugin, "kiln-plugin-foo")
            .unwrap();
        assert_eq!(found, pkg_dir.join("index.js"));

        let d = discovery.path_to_descriptor(PluginKind::Plugin, &found).unwrap();
        assert_eq!(d.id, "kiln-plugin-foo");
        assert_eq!(d.key, "foo");
    }

    #[test]
    fn test_nearest_node_modules_wins() {
        let temp = TempDir::new().unwrap();
        let app = temp.path().join("app");
        touch(&app.join("node_modules").join("kiln-plugin-foo").join("index.js"));
        touch(&temp.path().join("node_modules").join("kiln-plugin-foo").join("index.js"));

        let found = discovery(&app)
            .resolve_reference(PluginKind::Plugin, "kiln-plugin-foo")
            .unwrap();
        assert_eq!(found, app.join("node_modules/kiln-plugin-foo/index.js"));
    }

    #[test]
    fn test_foreign_package_relative_id() {
        let project = TempDir::new().unwrap();
        let vendor = TempDir::new().unwrap();
        let root = vendor.path().join("@kiln").join("preset-built-in");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(PACKAGE_MANIFEST), r#"{"name":"@kiln/preset-built-in"}"#).unwrap();
        let file = root.join("lib/plugins/registerMethods.js");
        touch(&file);

        let d = discovery(project.path())
            .path_to_descriptor(PluginKind::Plugin, &file)
            .unwrap();
        assert_eq!(d.id, "@@/registerMethods");
        assert_eq!(d.key, "registerMethods");
    }

    #[test]
    fn test_missing_path_is_unresolved() {
        let temp = TempDir::new().unwrap();
        let err = discovery(temp.path())
            .path_to_descriptor(PluginKind::Preset, &temp.path().join("nope.js"))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<KilnError>().map(KilnError::kind),
            Some("UnresolvedReferenceError")
        );
    }

    #[test]
    fn test_resolve_unions_sources_and_dedups() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("a.js"));
        touch(&temp.path().join("b.ts"));
        touch(&temp.path().join("c.js"));
        let pkg_dir = temp.path().join("node_modules").join("kiln-preset-x");
        touch(&pkg_dir.join("index.js"));
        let pkg = PackageManifest {
            dependencies: [("kiln-preset-x".to_string(), "1".to_string())].into(),
            ..Default::default()
        };

        let explicit = vec![UnitRef::from("./a")];
        let user = vec![json!("./c.js"), json!("./a.js")];
        let resolved = discovery(temp.path())
            .resolve(
                PluginKind::Preset,
                ResolveSources {
                    explicit: &explicit,
                    env: Some("./b, ,./a"),
                    pkg: &pkg,
                    user_config: &user,
                },
            )
            .unwrap();

        let paths: Vec<PathBuf> = resolved
            .into_iter()
            .map(|r| match r {
                Resolved::Path(p) => p,
                Resolved::Descriptor(d) => d.path,
            })
            .collect();
        assert_eq!(
            paths,
            vec![
                temp.path().join("a.js"),
                temp.path().join("b.ts"),
                pkg_dir.join("index.js"),
                temp.path().join("c.js"),
            ]
        );
    }

    #[test]
    fn test_non_string_reference_is_echoed() {
        let temp = TempDir::new().unwrap();
        let user = vec![json!({ "path": "./a" })];
        let err = discovery(temp.path())
            .resolve(
                PluginKind::Plugin,
                ResolveSources {
                    explicit: &[],
                    env: None,
                    pkg: &PackageManifest::default(),
                    user_config: &user,
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains(r#"{"path":"./a"}"#));
    }
}
