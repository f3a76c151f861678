use kiln_core::plugin::PluginEntry;
use kiln_core::{entry, ApplyOutcome, PluginApi, Service, ServiceOptions, StaticModules, UnitRef};
use serde_json::{Map, Value};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Runs an async test body against a fresh fixture.
#[allow(dead_code)]
pub fn run<F, Fut>(test: F)
where
    F: FnOnce(Fixture) -> Fut,
    Fut: Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(test(Fixture::new()));
}

/// A throwaway project directory whose units are served from memory.
pub struct Fixture {
    pub dir: TempDir,
    pub modules: Arc<StaticModules>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    #[allow(dead_code)]
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name":"fixture-app"}"#).unwrap();

        Fixture {
            dir,
            modules: Arc::new(StaticModules::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[allow(dead_code)]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Creates `<root>/<name>.js` backed by `unit` and returns its reference.
    #[allow(dead_code)]
    pub fn unit(&self, name: &str, unit: Arc<dyn PluginEntry>) -> UnitRef {
        let path = self.root().join(format!("{name}.js"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, "").unwrap();
        self.modules.insert(path, unit);
        UnitRef::from(format!("./{name}"))
    }

    /// A unit that logs its id when applied and returns `outcome`.
    #[allow(dead_code)]
    pub fn recording(&self, name: &str, outcome: ApplyOutcome) -> UnitRef {
        let log = self.log.clone();
        self.unit(
            name,
            entry(move |api: PluginApi| {
                let log = log.clone();
                let outcome = outcome.clone();
                async move {
                    log.lock().unwrap().push(api.id());
                    Ok(outcome)
                }
            }),
        )
    }

    #[allow(dead_code)]
    pub fn options(&self) -> ServiceOptions {
        ServiceOptions::new(self.root()).loader(self.modules.clone())
    }

    #[allow(dead_code)]
    pub fn service(&self, presets: Vec<UnitRef>, plugins: Vec<UnitRef>) -> Service {
        Service::new(self.options().presets(presets).plugins(plugins)).unwrap()
    }

    #[allow(dead_code)]
    pub fn service_with_config(&self, presets: Vec<UnitRef>, plugins: Vec<UnitRef>, config: Value) -> Service {
        let config = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Service::new(
            self.options()
                .presets(presets)
                .plugins(plugins)
                .user_config(config),
        )
        .unwrap()
    }

    #[allow(dead_code)]
    pub fn logged(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}
