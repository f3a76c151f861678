use kiln_core::builtin::{self, STANDARD_METHODS, VERSION};
use kiln_core::{entry, kiln_error, ApplyOutcome, Handler, PluginApi, UnitRef};
use serde_json::{json, Value};
use std::fs;

mod fixture;

fn builtin_preset() -> Vec<UnitRef> {
    vec![UnitRef::from(builtin::preset())]
}

#[test]
fn test_version_and_alias() {
    fixture::run(|fixture| async move {
        let service = fixture.service(builtin_preset(), vec![]);
        assert_eq!(service.run("v", Value::Null).await.unwrap(), json!(VERSION));
        assert_eq!(service.run_command("version", Value::Null).await.unwrap(), json!(VERSION));
    });
}

#[test]
fn test_help_lists_commands() {
    fixture::run(|fixture| async move {
        let service = fixture.service(builtin_preset(), vec![]);
        let out = service.run("help", Value::Null).await.unwrap();
        assert_eq!(out, json!(["generate", "help", "version"]));
        assert!(service.has_presets(&[builtin::BUILTIN_PRESET_ID]));
        assert!(service.has_plugins(&["@@/registerMethods", "@@/commands/help"]));
    });
}

#[test]
fn test_builtin_config_keys_are_claimed() {
    fixture::run(|fixture| async move {
        let service = fixture.service_with_config(
            builtin_preset(),
            vec![],
            json!({ "singular": true, "outputPath": "www" }),
        );
        service.init().await.unwrap();
        assert_eq!(service.paths().abs_output_path, Some(fixture.root().join("www")));
        assert_eq!(service.paths().abs_pages_path, Some(fixture.root().join("page")));

        let service = fixture.service_with_config(builtin_preset(), vec![], json!({ "singular": "yes" }));
        let err = service.init().await.unwrap_err();
        assert_eq!(kiln_error(&err).map(|e| e.kind()), Some("ConfigValidationError"));
    });
}

#[test]
fn test_standard_methods_are_available_to_plugins() {
    fixture::run(|fixture| async move {
        let plugin = fixture.unit(
            "watch",
            entry(|api: PluginApi| async move {
                for name in STANDARD_METHODS {
                    assert!(api.resolve(name).is_some(), "{name} should be registered");
                }
                api.call(
                    "addTmpGenerateWatcherPaths",
                    Handler::add(|_args| async { Ok(json!("/extra/watched")) }),
                )?;
                Ok(ApplyOutcome::default())
            }),
        );

        let service = fixture.service(builtin_preset(), vec![plugin]);
        let out = service.run("generate", Value::Null).await.unwrap();

        let Value::Array(watched) = out else {
            panic!("generate should return a list");
        };
        assert_eq!(watched.len(), 7);
        assert_eq!(
            watched.first(),
            Some(&json!(fixture.root().join("pages").to_string_lossy()))
        );
        assert_eq!(watched.last(), Some(&json!("/extra/watched")));
    });
}

#[test]
fn test_write_tmp_file() {
    fixture::run(|fixture| async move {
        let results = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = results.clone();
        let plugin = fixture.unit(
            "writer",
            entry(move |api: PluginApi| {
                let record = record.clone();
                async move {
                    let early = api
                        .call("writeTmpFile", json!({ "path": "core/early.ts", "content": "" }))
                        .unwrap_err();
                    record
                        .lock()
                        .unwrap()
                        .push(json!(kiln_error(&early).map(|e| e.kind())));

                    let handle = api.clone();
                    api.call(
                        "onPluginReady",
                        Handler::event(move |_args| {
                            let api = handle.clone();
                            let record = record.clone();
                            async move {
                                let file = json!({ "path": "core/plugin.ts", "content": "export {};" });
                                let first = api.call("writeTmpFile", file.clone())?;
                                let second = api.call("writeTmpFile", file)?;
                                let plain = api.call(
                                    "writeTmpFile",
                                    json!({ "path": "core/raw.ts", "content": "x", "skipTSCheck": false }),
                                )?;
                                let mut results = record.lock().unwrap();
                                results.extend([first, second, plain]);
                                Ok(())
                            }
                        }),
                    )?;
                    Ok(ApplyOutcome::default())
                }
            }),
        );

        let service = fixture.service(builtin_preset(), vec![plugin]);
        service.init().await.unwrap();

        assert_eq!(
            *results.lock().unwrap(),
            vec![json!("StageViolationError"), json!(true), json!(false), json!(true)]
        );
        let tmp = fixture.root().join(".kiln").join("core");
        assert_eq!(
            fs::read_to_string(tmp.join("plugin.ts")).unwrap(),
            "// @ts-nocheck\nexport {};"
        );
        assert_eq!(fs::read_to_string(tmp.join("raw.ts")).unwrap(), "x");
    });
}
