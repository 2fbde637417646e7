use color_eyre::eyre::Result;
use config::Config;
use engine::Engine;
use registry::Registry;

use crate::common::init;

mod common;

const DOC: &str = r#"
outputs:
  - type: console
    name: main
    filters:
      - type: keep_levels
        config:
          levels: [error, warn]
  - type: console
    name: side
    sources: [s1]
"#;

fn topology(engine: &Engine) -> (bool, Vec<(String, usize, Vec<String>)>) {
    let status = {
        use api::StatusProvider;
        engine.state().status()
    };
    (
        status.running,
        status
            .pipelines
            .iter()
            .map(|p| (p.name.clone(), p.filters, p.sources.clone()))
            .collect(),
    )
}

/// Reloading the same configuration yields the same set of pipelines and
/// filters, and leaves the engine running.
#[tokio::test]
async fn reloading_the_same_config_is_idempotent() -> Result<()> {
    init();

    let registry = Registry::with_builtins();
    let config = Config::parse(DOC)?;

    let mut engine = Engine::from_config(&config, &registry)?;
    engine.start().await?;
    let before = topology(&engine);

    engine.reload(&config, &registry).await?;
    let after_first = topology(&engine);

    engine.reload(&config, &registry).await?;
    let after_second = topology(&engine);

    assert!(before.0 && after_first.0 && after_second.0);
    assert_eq!(before.1, after_first.1);
    assert_eq!(after_first.1, after_second.1);
    assert_eq!(
        after_second.1,
        vec![
            ("main".to_string(), 1, vec![]),
            ("side".to_string(), 0, vec!["s1".to_string()]),
        ]
    );

    engine.stop().await?;
    Ok(())
}

/// A reload swaps the topology: pipelines present only in the new
/// configuration exist afterwards, dropped ones are gone.
#[tokio::test]
async fn reload_swaps_the_topology() -> Result<()> {
    init();

    let registry = Registry::with_builtins();
    let config = Config::parse(DOC)?;
    let mut engine = Engine::from_config(&config, &registry)?;
    engine.start().await?;

    let slimmer = Config::parse("outputs:\n  - type: console\n    name: only\n")?;
    engine.reload(&slimmer, &registry).await?;

    let (_running, pipelines) = topology(&engine);
    assert_eq!(pipelines, vec![("only".to_string(), 0, vec![])]);

    engine.stop().await?;
    Ok(())
}

/// An invalid new configuration is rejected before the running topology is
/// touched.
#[tokio::test]
async fn invalid_reload_is_rejected_up_front() -> Result<()> {
    init();

    let registry = Registry::with_builtins();
    let config = Config::parse(DOC)?;
    let mut engine = Engine::from_config(&config, &registry)?;
    engine.start().await?;

    let broken = Config {
        outputs: vec![
            config::OutputDef {
                plugin_type: "console".to_string(),
                name: None,
                config: serde_yaml::Value::Null,
                sources: vec![],
                filters: vec![],
                supervisor: None,
            },
            config::OutputDef {
                plugin_type: "console".to_string(),
                name: None,
                config: serde_yaml::Value::Null,
                sources: vec![],
                filters: vec![],
                supervisor: None,
            },
        ],
        ..Config::default()
    };

    assert!(engine.reload(&broken, &registry).await.is_err());

    // The previous topology is still serving.
    let (running, pipelines) = topology(&engine);
    assert!(running);
    assert_eq!(pipelines.len(), 2);

    engine.stop().await?;
    Ok(())
}
