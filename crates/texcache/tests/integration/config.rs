use std::time::Duration;

use texcache::caching::Priority;
use texcache::config::Config;

#[test]
fn test_config_from_file() {
    texcache_test::setup();
    let dir = texcache_test::tempdir();
    let path = texcache_test::write_config(
        dir.path(),
        r#"
logging:
  level: warn
cache:
  recommended_working_set: 2147483648
  max_entry_count: 100
  sweep_interval: 30s
  priorities:
    disposable:
      max_idle_time: 10s
"#,
    );

    let config = Config::get(Some(path.as_path())).unwrap();
    assert_eq!(config.cache.budget(), 512 * 1024 * 1024);
    assert_eq!(config.cache.max_entry_count, 100);
    assert_eq!(config.cache.sweep_interval, Duration::from_secs(30));
    assert_eq!(
        config.cache.priorities.policy(Priority::Disposable).max_idle_time,
        Duration::from_secs(10)
    );
}

#[test]
fn test_missing_config_file() {
    let dir = texcache_test::tempdir();
    let result = Config::get(Some(dir.path().join("nope.yml").as_path()));
    assert!(result.is_err());
}
