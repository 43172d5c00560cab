use ingestor::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    sync::{Mutex, MutexGuard, OnceLock},
    time::Duration,
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("INGESTOR_"))
        .collect();
    for key in keys {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf())
        .load()
        .expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.log_format, "json");
    assert_eq!(cfg.fetch.max_concurrency, 3);
    assert_eq!(cfg.fetch.max_retry_after_ms, 300_000);
    assert_eq!(cfg.jobs.worker_concurrency, 4);
    assert_eq!(cfg.upsert.chunk_size, 500);
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "INGESTOR_FETCH_MAX_RETRIES=1\n");
    write_env_file(&temp_dir, ".env.test", "INGESTOR_FETCH_MAX_RETRIES=2\n");
    write_env_file(&temp_dir, ".env.test.local", "INGESTOR_FETCH_MAX_RETRIES=3\n");

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "INGESTOR_PROFILE=test\nINGESTOR_FETCH_MAX_RETRIES=9\nINGESTOR_LOG_FORMAT=pretty\n",
    );

    let cfg = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf())
        .load()
        .expect("layered config loads");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.fetch.max_retries, 3);
    assert_eq!(cfg.log_format, "pretty");
    clear_env();
}

#[test]
fn process_env_overrides_files() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "INGESTOR_UPSERT_CHUNK_SIZE=100\n");
    unsafe {
        env::set_var("INGESTOR_UPSERT_CHUNK_SIZE", "250");
        env::set_var("INGESTOR_JOBS_MAX_RUN_SECONDS", "60");
        env::set_var("INGESTOR_FETCH_MAX_RETRY_AFTER_MS", "90000");
    }

    let cfg = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf())
        .load()
        .unwrap();

    assert_eq!(cfg.upsert.chunk_size, 250);
    assert_eq!(cfg.jobs.max_run_seconds, 60);
    assert_eq!(cfg.fetch.max_retry_after_ms, 90_000);
    clear_env();
}

#[test]
fn per_source_fetch_overrides_are_parsed() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "INGESTOR_FETCH_OVERRIDE_CENSUS_ACS_MAX_CONCURRENCY=1\nINGESTOR_FETCH_OVERRIDE_FRED_MIN_INTERVAL_MS=1000\n",
    );

    let cfg = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf())
        .load()
        .unwrap();

    let census = cfg.fetch.limits_for("census_acs");
    assert_eq!(census.max_concurrency, 1);
    assert_eq!(census.min_interval, Duration::from_millis(250));

    let fred = cfg.fetch.limits_for("FRED");
    assert_eq!(fred.max_concurrency, 3);
    assert_eq!(fred.min_interval, Duration::from_millis(1000));
    clear_env();
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "INGESTOR_JOBS_POLL_INTERVAL_MS=5\n");
    let err = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf())
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidPollInterval { value: 5 }));

    write_env_file(
        &temp_dir,
        ".env",
        "INGESTOR_LOG_FORMAT=xml\n",
    );
    let err = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf())
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidLogFormat { .. }));
    clear_env();
}
