use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use multicam::config::PipelineConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "MULTICAM_CONFIG",
        "MULTICAM_DEVICES",
        "MULTICAM_MAX_BATCH",
        "MULTICAM_MODEL_PATH",
        "MULTICAM_BACKEND",
        "MULTICAM_TICK_MIN_MS",
        "MULTICAM_TICK_MAX_MS",
        "MULTICAM_DRAIN_TIMEOUT_MS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "capture": {
            "devices": ["stub://front", "stub://rear"],
            "width": 320,
            "height": 240,
            "failure_threshold": 3
        },
        "recovery": {
            "backoff_initial_ms": 100,
            "backoff_max_ms": 1600,
            "max_reconnect_attempts": 8
        },
        "batch": { "max_batch_size": 6, "max_in_flight": 3 },
        "tick": { "min_interval_ms": 30, "max_interval_ms": 120, "per_source_ms": 15 },
        "accelerator": { "backend": "stub", "score_threshold": 0.4 },
        "shutdown": { "drain_timeout_ms": 750 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("MULTICAM_CONFIG", file.path());
    std::env::set_var("MULTICAM_MAX_BATCH", "2");
    std::env::set_var("MULTICAM_TICK_MAX_MS", "90");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.capture.devices, vec!["stub://front", "stub://rear"]);
    assert_eq!(cfg.capture.width, 320);
    assert_eq!(cfg.capture.height, 240);
    assert_eq!(cfg.capture.failure_threshold, 3);
    assert_eq!(cfg.recovery.backoff_initial, Duration::from_millis(100));
    assert_eq!(cfg.recovery.backoff_max, Duration::from_millis(1600));
    assert_eq!(cfg.recovery.max_reconnect_attempts, Some(8));
    assert_eq!(cfg.batch.max_batch_size, 2);
    assert_eq!(cfg.batch.max_in_flight, 3);
    assert_eq!(cfg.tick.bounds.min, Duration::from_millis(30));
    assert_eq!(cfg.tick.bounds.max, Duration::from_millis(90));
    assert_eq!(cfg.tick.bounds.per_source, Duration::from_millis(15));
    assert_eq!(cfg.accelerator.score_threshold, 0.4);
    assert_eq!(cfg.accelerator.iou_threshold, 0.45);
    assert_eq!(cfg.shutdown.drain_timeout, Duration::from_millis(750));

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [capture]
        devices = ["stub://cam0"]
        target_fps = 12

        [accelerator]
        model_path = "models/yolo11n.onnx"
        fallback_model_path = "yolo11n.onnx"
        input_width = 320
        input_height = 320

        [metrics]
        report_interval_secs = 5
        nominal_fps = 12.0
    "#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = PipelineConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.capture.devices, vec!["stub://cam0"]);
    assert_eq!(cfg.capture.target_fps, 12);
    assert_eq!(cfg.accelerator.model_path.to_str(), Some("models/yolo11n.onnx"));
    assert_eq!(
        cfg.accelerator
            .fallback_model_path
            .as_deref()
            .and_then(|path| path.to_str()),
        Some("yolo11n.onnx")
    );
    assert_eq!(cfg.accelerator.input_width, 320);
    assert_eq!(cfg.metrics.report_interval, Duration::from_secs(5));
    assert_eq!(cfg.metrics.nominal_fps, 12.0);

    clear_env();
}

#[test]
fn env_devices_and_backend_override_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("MULTICAM_DEVICES", "stub://a, stub://b,,stub://c");
    std::env::set_var("MULTICAM_BACKEND", " Stub ");
    std::env::set_var("MULTICAM_MODEL_PATH", "/opt/models/det.onnx");

    let cfg = PipelineConfig::load().expect("load config");
    assert_eq!(cfg.capture.devices, vec!["stub://a", "stub://b", "stub://c"]);
    assert_eq!(cfg.accelerator.backend, "stub");
    assert_eq!(cfg.accelerator.model_path.to_str(), Some("/opt/models/det.onnx"));

    clear_env();
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("MULTICAM_MAX_BATCH", "0");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("MULTICAM_MAX_BATCH", "four");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("MULTICAM_TICK_MIN_MS", "500");
    std::env::set_var("MULTICAM_TICK_MAX_MS", "100");
    assert!(PipelineConfig::load().is_err());
    clear_env();
}

#[test]
fn reports_malformed_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"{ \"batch\": { \"max_batch_size\": \"lots\" } }")
        .expect("write config");
    let err = PipelineConfig::load_from(Some(file.path())).expect_err("must fail");
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
