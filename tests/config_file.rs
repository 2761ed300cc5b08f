use rayos_dataflow::{DataflowError, Queue, RuntimeConfig, Scheduler};
use std::io::Write;

#[test]
fn config_file_drives_scheduler() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "trace_kernels = true").unwrap();
    writeln!(file, "thread_name_prefix = \"cfg-worker\"").unwrap();
    writeln!(file, "max_running_items = 2").unwrap();

    let config = RuntimeConfig::load(file.path()).unwrap();
    assert!(config.trace_kernels);
    assert_eq!(config.max_running_items, 2);

    let scheduler = Scheduler::new(config);
    let queue = Queue::new(&scheduler);
    let handle = queue
        .submit(|cgh| {
            cgh.single_task("named", || {
                let name = std::thread::current().name().map(str::to_string);
                match name {
                    Some(n) if n.starts_with("cfg-worker-") => Ok(()),
                    other => Err(rayos_dataflow::KernelError::failed(format!(
                        "unexpected worker name {:?}",
                        other
                    ))),
                }
            });
            Ok(())
        })
        .unwrap();

    handle.wait().unwrap();
    queue.release().unwrap();
}

#[test]
fn missing_or_malformed_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();

    let err = RuntimeConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, DataflowError::Config(_)));

    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "max_running_items = \"many\"").unwrap();
    let err = RuntimeConfig::load(&path).unwrap_err();
    assert!(matches!(err, DataflowError::Config(_)));
}
