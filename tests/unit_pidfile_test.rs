use pgward::core::keeper::pidfile::{PidFile, PidFileContents, pid_is_alive};
use tempfile::TempDir;

#[test]
fn test_parse_layout() {
    let text = "4242\nnode-active 4242\npostgres 4242\nlistener 4242\n";
    let contents = PidFile::parse(text).unwrap();
    assert_eq!(contents.supervisor_pid, 4242);
    assert_eq!(
        contents.services,
        vec![
            ("node-active".to_string(), 4242),
            ("postgres".to_string(), 4242),
            ("listener".to_string(), 4242),
        ]
    );
}

#[test]
fn test_parse_rejects_garbage() {
    assert!(PidFile::parse("").is_none());
    assert!(PidFile::parse("not-a-pid\n").is_none());
    assert!(PidFile::parse("42\nno-pid-here\n").is_none());
}

#[test]
fn test_write_then_read() {
    let dir = TempDir::new().unwrap();
    let pid_file = PidFile::new(dir.path().join("pgward.pid"));
    let services = vec![("node-active".to_string(), 100), ("postgres".to_string(), 100)];
    pid_file.write(100, &services).unwrap();

    let contents = pid_file.read().unwrap();
    assert_eq!(
        contents,
        PidFileContents {
            supervisor_pid: 100,
            services,
        }
    );
}

#[test]
fn test_own_pid_is_alive() {
    assert!(pid_is_alive(std::process::id() as i32));
    assert!(!pid_is_alive(0));
    assert!(!pid_is_alive(-1));
}

#[test]
fn test_single_instance_refused_while_owner_lives() {
    let dir = TempDir::new().unwrap();
    let pid_file = PidFile::new(dir.path().join("pgward.pid"));
    // Our own PID is definitely alive.
    pid_file
        .write(std::process::id() as i32, &[])
        .unwrap();
    assert!(pid_file.check_single_instance().is_err());
}

#[test]
fn test_stale_pid_file_is_cleaned_up() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgward.pid");
    let pid_file = PidFile::new(&path);
    // PID i32::MAX is (realistically) never a live process.
    pid_file.write(i32::MAX, &[]).unwrap();
    pid_file.check_single_instance().unwrap();
    assert!(!path.exists());
}

#[test]
fn test_absent_pid_file_is_fine() {
    let dir = TempDir::new().unwrap();
    let pid_file = PidFile::new(dir.path().join("pgward.pid"));
    pid_file.check_single_instance().unwrap();
}

#[test]
fn test_remove() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgward.pid");
    let pid_file = PidFile::new(&path);
    pid_file.write(1234567, &[]).unwrap();
    pid_file.remove();
    assert!(!path.exists());
}
