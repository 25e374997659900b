//! Exit status of the daemon binary

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

fn daemon() -> Command {
    Command::new(env!("CARGO_BIN_EXE_gpsd-tcp"))
}

#[test]
fn test_no_valid_listener_exits_with_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("gpsd-tcp.toml");
    std::fs::write(
        &config,
        r#"
[logging]
level = "error"

[modules]
dir = "/nonexistent/gpsd-tcp-modules"

[[listeners]]
address = "0.0.0.0"
port = 99999

[[listeners]]
address = "not-an-address"
port = 2947
"#,
    )
    .unwrap();

    let status = daemon().arg("--config").arg(&config).status().unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_broken_config_exits_with_config_status() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("gpsd-tcp.toml");
    std::fs::write(&config, "[relay]\nsession_queue = \"lots\"\n").unwrap();

    let output = daemon().arg("--config").arg(&config).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid TOML"));
}

#[test]
fn test_zero_queue_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("gpsd-tcp.json");
    std::fs::write(&config, r#"{"relay": {"session_queue": 0}}"#).unwrap();

    let status = daemon().arg("-c").arg(&config).status().unwrap();
    assert_eq!(status.code(), Some(2));
}

#[cfg(unix)]
#[test]
fn test_sigterm_during_startup_stops_modules() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let modules = dir.path().join("modules");
    std::fs::create_dir(&modules).unwrap();
    for name in ["first", "second"] {
        let path = modules.join(format!("{}.module", name));
        std::fs::write(
            &path,
            format!(
                "#!/bin/sh\n# GPSD_TCP_EXTENSION:{}\necho $$ > \"$MODULE_CONFIG_PIDFILE\"\nexec sleep 30\n",
                name
            ),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let pidfile = |name: &str| dir.path().join(format!("{}.pid", name));
    let config = dir.path().join("gpsd-tcp.toml");
    std::fs::write(
        &config,
        format!(
            r#"
[logging]
level = "error"

[modules]
dir = "{modules}"
startup_wait_ms = 1500
stop_grace_ms = 500

[modules.config.first]
pidfile = "{first}"

[modules.config.second]
pidfile = "{second}"

[[listeners]]
address = "127.0.0.1"
port = {port}
"#,
            modules = modules.display(),
            first = pidfile("first").display(),
            second = pidfile("second").display(),
            port = {
                let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                probe.local_addr().unwrap().port()
            },
        ),
    )
    .unwrap();

    let mut daemon = daemon()
        .arg("--config")
        .arg(&config)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // First module is up and still inside its startup window
    let started = Instant::now();
    while !pidfile("first").exists() {
        assert!(started.elapsed() < Duration::from_secs(10), "module never started");
        std::thread::sleep(Duration::from_millis(20));
    }
    std::thread::sleep(Duration::from_millis(200));
    kill(Pid::from_raw(daemon.id() as i32), Signal::SIGTERM).unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    let status = loop {
        if let Some(status) = daemon.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            let _ = daemon.kill();
            panic!("daemon did not exit after SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert!(status.success(), "daemon exit status: {:?}", status);

    for name in ["first", "second"] {
        let Ok(pid) = std::fs::read_to_string(pidfile(name)) else {
            continue;
        };
        let pid: i32 = pid.trim().parse().unwrap();
        assert!(
            kill(Pid::from_raw(pid), None).is_err(),
            "module {} (pid {}) outlived the daemon",
            name,
            pid
        );
    }
}
