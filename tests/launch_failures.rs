use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use procmon::{Error, LaunchOptions, Monitor};

mod support;
use support::*;

fn launch_reason(options: LaunchOptions) -> String {
    let recorder = Recorder::new();

    match Monitor::launch(recorder, options) {
        Err(Error::Launch { reason }) => reason,
        Err(other) => panic!("expected a launch error, got {other:?}"),
        Ok(_) => panic!("launch unexpectedly succeeded"),
    }
}

#[test]
#[timeout(60000)]
fn test_exec_failure_is_reported() {
    let _guard = serial_guard();

    let options = LaunchOptions::new("/nonexistent/definitely-not-a-program");
    assert_eq!(launch_reason(options), "Child exec failed.");
}

#[test]
#[timeout(60000)]
fn test_bad_working_directory_is_reported() {
    let _guard = serial_guard();

    let mut options = LaunchOptions::new("/bin/true");
    options.working_dir = Some("/nonexistent/definitely-not-a-dir".into());
    assert_eq!(
        launch_reason(options),
        "Child failed to set working directory."
    );
}

#[test]
#[timeout(60000)]
fn test_bad_stdin_redirection_is_reported() {
    let _guard = serial_guard();

    let mut options = LaunchOptions::new("/bin/true");
    options.stdin = Some("/nonexistent/definitely-not-a-file".into());
    assert_eq!(launch_reason(options), "Child open stdin failed.");
}

#[test]
#[timeout(60000)]
fn test_nul_bytes_in_arguments_are_rejected() -> Result<()> {
    let mut options = LaunchOptions::new("/bin/true");
    options.argv = vec!["true".into(), "bad\0arg".into()];

    let recorder = Recorder::new();
    let err = Monitor::launch(recorder, options)
        .err()
        .expect("launched with a NUL in argv");
    assert!(matches!(err, Error::Launch { .. }));

    Ok(())
}
