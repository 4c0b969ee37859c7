use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use procmon::{LaunchOptions, Monitor, ProcessMessage, Signal};

mod support;
use support::*;

const WAIT: Duration = Duration::from_secs(5);

fn launch_sleeping(recorder: &std::sync::Arc<Recorder>) -> Result<Monitor> {
    let mut options = LaunchOptions::new("/bin/sleep");
    options.argv = vec!["sleep".into(), "60".into()];

    let monitor = Monitor::launch(recorder.clone(), options)?;

    recorder
        .wait_for_message(|m| matches!(m, ProcessMessage::Trace { .. }), WAIT)
        .expect("no initial trace event");

    Ok(monitor)
}

#[test]
#[timeout(60000)]
fn test_self_sent_signal_is_an_acknowledgment() -> Result<()> {
    let _guard = serial_guard();

    let recorder = Recorder::new();
    let monitor = launch_sleeping(&recorder)?;
    let pid = monitor.pid();

    monitor.resume(pid, None)?;

    // A signal from the monitor's own process is an ack, not news.
    nix::sys::signal::kill(pid, Signal::SIGUSR2)?;

    let delivered = recorder
        .wait_for_message(|m| matches!(m, ProcessMessage::SignalDelivered { .. }), WAIT)
        .expect("no signal-delivered event");
    assert_eq!(
        delivered,
        ProcessMessage::SignalDelivered {
            pid,
            signo: libc::SIGUSR2
        }
    );

    monitor.kill()?;

    Ok(())
}

#[test]
#[timeout(60000)]
fn test_foreign_signal_is_reported() -> Result<()> {
    let _guard = serial_guard();

    let recorder = Recorder::new();
    let monitor = launch_sleeping(&recorder)?;
    let pid = monitor.pid();

    monitor.resume(pid, None)?;

    // Sent by another process entirely: plain signal news.
    let status = Command::new("sh")
        .args(["-c", &format!("kill -USR1 {pid}")])
        .status()?;
    assert!(status.success());

    let signal = recorder
        .wait_for_message(|m| matches!(m, ProcessMessage::Signal { .. }), WAIT)
        .expect("no signal event");
    assert_eq!(
        signal,
        ProcessMessage::Signal {
            pid,
            signo: libc::SIGUSR1
        }
    );

    monitor.kill()?;

    Ok(())
}

#[cfg(target_arch = "x86_64")]
#[test]
#[timeout(60000)]
fn test_wild_jump_reports_a_crash() -> Result<()> {
    use procmon::{CrashReason, RegisterValue};

    let _guard = serial_guard();

    let recorder = Recorder::new();
    let monitor = launch_sleeping(&recorder)?;
    let pid = monitor.pid();

    // Point the program counter into unmapped space and let it run: the
    // fetch faults with a kernel-origin SIGSEGV at address zero.
    let rip_offset = memoffset::offset_of!(libc::user_regs_struct, rip) as u64;
    monitor.write_register_value(pid, rip_offset, "rip", RegisterValue::U64(0))?;
    monitor.resume(pid, None)?;

    let crash = recorder
        .wait_for_message(|m| matches!(m, ProcessMessage::Crash { .. }), WAIT)
        .expect("no crash event");
    assert_eq!(
        crash,
        ProcessMessage::Crash {
            pid,
            reason: CrashReason::InvalidAddress,
            signo: libc::SIGSEGV,
            fault_addr: 0
        }
    );

    monitor.kill()?;

    Ok(())
}

#[test]
#[timeout(60000)]
fn test_resume_forwards_the_pending_signal() -> Result<()> {
    let _guard = serial_guard();

    let recorder = Recorder::new();
    let monitor = launch_sleeping(&recorder)?;
    let pid = monitor.pid();

    monitor.resume(pid, None)?;

    nix::sys::signal::kill(pid, Signal::SIGTERM)?;

    recorder
        .wait_for_message(
            |m| matches!(m, ProcessMessage::SignalDelivered { signo, .. } if *signo == libc::SIGTERM),
            WAIT,
        )
        .expect("no event for SIGTERM");

    // Deliver it for real; sleep dies from SIGTERM, parking at the exit
    // trap on the way out.
    monitor.resume(pid, Some(Signal::SIGTERM))?;

    recorder
        .wait_for_message(|m| matches!(m, ProcessMessage::Limbo { .. }), WAIT)
        .expect("no limbo event for the dying tracee");

    monitor.resume(pid, None)?;

    let exit = recorder
        .wait_for_message(|m| matches!(m, ProcessMessage::Exit { .. }), WAIT)
        .expect("no exit event");
    assert_eq!(
        exit,
        ProcessMessage::Exit {
            pid,
            status: libc::SIGTERM
        }
    );

    Ok(())
}
