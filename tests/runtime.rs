//! Runtime message handling end to end: host messages in, frames out.

mod common;

use std::time::Duration;

use common::{MockBoard, MockTransport};
use rewinder_runtime::config::Config;
use rewinder_runtime::dispatch::stages;
use rewinder_runtime::link::LinkError;
use rewinder_runtime::messages::{
    GateStatus, ReconnectRequest, RewindControl, RuntimeHealth, StageEvent, StagePhase,
};
use rewinder_runtime::motor::{DecayMode, RewindMode};
use rewinder_runtime::runtime::{Runtime, RuntimeError};

const CONFIG: &str = r#"
[link]
addresses = ["board0"]
connect_timeout_s = 0.5
health_interval_ms = 10
drain_timeout_s = 2.0

[[rewinder]]
index = 0
pin_a = 3
pin_b = 4

[[rewinder]]
index = 1
pin_a = 5
pin_b = 6
rewind_fast_speed = 0.8

# refers to a board that is not configured
[[rewinder]]
index = 2
pin_a = 7
pin_b = 8
device = 3
"#;

fn start() -> (Runtime, MockBoard) {
    let config: Config = CONFIG.parse().unwrap();
    let board = MockBoard::default();
    let transport = MockTransport::default().with_board("board0", &board);
    let runtime = Runtime::with_transport(&config, transport).unwrap();
    (runtime, board)
}

fn stage(name: &str, phase: StagePhase) -> StageEvent {
    StageEvent {
        stage: name.to_string(),
        phase,
    }
}

fn select(runtime: &mut Runtime, gate: usize) {
    runtime.on_gate(GateStatus {
        selected: Some(gate),
        available_from_buffer: false,
    });
}

fn drain(runtime: &Runtime) {
    runtime.link().drain(Duration::from_secs(2)).unwrap();
}

fn wait_paused(runtime: &mut Runtime) -> String {
    for _ in 0..100 {
        runtime.check_faults();
        if let RuntimeHealth::Paused { reason } = runtime.health() {
            return reason;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("runtime never paused");
}

#[test]
fn misconfigured_rewinder_is_skipped() {
    let (runtime, _board) = start();
    let ids: Vec<usize> = runtime.statuses().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(runtime.health(), RuntimeHealth::Ok);
}

#[test]
fn unreachable_board_is_fatal() {
    let config: Config = CONFIG.parse().unwrap();
    match Runtime::with_transport(&config, MockTransport::default()) {
        Err(RuntimeError::Link(LinkError::ConnectFailed { address, .. })) => {
            assert_eq!(address, "board0");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("runtime started without its board"),
    }
}

#[test]
fn stage_bracket_sends_mode_then_stop() {
    let (mut runtime, board) = start();
    select(&mut runtime, 1);

    runtime.on_stage(stage(stages::COURSE_UNLOAD, StagePhase::Enter));
    let status = runtime.statuses().into_iter().find(|s| s.id == 1).unwrap();
    assert_eq!(status.mode, RewindMode::RewindFast);
    assert_eq!(status.velocity, -0.8);
    assert!(status.connected);

    runtime.on_stage(stage(stages::COURSE_UNLOAD, StagePhase::Exit));
    drain(&runtime);

    let frames = board.frames();
    assert_eq!(frames.len(), 2);

    let run = frames[0];
    assert_eq!((run.pin_a, run.pin_b), (5, 6));
    assert_eq!(run.speed, -102);
    assert_eq!(run.decay_mode, DecayMode::Slow);
    // below full power, so the board gets a kick-start
    assert_eq!(run.startup_speed, 127);
    assert_eq!(run.startup_duration, 0.1);

    let stop = frames[1];
    assert_eq!(stop.speed, 0);
    assert_eq!(stop.decay_mode, DecayMode::Fast);
    assert_eq!(stop.startup_speed, 0);
}

#[test]
fn unmapped_stage_sends_nothing() {
    let (mut runtime, board) = start();
    select(&mut runtime, 0);
    runtime.on_stage(stage("Loading gate", StagePhase::Enter));
    runtime.on_stage(stage("Loading gate", StagePhase::Exit));
    drain(&runtime);
    assert!(board.frames().is_empty());
}

#[test]
fn manual_control_by_name() {
    let (mut runtime, board) = start();
    runtime.on_control(RewindControl {
        id: 0,
        mode: "Load_Slow".to_string(),
    });
    runtime.on_control(RewindControl {
        id: 0,
        mode: "sideways".to_string(),
    });
    drain(&runtime);

    let frames = board.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].speed, 25); // 0.2 * 127
    assert_eq!(frames[0].decay_mode, DecayMode::Slow);
    assert_eq!(runtime.health(), RuntimeHealth::Ok);
}

#[test]
fn lost_board_pauses_until_reconnected() {
    let (mut runtime, board) = start();
    board.unplug();

    let reason = wait_paused(&mut runtime);
    assert!(reason.contains("board0"), "{reason}");
    assert!(runtime.statuses().iter().all(|s| !s.connected));

    runtime.on_control(RewindControl {
        id: 0,
        mode: "rewind_slow".to_string(),
    });
    assert!(board.frames().is_empty());

    board.plug();
    runtime.on_reconnect(ReconnectRequest { device: 0 });
    assert_eq!(runtime.health(), RuntimeHealth::Ok);

    runtime.on_control(RewindControl {
        id: 0,
        mode: "rewind_slow".to_string(),
    });
    drain(&runtime);

    // one stop per rewinder on the board, then the requested mode
    let frames = board.frames();
    assert_eq!(frames.len(), 3);
    assert!(frames[..2].iter().all(|f| f.speed == 0));
    assert_eq!(frames[2].speed, -51); // -0.4 * 127
}

#[test]
fn reconnect_forgets_commands_sent_before_the_loss() {
    let (mut runtime, board) = start();
    select(&mut runtime, 0);
    runtime.on_stage(stage(stages::COURSE_UNLOAD, StagePhase::Enter));
    drain(&runtime);

    board.unplug();
    wait_paused(&mut runtime);
    // the stop cannot reach the board
    runtime.on_stage(stage(stages::COURSE_UNLOAD, StagePhase::Exit));

    board.plug();
    runtime.on_reconnect(ReconnectRequest { device: 0 });
    assert_eq!(runtime.health(), RuntimeHealth::Ok);
    let status = runtime.statuses().into_iter().find(|s| s.id == 0).unwrap();
    assert_eq!(status.mode, RewindMode::Stop);
    assert_eq!(status.velocity, 0.0);

    runtime.on_stage(stage(stages::COURSE_UNLOAD, StagePhase::Enter));
    drain(&runtime);

    let speeds: Vec<i8> = board
        .frames()
        .iter()
        .filter(|f| f.pin_a == 3)
        .map(|f| f.speed)
        .collect();
    assert_eq!(speeds, vec![-127, 0, -127]);
    let status = runtime.statuses().into_iter().find(|s| s.id == 0).unwrap();
    assert_eq!(status.mode, RewindMode::RewindFast);
}

#[test]
fn watchdog_releases_stale_stage() {
    let (mut runtime, _board) = start();
    select(&mut runtime, 0);
    runtime.on_stage(stage(stages::REVERSE_HOME_GATE, StagePhase::Enter));

    runtime.watchdog(Duration::from_secs(60));
    assert!(runtime.dispatcher().active_stage().is_some());

    std::thread::sleep(Duration::from_millis(5));
    runtime.watchdog(Duration::ZERO);
    assert!(runtime.dispatcher().active_stage().is_none());
    assert_eq!(
        runtime.dispatcher().rewinder(0).unwrap().mode(),
        RewindMode::Stop
    );
}

#[test]
fn shutdown_stops_running_rewinder() {
    let (mut runtime, board) = start();
    select(&mut runtime, 0);
    runtime.on_stage(stage(stages::COURSE_UNLOAD, StagePhase::Enter));

    runtime.shutdown();

    let frames = board.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].speed, -127);
    assert_eq!(frames[0].startup_speed, 0);
    assert_eq!(frames[1].speed, 0);
    assert_eq!(board.closes(), 1);
}
