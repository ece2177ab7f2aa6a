//! End-to-end controller scenarios, driven through a scripted board.

mod common;

use common::{frames_of_type, parse_tx, profile, BridgeSim, SimMachine};

use brewos_controller::control::ControlState;
use brewos_controller::safety::SafetyFlags;
use brewos_controller::Controller;
use brewos_protocol::message::{
    alarm, Ack, Alarm, Boiler, Boot, ConfigSnapshot, EnvConfig, Handshake, HeatingStrategy,
    Message, Mode, MsgType, ResultCode, SetMode, SetTemp, Severity, Status,
};

fn step_to(ctrl: &mut Controller<SimMachine>, t_end: u32) {
    while ctrl.machine().now < t_end {
        ctrl.machine_mut().now += 100;
        ctrl.poll();
    }
}

/// S1: the boot burst is BOOT, CONFIG, ENV_CONFIG, then STATUS on the
/// 500 ms cadence.
#[test]
fn boot_sequence_and_status_cadence() {
    let machine = SimMachine::commissioned();
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();
    step_to(&mut ctrl, 1_000);

    let frames = parse_tx(&ctrl.machine().tx);
    assert!(frames.len() >= 5);

    assert_eq!(frames[0].msg_type, MsgType::Boot as u8);
    let boot = Boot::decode(&frames[0].payload).unwrap();
    assert_eq!((boot.fw_major, boot.fw_minor, boot.fw_patch), (1, 0, 0));
    assert_eq!(boot.machine_type, 1);
    assert_eq!((boot.pcb_major, boot.pcb_minor), (1, 0));

    assert_eq!(frames[1].msg_type, MsgType::Config as u8);
    let config = ConfigSnapshot::decode(&frames[1].payload).unwrap();
    assert_eq!(config.brew_setpoint_dc, 930);
    assert_eq!(config.steam_setpoint_dc, 1450);
    assert_eq!(config.strategy, HeatingStrategy::Sequential);

    assert_eq!(frames[2].msg_type, MsgType::EnvConfig as u8);
    let env = EnvConfig::decode(&frames[2].payload).unwrap();
    assert_eq!(env.nominal_voltage, 230);
    assert!((env.max_current_a - 16.0).abs() < 0.01);

    // Two status frames inside the first second (t = 500 and t = 1000).
    let statuses = frames_of_type(&frames, MsgType::Status);
    assert_eq!(statuses.len(), 2);
    let status = Status::decode(&statuses[1].payload).unwrap();
    assert_eq!(status.state, ControlState::Idle.code() as u8);
    assert_eq!(status.brew_setpoint_dc, 930);
    assert_eq!(status.uptime_ms, 1_000);
}

/// S2: four commands back-to-back while the tick is not running: three
/// queue, the fourth bounces with NACK BUSY, the queued ones ACK later.
#[test]
fn backpressure_nacks_the_fourth_command() {
    let machine = SimMachine::commissioned();
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();
    let announced = ctrl.machine().tx.len();

    let mut bridge = BridgeSim::new();
    for temp in [900, 910, 920, 930] {
        let frame = bridge.frame(&Message::SetTemp(SetTemp {
            target: Boiler::Brew,
            temp_dc: temp,
        }));
        ctrl.machine_mut().push_frame(&frame);
    }

    // Drain without a tick: commands pile up in the queue.
    ctrl.machine_mut().now = 50;
    ctrl.poll();

    let frames = parse_tx(&ctrl.machine().tx[announced..]);
    let nacks = frames_of_type(&frames, MsgType::Nack);
    assert_eq!(nacks.len(), 1);
    let nack = Ack::decode(&nacks[0].payload).unwrap();
    assert_eq!(nack.cmd_seq, bridge.last_seq());
    assert_eq!(nack.result, ResultCode::Busy);
    assert!(frames_of_type(&frames, MsgType::Ack).is_empty());

    // The next tick works the queue off; all three succeed.
    ctrl.machine_mut().now = 150;
    ctrl.poll();
    let frames = parse_tx(&ctrl.machine().tx[announced..]);
    let acks = frames_of_type(&frames, MsgType::Ack);
    assert_eq!(acks.len(), 3);
    for ack in &acks {
        assert_eq!(Ack::decode(&ack.payload).unwrap().result, ResultCode::Success);
    }
    // Last accepted write wins.
    assert_eq!(ctrl.config().brew_setpoint_dc, 920);
}

/// S4 plus properties 8/9: a single 132 °C sample forces safe state on
/// the next tick; 119 °C plus an explicit reset leaves it.
#[test]
fn thermal_runaway_trips_and_recovers() {
    let machine = SimMachine::commissioned();
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();
    step_to(&mut ctrl, 200);
    assert_eq!(ctrl.state(), ControlState::Idle);

    ctrl.machine_mut().sensors.brew_ntc_c = 132.0;
    let before = ctrl.machine().tx.len();
    step_to(&mut ctrl, 300);

    assert_eq!(ctrl.state(), ControlState::Safe);
    assert_eq!(ctrl.machine().brew_duty, 0);
    assert_eq!(ctrl.machine().steam_duty, 0);
    assert_eq!(ctrl.machine().pump_duty, 0);
    assert!(!ctrl.machine().solenoid);
    assert_eq!(ctrl.machine().beeps, vec![3]);
    assert!(ctrl.safety_flags() & SafetyFlags::OVER_TEMP != 0);

    let frames = parse_tx(&ctrl.machine().tx[before..]);
    let alarms = frames_of_type(&frames, MsgType::Alarm);
    let over_temp = alarms
        .iter()
        .map(|f| Alarm::decode(&f.payload).unwrap())
        .find(|a| a.code == alarm::BREW_OVER_TEMP)
        .expect("over-temp alarm frame");
    assert_eq!(over_temp.severity, Severity::Critical);
    assert!(over_temp.active);

    // 121 °C holds the latch (hysteresis not yet satisfied).
    ctrl.machine_mut().sensors.brew_ntc_c = 121.0;
    step_to(&mut ctrl, 400);
    assert!(!ctrl.safety_reset());
    assert_eq!(ctrl.state(), ControlState::Safe);

    // 119 °C satisfies the 10 K hysteresis; one reset call releases it.
    ctrl.machine_mut().sensors.brew_ntc_c = 119.0;
    step_to(&mut ctrl, 500);
    assert!(ctrl.safety_reset());
    step_to(&mut ctrl, 700);
    assert_eq!(ctrl.state(), ControlState::Idle);
}

/// Property 10 at the link level: exactly one SENSOR_FAULT alarm frame
/// after ten invalid samples, none on the eleventh, a clear on recovery.
#[test]
fn sensor_fault_alarm_fires_once() {
    let machine = SimMachine::commissioned();
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();
    step_to(&mut ctrl, 100);

    ctrl.machine_mut().sensors.brew_ntc_c = f32::NAN;
    step_to(&mut ctrl, 1_200); // eleven invalid samples

    let frames = parse_tx(&ctrl.machine().tx);
    let raises: Vec<_> = frames_of_type(&frames, MsgType::Alarm)
        .iter()
        .map(|f| Alarm::decode(&f.payload).unwrap())
        .filter(|a| a.code == alarm::BREW_NTC_OPEN && a.active)
        .collect();
    assert_eq!(raises.len(), 1);
    assert_eq!(ctrl.state(), ControlState::Safe);
    assert!(ctrl.safety_flags() & SafetyFlags::SENSOR_FAULT != 0);

    // Recovery clears the alarm and permits reset.
    ctrl.machine_mut().sensors.brew_ntc_c = 93.0;
    step_to(&mut ctrl, 1_300);
    let frames = parse_tx(&ctrl.machine().tx);
    assert!(frames_of_type(&frames, MsgType::Alarm)
        .iter()
        .map(|f| Alarm::decode(&f.payload).unwrap())
        .any(|a| a.code == alarm::BREW_NTC_OPEN && !a.active));
    assert!(ctrl.safety_reset());
}

/// Property 11: result-code semantics for rejected, invalid, and
/// not-ready commands.
#[test]
fn ack_result_semantics() {
    // Not commissioned: everything but commissioning is NOT_READY.
    let machine = SimMachine::new();
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();

    let mut bridge = BridgeSim::new();
    let frame = bridge.frame(&Message::SetTemp(SetTemp {
        target: Boiler::Brew,
        temp_dc: 930,
    }));
    ctrl.machine_mut().push_frame(&frame);
    step_to(&mut ctrl, 100);

    let frames = parse_tx(&ctrl.machine().tx);
    let acks = frames_of_type(&frames, MsgType::Ack);
    assert_eq!(
        Ack::decode(&acks[0].payload).unwrap().result,
        ResultCode::NotReady
    );

    // Commissioned machine: drive it into a brew.
    let machine = SimMachine::commissioned();
    let mut ctrl = Controller::new(machine, profile());
    let mut bridge = BridgeSim::new();
    ctrl.poll();
    step_to(&mut ctrl, 100); // Init -> Idle

    let frame = bridge.frame(&Message::SetMode(SetMode { mode: Mode::Brew }));
    ctrl.machine_mut().push_frame(&frame);
    step_to(&mut ctrl, 300); // mode applied, Heating -> Ready
    assert_eq!(ctrl.state(), ControlState::Ready);

    ctrl.machine_mut().sensors.lever = true;
    step_to(&mut ctrl, 400);
    assert_eq!(ctrl.state(), ControlState::Brewing);

    let before = ctrl.machine().tx.len();

    // Mode change mid-brew is refused.
    let frame = bridge.frame(&Message::SetMode(SetMode { mode: Mode::Brew }));
    ctrl.machine_mut().push_frame(&frame);
    // target byte 5 is no boiler: schema-invalid.
    let frame = bridge.raw_frame(MsgType::SetTemp as u8, &[5, 0xA2, 0x03]);
    ctrl.machine_mut().push_frame(&frame);
    step_to(&mut ctrl, 500);

    let frames = parse_tx(&ctrl.machine().tx[before..]);
    let acks: Vec<_> = frames_of_type(&frames, MsgType::Ack)
        .iter()
        .map(|f| Ack::decode(&f.payload).unwrap())
        .collect();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].result, ResultCode::Rejected);
    assert_eq!(acks[1].result, ResultCode::Invalid);
}

/// A retransmitted command (same seq) is answered from the ACK cache and
/// never applied twice.
#[test]
fn duplicate_command_is_reacked_not_reapplied() {
    let machine = SimMachine::commissioned();
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();
    step_to(&mut ctrl, 100);

    let mut bridge = BridgeSim::new();
    let frame = bridge.frame(&Message::SetTemp(SetTemp {
        target: Boiler::Brew,
        temp_dc: 905,
    }));

    ctrl.machine_mut().push_frame(&frame);
    step_to(&mut ctrl, 200);
    assert_eq!(ctrl.config().brew_setpoint_dc, 905);

    // Identical bytes again, as the bridge retry engine would send them.
    let before = ctrl.machine().tx.len();
    ctrl.machine_mut().push_frame(&frame);
    step_to(&mut ctrl, 300);

    let frames = parse_tx(&ctrl.machine().tx[before..]);
    let acks = frames_of_type(&frames, MsgType::Ack);
    assert_eq!(acks.len(), 1, "duplicate answered from the cache");
    let ack = Ack::decode(&acks[0].payload).unwrap();
    assert_eq!(ack.result, ResultCode::Success);
    assert_eq!(ctrl.link_stats().duplicates, 1);
}

/// Handshake: the controller records the peer and answers with its own
/// version block.
#[test]
fn handshake_reply_and_diagnostics() {
    let machine = SimMachine::commissioned();
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();
    assert!(!ctrl.link_stats().handshake_complete);

    let mut bridge = BridgeSim::new();
    let frame = bridge.frame(&Message::Handshake(Handshake {
        proto_major: 1,
        proto_minor: 1,
        capabilities: 0,
        max_packet_size: 62,
    }));
    ctrl.machine_mut().push_frame(&frame);
    ctrl.machine_mut().now = 50;
    ctrl.poll();

    assert!(ctrl.link_stats().handshake_complete);
    assert_eq!(ctrl.link_stats().negotiated_major, 1);
    assert_eq!(ctrl.link_stats().negotiated_minor, 1);

    let frames = parse_tx(&ctrl.machine().tx);
    let replies = frames_of_type(&frames, MsgType::Handshake);
    assert_eq!(replies.len(), 1);
    let reply = Handshake::decode(&replies[0].payload).unwrap();
    assert_eq!((reply.proto_major, reply.proto_minor), (1, 1));
}

/// Heartbeat loss: COMM_TIMEOUT is a warning (standalone operation), the
/// link-timeout alarm goes out, and the controller starts pinging.
#[test]
fn heartbeat_loss_warns_and_pings() {
    let machine = SimMachine::commissioned();
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();
    step_to(&mut ctrl, 5_500);

    assert!(ctrl.safety_flags() & SafetyFlags::COMM_TIMEOUT != 0);
    assert_ne!(ctrl.state(), ControlState::Safe, "warning only");

    let frames = parse_tx(&ctrl.machine().tx);
    assert!(frames_of_type(&frames, MsgType::Alarm)
        .iter()
        .map(|f| Alarm::decode(&f.payload).unwrap())
        .any(|a| a.code == alarm::LINK_TIMEOUT && a.active));
    assert!(!frames_of_type(&frames, MsgType::Ping).is_empty());

    // Traffic clears the flag.
    let mut bridge = BridgeSim::new();
    let frame = bridge.frame(&Message::Handshake(Handshake {
        proto_major: 1,
        proto_minor: 1,
        capabilities: 0,
        max_packet_size: 62,
    }));
    ctrl.machine_mut().push_frame(&frame);
    step_to(&mut ctrl, 5_700);
    assert!(ctrl.safety_flags() & SafetyFlags::COMM_TIMEOUT == 0);
}

/// A partial frame followed by silence resets the parser and counts one
/// parser timeout.
#[test]
fn parser_watchdog_counts_once() {
    let machine = SimMachine::commissioned();
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();

    let mut bridge = BridgeSim::new();
    let frame = bridge.frame(&Message::SetMode(SetMode { mode: Mode::Brew }));
    ctrl.machine_mut().push_frame(&frame[..4]);
    step_to(&mut ctrl, 200);
    assert_eq!(ctrl.link_stats().parser_timeouts, 0);

    step_to(&mut ctrl, 800);
    assert_eq!(ctrl.link_stats().parser_timeouts, 1);
    step_to(&mut ctrl, 1_500);
    assert_eq!(ctrl.link_stats().parser_timeouts, 1);
}

/// The watchdog is kicked once per tick, and the status LED goes to the
/// 2 Hz pattern in safe state.
#[test]
fn watchdog_and_indicator_follow_the_tick() {
    let machine = SimMachine::commissioned();
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();
    step_to(&mut ctrl, 500);
    assert_eq!(ctrl.machine().watchdog_kicks, 5);
    assert_eq!(
        ctrl.machine().indicator,
        brewos_controller::capabilities::Indicator::Solid
    );

    ctrl.machine_mut().sensors.reservoir_present = false;
    step_to(&mut ctrl, 1_200);
    assert_eq!(ctrl.state(), ControlState::Safe);
    assert_eq!(
        ctrl.machine().indicator,
        brewos_controller::capabilities::Indicator::Blink2Hz
    );
}
