use proptest::prelude::*;
use rewinder_runtime::motor::encoder::{self, DecayMode, EncoderParams};
use rewinder_runtime::motor::frame::speed_to_wire;
use rewinder_runtime::motor::{MIN_COMMAND_INTERVAL, MotorController, RecordingSink};

fn decay_strategy() -> impl Strategy<Value = DecayMode> {
    prop_oneof![Just(DecayMode::Fast), Just(DecayMode::Slow)]
}

prop_compose! {
    // (delay since previous request, velocity, decay)
    fn request_strategy()(
        dt in 0.0f64..0.5,
        velocity in -1.5f32..1.5,
        decay in decay_strategy(),
    ) -> (f64, f32, DecayMode) {
        (dt, velocity, decay)
    }
}

proptest! {
    #[test]
    fn duties_stay_in_range_with_one_modulated_leg(
        velocity in -2.0f32..2.0,
        max_power in 0.01f32..=1.0,
        decay in decay_strategy(),
    ) {
        let pair = encoder::encode(velocity, decay, max_power);
        prop_assert!((0.0..=1.0).contains(&pair.a), "a = {}", pair.a);
        prop_assert!((0.0..=1.0).contains(&pair.b), "b = {}", pair.b);
        prop_assert!(pair.modulated_legs() <= 1);
    }

    #[test]
    fn kick_only_on_large_jumps(
        previous in -1.0f32..1.0,
        next in -1.0f32..1.0,
        kick_start_speed in 0.0f32..=1.0,
        decay in decay_strategy(),
    ) {
        let params = EncoderParams { kick_start_speed, ..EncoderParams::default() };
        if let Some(pulse) = encoder::kick_start(previous, next, decay, &params) {
            prop_assert!(encoder::needs_kick_start(previous, next, &params));
            prop_assert!(pulse.modulated_legs() <= 1);
            prop_assert!((next - previous).abs() > encoder::KICK_START_THRESHOLD);
        }
    }

    #[test]
    fn commands_respect_min_interval(requests in prop::collection::vec(request_strategy(), 1..40)) {
        let mut motor = MotorController::new(EncoderParams::default(), RecordingSink::default()).unwrap();
        let mut now = 0.0;
        let mut last_steady: Option<f64> = None;

        for (dt, velocity, decay) in requests {
            now += dt;
            let steady = motor.set_speed(now, velocity, decay).unwrap();
            prop_assert!(steady >= now - 1e-9);
            if let Some(last) = last_steady {
                prop_assert!(steady >= last - 1e-9, "steady time went back: {} < {}", steady, last);
            }
            last_steady = Some(steady);
        }

        let commands = &motor.sink().commands;
        for pair in commands.windows(2) {
            let start = pair[1].kick.unwrap_or(pair[1].steady).at;
            prop_assert!(start >= pair[0].steady.at + MIN_COMMAND_INTERVAL - 1e-9);
        }
        for cmd in commands {
            let times: Vec<f64> = cmd.steps().map(|step| step.at).collect();
            prop_assert!(times.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn wire_speed_keeps_sign_and_range(velocity in -1.0f32..=1.0) {
        let wire = speed_to_wire(velocity);
        prop_assert!(wire >= -127);
        if velocity > 0.5 / 127.0 {
            prop_assert!(wire > 0);
        } else if velocity < -0.5 / 127.0 {
            prop_assert!(wire < 0);
        }
    }
}
