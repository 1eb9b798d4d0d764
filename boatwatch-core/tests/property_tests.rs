//! Property tests for the controller dead band and wire rounding.

use boatwatch_core::{round_wire, ActuatorState, HysteresisController, TelemetryPayload, Thresholds};
use proptest::prelude::*;

const ON: f64 = 50.0;
const OFF: f64 = 45.0;

proptest! {
    /// State only flips on a threshold crossing, and a reading at or past a
    /// threshold always leaves the output on that side.
    #[test]
    fn hysteresis_follows_last_crossing(
        readings in proptest::collection::vec(30.0f64..70.0, 1..200),
    ) {
        let mut ctl = HysteresisController::new(Thresholds::new(ON, OFF).unwrap());
        let mut previous = ActuatorState::Off;

        for value in readings {
            let state = ctl.update_value(value);

            if value >= ON {
                prop_assert_eq!(state, ActuatorState::On);
            } else if value <= OFF {
                prop_assert_eq!(state, ActuatorState::Off);
            } else {
                prop_assert_eq!(state, previous, "dead band value {} changed state", value);
            }
            prop_assert_eq!(ctl.state(), state);
            previous = state;
        }
    }

    /// Decoding a produced payload gives back exactly the rounded values.
    #[test]
    fn payload_round_trip_is_exact(
        value in -1000.0f64..1000.0,
        humidity in 0.0f64..100.0,
        on in any::<bool>(),
    ) {
        let payload = TelemetryPayload::new()
            .number("temperature", value)
            .number("humidity", humidity)
            .flag("fan", on);

        let fields = TelemetryPayload::decode(&payload.encode().unwrap()).unwrap();

        prop_assert_eq!(fields.len(), 3);
        prop_assert_eq!(&fields[0].0, "temperature");
        prop_assert_eq!(fields[0].1, round_wire(value));
        prop_assert_eq!(fields[1].1, round_wire(humidity));
        prop_assert_eq!(fields[2].1, if on { 1.0 } else { 0.0 });

        // rounding is idempotent
        prop_assert_eq!(round_wire(fields[0].1), fields[0].1);
    }
}
