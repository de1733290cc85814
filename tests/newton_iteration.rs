//! Two-federate Newton iteration on a coupled nonlinear system:
//! federate A solves `x^2 - 2x - y + 0.5 = 0` for x, federate B solves
//! `x^2 + 4y^2 - 4 = 0` for y. Both iterate at time zero until neither
//! value moves, then advance one step and terminate.

use std::sync::mpsc;

use tandem::core::{IterationRequest, IterationResult, Time};
use tandem::federation;
use tandem::runtime::Federate;

const TOLERANCE: f64 = 1e-10;
const MAX_ITERATIONS: i32 = 100;

fn parse_value(bytes: &[u8]) -> f64 {
    std::str::from_utf8(bytes).unwrap().parse().unwrap()
}

/// Newton solve of `x^2 - 2x - y + 0.5 = 0` for x, warm-started at `x0`.
fn solve_for_x(x0: f64, y: f64) -> f64 {
    let mut x = x0;
    for _ in 0..50 {
        let f = x * x - 2.0 * x - y + 0.5;
        if f.abs() < TOLERANCE {
            break;
        }
        x -= f / (2.0 * x - 2.0);
    }
    x
}

/// Newton solve of `x^2 + 4y^2 - 4 = 0` for y, warm-started at `y0`.
fn solve_for_y(x: f64, y0: f64) -> f64 {
    let mut y = y0;
    for _ in 0..50 {
        let g = x * x + 4.0 * y * y - 4.0;
        if g.abs() < TOLERANCE {
            break;
        }
        y -= g / (8.0 * y);
    }
    y
}

#[test_log::test]
fn coupled_newton_converges_then_advances() {
    let (broker, cores) = federation::start_inproc("newton_broker", 2, &["newton_core"]);
    let core = &cores[0];
    let (result_tx, result_rx) = mpsc::channel();

    std::thread::scope(|scope| {
        let tx_a = result_tx.clone();
        scope.spawn(move || {
            let mut fed = Federate::new(core, "fed_a").unwrap();
            fed.set_max_iterations(MAX_ITERATIONS);
            let output = fed.register_publication("testA", "double", "").unwrap();
            let input = fed.register_input("testB", "double", "", true).unwrap();
            fed.enter_initializing_mode().unwrap();

            let mut x = 0.0;
            let mut y = 1.0;
            fed.publish(output, format!("{x:.17}").as_bytes()).unwrap();
            fed.enter_executing_mode().unwrap();

            let mut iterations = 0;
            loop {
                if let Some(value) = fed.get_value(input) {
                    y = parse_value(&value);
                }
                let next = solve_for_x(x, y);
                if (next - x).abs() > TOLERANCE {
                    x = next;
                    fed.publish(output, format!("{x:.17}").as_bytes()).unwrap();
                }
                let grant = fed
                    .request_time(Time::from_seconds(1.0), IterationRequest::IterateIfNeeded)
                    .unwrap();
                match grant.state {
                    IterationResult::Iterating => {
                        iterations += 1;
                        assert!(iterations <= MAX_ITERATIONS, "fed_a failed to converge");
                    }
                    IterationResult::NextStep => {
                        assert_eq!(grant.granted_time, Time::from_seconds(1.0));
                        break;
                    }
                    other => panic!("unexpected grant state {other:?}"),
                }
            }
            assert!(iterations >= 1, "fed_a never iterated");
            tx_a.send(("x", x, iterations)).unwrap();
            fed.finalize().unwrap();
        });

        let tx_b = result_tx;
        scope.spawn(move || {
            let mut fed = Federate::new(core, "fed_b").unwrap();
            fed.set_max_iterations(MAX_ITERATIONS);
            let output = fed.register_publication("testB", "double", "").unwrap();
            let input = fed.register_input("testA", "double", "", true).unwrap();
            fed.enter_initializing_mode().unwrap();

            let mut x = 0.0;
            let mut y = 1.0;
            fed.publish(output, format!("{y:.17}").as_bytes()).unwrap();
            fed.enter_executing_mode().unwrap();

            let mut iterations = 0;
            loop {
                if let Some(value) = fed.get_value(input) {
                    x = parse_value(&value);
                }
                let next = solve_for_y(x, y);
                if (next - y).abs() > TOLERANCE {
                    y = next;
                    fed.publish(output, format!("{y:.17}").as_bytes()).unwrap();
                }
                let grant = fed
                    .request_time(Time::from_seconds(1.0), IterationRequest::IterateIfNeeded)
                    .unwrap();
                match grant.state {
                    IterationResult::Iterating => {
                        iterations += 1;
                        assert!(iterations <= MAX_ITERATIONS, "fed_b failed to converge");
                    }
                    IterationResult::NextStep => {
                        assert_eq!(grant.granted_time, Time::from_seconds(1.0));
                        break;
                    }
                    other => panic!("unexpected grant state {other:?}"),
                }
            }
            assert!(iterations >= 1, "fed_b never iterated");
            tx_b.send(("y", y, iterations)).unwrap();
            fed.finalize().unwrap();
        });
    });

    let mut x = f64::NAN;
    let mut y = f64::NAN;
    for _ in 0..2 {
        let (which, value, iterations) = result_rx.recv().unwrap();
        assert!((1..=MAX_ITERATIONS).contains(&iterations));
        match which {
            "x" => x = value,
            _ => y = value,
        }
    }
    // Both residuals vanish at the converged point.
    assert!((x * x - 2.0 * x - y + 0.5).abs() < 1e-6, "x={x} y={y}");
    assert!((x * x + 4.0 * y * y - 4.0).abs() < 1e-6, "x={x} y={y}");

    broker.join();
    assert!(!broker.observed_error());
    federation::shutdown_inproc("newton_broker", &["newton_core"]);
}
