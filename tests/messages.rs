//! Endpoint message exchange with an in-path delay filter: a sender, a
//! receiver, and a filter federate whose operator postpones messages by one
//! second on the source side.

use tandem::core::{IterationRequest, Time};
use tandem::federation;
use tandem::runtime::interfaces::DelayFilter;
use tandem::runtime::Federate;

fn seconds(s: f64) -> Time {
    Time::from_seconds(s)
}

#[test_log::test]
fn filtered_messages_arrive_delayed_and_ordered() {
    let (broker, cores) = federation::start_inproc("msg_broker", 3, &["msg_core"]);
    let core = &cores[0];

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut sender = Federate::new(core, "sender").unwrap();
            let endpoint = sender.register_endpoint("ep_send", "raw").unwrap();
            sender.enter_initializing_mode().unwrap();
            sender.enter_executing_mode().unwrap();

            let grant = sender
                .request_time(seconds(1.0), IterationRequest::NoIterations)
                .unwrap();
            assert_eq!(grant.granted_time, seconds(1.0));
            sender.send_message(endpoint, "ep_recv", b"ping-1").unwrap();
            sender.send_message(endpoint, "ep_recv", b"ping-2").unwrap();

            sender
                .request_time(seconds(5.0), IterationRequest::NoIterations)
                .unwrap();
            sender.finalize().unwrap();
        });

        scope.spawn(|| {
            let mut relay = Federate::new(core, "relay").unwrap();
            let filter = relay
                .register_filter("delay_filter", "raw", "raw", false)
                .unwrap();
            relay.add_filter_target(filter, "ep_send").unwrap();
            relay.set_filter_operator(
                filter,
                Box::new(DelayFilter {
                    delay: seconds(1.0),
                }),
            );
            relay.enter_initializing_mode().unwrap();
            relay.enter_executing_mode().unwrap();
            relay
                .request_time(seconds(5.0), IterationRequest::NoIterations)
                .unwrap();
            relay.finalize().unwrap();
        });

        scope.spawn(|| {
            let mut receiver = Federate::new(core, "receiver").unwrap();
            let endpoint = receiver.register_endpoint("ep_recv", "raw").unwrap();
            receiver.enter_initializing_mode().unwrap();
            receiver.enter_executing_mode().unwrap();

            // Messages were sent at t=1 and delayed to t=2; at t=1.5 the
            // queue must still look empty.
            let grant = receiver
                .request_time(seconds(1.5), IterationRequest::NoIterations)
                .unwrap();
            assert_eq!(grant.granted_time, seconds(1.5));
            assert!(!receiver.has_message(endpoint));

            let grant = receiver
                .request_time(seconds(3.0), IterationRequest::NoIterations)
                .unwrap();
            assert_eq!(grant.granted_time, seconds(3.0));

            assert!(receiver.has_message(endpoint));
            let first = receiver.get_message(endpoint).unwrap();
            assert_eq!(first.time, seconds(2.0));
            assert_eq!(first.data, b"ping-1");
            assert_eq!(first.original_source, "ep_send");

            let second = receiver.get_message(endpoint).unwrap();
            assert_eq!(second.time, seconds(2.0));
            assert_eq!(second.data, b"ping-2");
            assert!(receiver.get_message(endpoint).is_none());

            receiver
                .request_time(seconds(5.0), IterationRequest::NoIterations)
                .unwrap();
            receiver.finalize().unwrap();
        });
    });

    broker.join();
    assert!(!broker.observed_error());
    federation::shutdown_inproc("msg_broker", &["msg_core"]);
}
