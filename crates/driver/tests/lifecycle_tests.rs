//! Integration tests for the device lifecycle
//!
//! Drives `GamepadDevice` against the scripted mock transport:
//! - Reference counting and single reclamation
//! - Attach failure unwinding
//! - Input publishing order and axis inversion
//! - Output backpressure and removal draining
//! - Completion versus removal races, re-attach during removal

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockTransport, RecordingSink, gamepad_endpoints, gamepad_identity,
    gamepad_report,
};
use driver::usb::{DeviceOptions, DriverError, GamepadDevice, PresenceState};
use protocol::{Axis, Button, EndpointDirection, InputEvent, TransferStatus};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

fn options(drain_ms: u64) -> DeviceOptions {
    DeviceOptions {
        writes_in_flight: 8,
        drain_timeout: Duration::from_millis(drain_ms),
    }
}

fn attach_with(
    transport: &Arc<MockTransport>,
    sink: &Arc<RecordingSink>,
    options: DeviceOptions,
) -> GamepadDevice {
    GamepadDevice::attach(transport.clone(), gamepad_identity(), sink.clone(), options).unwrap()
}

fn attach(transport: &Arc<MockTransport>, sink: &Arc<RecordingSink>) -> GamepadDevice {
    attach_with(transport, sink, DeviceOptions::default())
}

mod refcount {
    use super::*;

    #[test]
    fn test_attach_and_two_opens_count_three() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = attach(&transport, &sink);

        let a = device.open().unwrap();
        let b = device.open().unwrap();
        assert_eq!(device.ref_count(), 3);

        device.close(a);
        device.close(b);
        assert_eq!(device.ref_count(), 1);

        device.detach();
        assert!(device.wait_reclaimed(DEFAULT_TEST_TIMEOUT));
        assert_eq!(device.ref_count(), 0);
        assert_eq!(transport.releases(), 1);
    }

    #[test]
    fn test_last_close_after_removal_reclaims() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = attach(&transport, &sink);

        let a = device.open().unwrap();
        let b = device.open().unwrap();
        device.detach();
        assert_eq!(device.ref_count(), 2);
        assert!(!device.is_present());

        drop(a);
        assert_eq!(transport.releases(), 0);
        drop(b);

        assert!(device.wait_reclaimed(DEFAULT_TEST_TIMEOUT));
        assert_eq!(device.state(), PresenceState::Reclaimed);
        assert_eq!(transport.releases(), 1);
        assert_eq!(transport.power_releases(), 2);
    }

    #[test]
    fn test_open_after_removal_fails() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = attach(&transport, &sink);

        device.detach();
        assert_eq!(device.open().err(), Some(DriverError::DeviceGone));
        assert_eq!(transport.power_resumes(), 0);
    }

    #[test]
    fn test_handles_closed_from_many_threads() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = attach(&transport, &sink);

        let handles: Vec<_> = (0..16).map(|_| device.open().unwrap()).collect();
        assert_eq!(device.ref_count(), 17);
        device.detach();

        let closers: Vec<_> = handles
            .into_iter()
            .map(|handle| thread::spawn(move || drop(handle)))
            .collect();
        for closer in closers {
            closer.join().unwrap();
        }

        assert!(device.wait_reclaimed(DEFAULT_TEST_TIMEOUT));
        assert_eq!(transport.releases(), 1);
    }
}

mod attach_failures {
    use super::*;

    #[test]
    fn test_missing_endpoint() {
        let transport = Arc::new(MockTransport::with_endpoints(vec![gamepad_endpoints()[0]]));
        let sink = Arc::new(RecordingSink::new());

        let result = GamepadDevice::attach(
            transport.clone(),
            gamepad_identity(),
            sink.clone(),
            DeviceOptions::default(),
        );

        assert_eq!(result.err(), Some(DriverError::EndpointNotFound));
        assert_eq!(sink.registrations(), 0);
        assert_eq!(transport.releases(), 1);
    }

    #[test]
    fn test_sink_refuses_registration() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::failing("no slots"));

        let result = GamepadDevice::attach(
            transport.clone(),
            gamepad_identity(),
            sink.clone(),
            DeviceOptions::default(),
        );

        assert!(matches!(result, Err(DriverError::Registration(_))));
        assert_eq!(transport.submitted(), 0);
        assert_eq!(sink.unregistrations(), 0);
        assert_eq!(transport.releases(), 1);
    }

    #[test]
    fn test_first_submission_refused() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        transport.fail_next_submit(-19);

        let result = GamepadDevice::attach(
            transport.clone(),
            gamepad_identity(),
            sink.clone(),
            DeviceOptions::default(),
        );

        assert_eq!(result.err(), Some(DriverError::SubmitFailed(-19)));
        assert_eq!(sink.registrations(), 1);
        assert_eq!(sink.unregistrations(), 1);
        assert_eq!(transport.pending(EndpointDirection::In), 0);
        assert_eq!(transport.releases(), 1);
    }
}

mod input {
    use super::*;

    #[test]
    fn test_frames_follow_completion_order() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let _device = attach(&transport, &sink);

        for (low, high) in [(0x00, 0x10), (0x00, 0x20), (0x00, 0x40)] {
            assert!(transport.complete_input(&gamepad_report(low, high), TransferStatus::Success));
        }

        let held: Vec<Vec<Button>> = sink
            .frames()
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .filter_map(|event| match event {
                        InputEvent::Key {
                            button,
                            pressed: true,
                        } => Some(*button),
                        _ => None,
                    })
                    .collect()
            })
            .collect();

        assert_eq!(
            held,
            vec![vec![Button::A], vec![Button::B], vec![Button::X]]
        );
    }

    #[test]
    fn test_y_axis_is_ones_complement() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let _device = attach(&transport, &sink);

        let mut raw = gamepad_report(0, 0);
        raw[6..8].copy_from_slice(&(-32768i16).to_le_bytes());
        raw[8..10].copy_from_slice(&(-32768i16).to_le_bytes());
        raw[12..14].copy_from_slice(&0i16.to_le_bytes());
        assert!(transport.complete_input(&raw, TransferStatus::Success));

        let frame = &sink.frames()[0];
        assert!(frame.contains(&InputEvent::Abs {
            axis: Axis::LeftX,
            value: -32768
        }));
        assert!(frame.contains(&InputEvent::Abs {
            axis: Axis::LeftY,
            value: 32767
        }));
        assert!(frame.contains(&InputEvent::Abs {
            axis: Axis::RightY,
            value: -1
        }));
    }

    #[test]
    fn test_short_read_is_zero_padded() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let _device = attach(&transport, &sink);

        assert!(transport.complete_input(&[0x00, 0x14, 0x02], TransferStatus::Success));

        let frame = &sink.frames()[0];
        assert!(frame.contains(&InputEvent::Key {
            button: Button::DpadDown,
            pressed: true
        }));
        assert_eq!(frame.last(), Some(&InputEvent::Sync));
    }

    #[test]
    fn test_events_reach_channel_bridge() {
        let transport = Arc::new(MockTransport::new());
        let (sink, receiver) = common::create_event_bridge(8);
        let device = GamepadDevice::attach(
            transport.clone(),
            gamepad_identity(),
            Arc::new(sink),
            DeviceOptions::default(),
        )
        .unwrap();

        assert!(transport.complete_input(&gamepad_report(0x10, 0x00), TransferStatus::Success));
        device.detach();

        assert!(matches!(
            receiver.try_recv(),
            Some(common::SinkMessage::Registered { .. })
        ));
        assert!(matches!(
            receiver.try_recv(),
            Some(common::SinkMessage::Frame(_))
        ));
        assert_eq!(receiver.try_recv(), Some(common::SinkMessage::Unregistered));
    }
}

mod output {
    use super::*;

    #[test]
    fn test_ninth_write_waits_for_a_permit() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = Arc::new(attach_with(&transport, &sink, options(100)));

        for i in 0..8u8 {
            device.enqueue([0x00, 0x08, i]).unwrap();
        }
        assert_eq!(device.permits_available(), 0);
        assert!(device.output_active());

        let (tx, rx) = mpsc::channel();
        let writer = {
            let device = device.clone();
            thread::spawn(move || tx.send(device.enqueue([0x00, 0x08, 0xff])).unwrap())
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        assert!(transport.complete_output(TransferStatus::Success));
        assert_eq!(rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap(), Ok(()));
        writer.join().unwrap();

        assert_eq!(transport.pending(EndpointDirection::Out), 8);
        assert_eq!(device.stats().outputs_sent, 1);
    }

    #[test]
    fn test_blocked_writer_fails_on_removal() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = Arc::new(attach_with(&transport, &sink, options(100)));

        for _ in 0..8 {
            device.enqueue([0x01]).unwrap();
        }

        let (tx, rx) = mpsc::channel();
        let writer = {
            let device = device.clone();
            thread::spawn(move || tx.send(device.enqueue([0x02])).unwrap())
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        device.detach();

        assert_eq!(
            rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap(),
            Err(DriverError::DeviceGone)
        );
        writer.join().unwrap();

        // Stragglers were force-cancelled after the drain timeout
        assert_eq!(transport.pending(EndpointDirection::Out), 0);
        assert!(!device.output_active());
        assert!(device.wait_reclaimed(DEFAULT_TEST_TIMEOUT));
        assert_eq!(transport.releases(), 1);
    }

    #[test]
    fn test_outputs_completing_during_drain_are_not_cancelled() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = Arc::new(attach(&transport, &sink));

        device.enqueue([0x01]).unwrap();
        device.enqueue([0x02]).unwrap();

        let completer = {
            let transport = transport.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                assert!(transport.complete_output(TransferStatus::Success));
                assert!(transport.complete_output(TransferStatus::Other(-71)));
            })
        };

        device.detach();
        completer.join().unwrap();

        // Only the input transfer was cancelled
        assert_eq!(transport.cancelled().len(), 1);
        let stats = device.stats();
        assert_eq!(stats.outputs_sent, 1);
        assert_eq!(stats.outputs_failed, 1);
        assert_eq!(transport.releases(), 1);
    }

    #[test]
    fn test_stuck_output_does_not_block_removal() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = attach_with(&transport, &sink, options(100));
        device.enqueue([0x00, 0x08, 0x00, 0xff]).unwrap();
        transport.ignore_cancel(true);

        let start = Instant::now();
        device.detach();

        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(device.wait_reclaimed(DEFAULT_TEST_TIMEOUT));
        assert_eq!(transport.releases(), 1);
        assert_eq!(transport.pending(EndpointDirection::Out), 1);
    }

    #[test]
    fn test_removal_fits_drain_timeout_when_nothing_cancels() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = attach_with(&transport, &sink, options(200));
        device.enqueue([0x00, 0x08, 0x00, 0xff]).unwrap();
        transport.ignore_cancel(true);

        let start = Instant::now();
        device.detach();
        let elapsed = start.elapsed();

        assert!(
            elapsed < Duration::from_millis(200 + 100),
            "detach took {:?}",
            elapsed
        );
        assert!(device.wait_reclaimed(Duration::from_millis(50)));
        assert_eq!(device.state(), PresenceState::Reclaimed);
        assert_eq!(transport.releases(), 1);
        assert_eq!(transport.pending(EndpointDirection::In), 1);
        assert_eq!(transport.pending(EndpointDirection::Out), 1);
    }

    #[test]
    fn test_stuck_output_alone_fits_drain_timeout() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = attach_with(&transport, &sink, options(400));
        device.enqueue([0x01]).unwrap();
        transport.ignore_cancel(true);

        // The input comes back on its own shortly after removal starts
        let completer = {
            let transport = transport.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                transport.complete_input(&[], TransferStatus::ConnectionReset)
            })
        };

        let start = Instant::now();
        device.detach();
        let elapsed = start.elapsed();
        assert!(completer.join().unwrap());

        assert!(
            elapsed < Duration::from_millis(400 + 100),
            "detach took {:?}",
            elapsed
        );
        assert!(device.wait_reclaimed(Duration::from_millis(50)));
        assert!(!device.is_polling());
        assert_eq!(transport.pending(EndpointDirection::Out), 1);
        assert_eq!(transport.releases(), 1);
    }

    #[test]
    fn test_oversized_payload_takes_no_permit() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = attach(&transport, &sink);

        assert_eq!(
            device.enqueue([0u8; 65]),
            Err(DriverError::PayloadTooLarge { len: 65, max: 64 })
        );
        assert_eq!(device.permits_available(), 8);
        assert_eq!(transport.pending(EndpointDirection::Out), 0);
    }

    #[test]
    fn test_refused_write_returns_permit() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = attach(&transport, &sink);
        transport.fail_next_submit(-32);

        assert_eq!(device.enqueue([0x01]), Err(DriverError::SubmitFailed(-32)));
        assert_eq!(device.permits_available(), 8);
        assert!(!device.output_active());
    }

    #[test]
    fn test_terminal_output_status_clears_active() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let device = attach(&transport, &sink);

        device.enqueue([0x01]).unwrap();
        assert!(device.output_active());
        assert!(transport.complete_output(TransferStatus::ShuttingDown));

        assert!(!device.output_active());
        assert_eq!(device.permits_available(), 8);
        assert_eq!(device.stats().outputs_failed, 0);
    }
}

mod races {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn random_status(rng: &mut impl Rng) -> TransferStatus {
        match rng.random_range(0..10) {
            0 => TransferStatus::Other(-71),
            _ => TransferStatus::Success,
        }
    }

    #[test]
    fn test_completions_racing_removal() {
        let mut rng = rand::rng();

        for _ in 0..30 {
            let transport = Arc::new(MockTransport::new());
            let sink = Arc::new(RecordingSink::new());
            let device = Arc::new(attach_with(&transport, &sink, options(200)));
            let stop = Arc::new(AtomicBool::new(false));

            let input = {
                let transport = transport.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut rng = rand::rng();
                    while !stop.load(Ordering::Acquire) {
                        let report = gamepad_report(rng.random(), rng.random());
                        transport.complete_input(&report, random_status(&mut rng));
                        thread::yield_now();
                    }
                })
            };

            let output = {
                let transport = transport.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut rng = rand::rng();
                    while !stop.load(Ordering::Acquire) {
                        transport.complete_output(random_status(&mut rng));
                        thread::yield_now();
                    }
                })
            };

            let writer = {
                let device = device.clone();
                thread::spawn(move || {
                    loop {
                        match device.enqueue([0x00, 0x08]) {
                            Ok(()) => {}
                            Err(DriverError::DeviceGone) => break,
                            Err(e) => panic!("unexpected write error: {}", e),
                        }
                    }
                })
            };

            let handle = device.open().unwrap();
            thread::sleep(Duration::from_micros(rng.random_range(0..3000)));
            if rng.random_bool(0.5) {
                drop(handle);
                device.detach();
            } else {
                device.detach();
                drop(handle);
            }

            writer.join().unwrap();
            assert!(device.wait_reclaimed(DEFAULT_TEST_TIMEOUT));
            let published = sink.events().len();

            stop.store(true, Ordering::Release);
            input.join().unwrap();
            output.join().unwrap();

            assert_eq!(transport.releases(), 1);
            assert_eq!(sink.unregistrations(), 1);
            assert_eq!(sink.late_events(), 0);
            assert_eq!(sink.events().len(), published);
            assert_eq!(device.ref_count(), 0);
            assert_eq!(transport.power_resumes(), transport.power_releases());
        }
    }

    struct Generation {
        device: Arc<GamepadDevice>,
        transport: Arc<MockTransport>,
        stop: Arc<AtomicBool>,
        pump: thread::JoinHandle<()>,
    }

    fn pump_input(transport: Arc<MockTransport>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut rng = rand::rng();
            while !stop.load(Ordering::Acquire) {
                let report = gamepad_report(rng.random(), rng.random());
                transport.complete_input(&report, random_status(&mut rng));
                thread::yield_now();
            }
        })
    }

    #[test]
    fn test_reattach_while_previous_device_detaches() {
        let mut rng = rand::rng();
        let sink = Arc::new(RecordingSink::new());
        let mut transports = Vec::new();
        let mut previous: Option<Generation> = None;

        for _ in 0..20 {
            let detaching = previous.take().map(|generation| {
                let delay = Duration::from_micros(rng.random_range(0..2000));
                thread::spawn(move || {
                    thread::sleep(delay);
                    generation.device.detach();
                    generation
                })
            });

            let transport = Arc::new(MockTransport::new());
            let stop = Arc::new(AtomicBool::new(false));
            let pump = pump_input(transport.clone(), stop.clone());
            let device = Arc::new(attach_with(&transport, &sink, options(200)));
            assert!(device.is_present());

            if let Some(detaching) = detaching {
                let old = detaching.join().unwrap();
                assert!(old.device.wait_reclaimed(DEFAULT_TEST_TIMEOUT));
                old.stop.store(true, Ordering::Release);
                old.pump.join().unwrap();
                assert_eq!(old.transport.releases(), 1);
                assert!(device.is_present());
            }

            transports.push(transport.clone());
            previous = Some(Generation {
                device,
                transport,
                stop,
                pump,
            });
        }

        if let Some(last) = previous {
            last.device.detach();
            assert!(last.device.wait_reclaimed(DEFAULT_TEST_TIMEOUT));
            last.stop.store(true, Ordering::Release);
            last.pump.join().unwrap();
        }

        assert_eq!(sink.registrations(), 20);
        assert_eq!(sink.unregistrations(), 20);
        assert_eq!(sink.late_events(), 0);
        for transport in &transports {
            assert_eq!(transport.releases(), 1);
        }
    }
}
