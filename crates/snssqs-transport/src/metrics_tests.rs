//! Tests for the metrics wrapper and sinks.

use super::*;
use std::time::Duration;

fn queue() -> QueueUrl {
    QueueUrl::new("https://sqs.us-east-1.amazonaws.com/123456789012/results".to_string()).unwrap()
}

fn topic() -> TopicArn {
    TopicArn::new("arn:aws:sns:us-east-1:123456789012:monitoring".to_string()).unwrap()
}

mod wrapper {
    use super::*;

    #[tokio::test]
    async fn test_disabled_time_still_runs_body() {
        let metrics = Metrics::disabled();

        let value = metrics.time("anything", async { 42 }).await;

        assert_eq!(value, 42);
        assert!(!metrics.is_enabled());
    }

    #[test]
    fn test_disabled_increment_is_noop() {
        Metrics::default().increment("anything");
    }

    #[tokio::test]
    async fn test_enabled_time_reports_timing() {
        let sink = Arc::new(InMemorySink::new());
        let metrics = Metrics::new(sink.clone(), 1.0);

        let value = metrics
            .time("sqs.results.message.processed", async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                "done"
            })
            .await;

        assert_eq!(value, "done");
        let samples = sink.samples();
        assert_eq!(samples.len(), 1);
        match &samples[0] {
            Sample::Timing { stat, millis, .. } => {
                assert_eq!(stat, "sqs.results.message.processed");
                assert!(*millis >= 5);
            }
            other => panic!("expected timing sample, got {:?}", other),
        }
    }

    #[test]
    fn test_sample_rate_is_applied_to_every_stat() {
        let sink = Arc::new(InMemorySink::new());
        let metrics = Metrics::new(sink.clone(), 0.25);

        metrics.increment("a");
        metrics.increment("b");

        for sample in sink.samples() {
            match sample {
                Sample::Increment { sample_rate, .. } => assert_eq!(sample_rate, 0.25),
                other => panic!("unexpected sample {:?}", other),
            }
        }
        assert_eq!(sink.count("a"), 1);
        assert_eq!(sink.count("b"), 1);
    }

    #[test]
    fn test_sample_rate_is_clamped() {
        let sink = Arc::new(InMemorySink::new());
        assert_eq!(Metrics::new(sink.clone(), 3.0).sample_rate(), 1.0);
        assert_eq!(Metrics::new(sink, -1.0).sample_rate(), 0.0);
    }
}

mod stat_names {
    use super::*;

    #[test]
    fn test_stat_names_are_scoped_by_identifier_name() {
        assert_eq!(stats::published(&topic()), "sns.monitoring.message.published");
        assert_eq!(stats::deleted(&queue()), "sqs.results.message.deleted");
        assert_eq!(stats::processed(&queue()), "sqs.results.message.processed");
        assert_eq!(stats::received(&queue()), "sqs.results.message.received");
        assert_eq!(stats::discarded(&queue()), "sqs.results.message.discarded");
        assert_eq!(stats::receive_failed(&queue()), "sqs.results.receive.failed");
    }
}

mod statsd {
    use super::*;
    use std::net::UdpSocket;

    fn listener() -> (UdpSocket, String) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        (socket, addr)
    }

    fn read_line(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 512];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..len]).into_owned()
    }

    #[test]
    fn test_namespace_is_optional() {
        let (socket, addr) = listener();
        let sink = StatsdSink::new(&addr, "").unwrap();

        sink.increment("sqs.results.message.deleted", 1.0);

        assert_eq!(read_line(&socket), "sqs.results.message.deleted:1|c");
    }

    #[test]
    fn test_zero_sample_rate_sends_nothing() {
        let (socket, addr) = listener();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let sink = StatsdSink::new(&addr, "ns").unwrap();

        sink.increment("sqs.results.message.received", 0.0);

        let mut buf = [0u8; 512];
        assert!(socket.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_increment_is_sent_over_udp() {
        let (socket, addr) = listener();
        let sink = StatsdSink::new(&addr, "ns").unwrap();

        sink.increment("sns.monitoring.message.published", 1.0);

        assert_eq!(read_line(&socket), "ns.sns.monitoring.message.published:1|c");
    }

    #[test]
    fn test_timing_is_sent_over_udp() {
        let (socket, addr) = listener();
        let sink = StatsdSink::new(&addr, "ns").unwrap();

        sink.timing("sqs.results.message.processed", 37, 1.0);

        assert_eq!(read_line(&socket), "ns.sqs.results.message.processed:37|ms");
    }

    #[test]
    fn test_unresolvable_host_is_rejected() {
        let result = StatsdSink::new("missing-port", "ns");
        assert!(matches!(result, Err(ConfigurationError::Invalid { .. })));
    }
}
