//! ---
//! pps_section: "03-observability"
//! pps_subsection: "tests"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Metrics exporter integration tests."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};

use pps_metrics::{new_registry, spawn_http_server, TrackerMetrics};

#[test]
fn counters_are_registered_once() {
    let registry = new_registry();
    let metrics = TrackerMetrics::new(registry.clone()).unwrap();
    metrics.add_tags(42);
    metrics.add_cycles(1);
    metrics.record_dropped("pending", 3, 2);
    metrics.record_missing(3, 2);

    let families = registry.gather();
    let names: Vec<_> = families.iter().map(|f| f.get_name().to_owned()).collect();
    assert!(names.contains(&"pps_tags_processed_total".to_owned()));
    assert!(names.contains(&"pps_samples_dropped_total".to_owned()));

    assert!(TrackerMetrics::new(registry).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exporter_serves_text_format() {
    let registry = new_registry();
    let metrics = TrackerMetrics::new(registry.clone()).unwrap();
    metrics.add_tags(7);

    let server = spawn_http_server(registry, SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
    let addr = server.addr();

    let body = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    })
    .await
    .unwrap();

    assert!(body.starts_with("HTTP/1.1 200"));
    assert!(body
        .to_ascii_lowercase()
        .contains(&format!("content-type: {}", pps_metrics::prometheus::TEXT_FORMAT)));
    assert!(body.contains("pps_tags_processed_total 7"));
    server.shutdown().await.unwrap();
}
