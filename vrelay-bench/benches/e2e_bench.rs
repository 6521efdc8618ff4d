//! End-to-end gateway-to-backend benchmarks over loopback TCP.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tokio::runtime::Runtime;
use vrelay_backend::{Responder, Scheduling, Server, ServerConfig};
use vrelay_gateway::{Forwarder, ForwarderConfig};
use vrelay_protocol::{Envelope, Framing};
use vrelay_transport::Endpoint;

struct TestSetup {
    _server: Arc<Server>,
    forwarder: Forwarder,
}

fn setup_backend_and_forwarder(rt: &Runtime, framing: Framing) -> TestSetup {
    let config = ServerConfig {
        framing,
        scheduling: Scheduling::Concurrent,
        ..ServerConfig::new(Endpoint::tcp("127.0.0.1", 0))
    };
    let server = Arc::new(Server::new(config, Responder::with_routes("enclave")));

    let endpoint = rt.block_on(async {
        let listener = server.bind().await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        endpoint
    });

    let forwarder = Forwarder::new(ForwarderConfig::new(endpoint).with_framing(framing));

    TestSetup {
        _server: server,
        forwarder,
    }
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("e2e_round_trip");
    group.throughput(Throughput::Elements(1));

    for framing in [Framing::Close, Framing::LengthPrefixed] {
        let setup = setup_backend_and_forwarder(&rt, framing);
        let envelope = Envelope::new("GET", "/");

        group.bench_function(BenchmarkId::from_parameter(framing), |b| {
            b.to_async(&rt)
                .iter(|| async { black_box(setup.forwarder.forward(&envelope).await.unwrap()) });
        });
    }

    group.finish();
}

fn bench_echo_body_size(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_backend_and_forwarder(&rt, Framing::Close);

    let mut group = c.benchmark_group("e2e_echo");

    for size in [100, 10000, 100000] {
        let envelope = Envelope::new("POST", "/echo").with_body("x".repeat(size));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &envelope, |b, envelope| {
            b.to_async(&rt)
                .iter(|| async { black_box(setup.forwarder.forward(envelope).await.unwrap()) });
        });
    }

    group.finish();
}

fn bench_concurrent_requests(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_backend_and_forwarder(&rt, Framing::Close);
    let envelope = Envelope::new("GET", "/");

    let mut group = c.benchmark_group("e2e_concurrent");
    group.sample_size(20);

    for concurrency in [1, 10, 50] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("forwards", concurrency),
            &concurrency,
            |b, &conc| {
                b.to_async(&rt).iter(|| {
                    let forwarder = &setup.forwarder;
                    let envelope = &envelope;
                    async move {
                        let futures: Vec<_> =
                            (0..conc).map(|_| forwarder.forward(envelope)).collect();
                        black_box(futures::future::join_all(futures).await)
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_round_trip,
    bench_echo_body_size,
    bench_concurrent_requests,
);

criterion_main!(benches);
