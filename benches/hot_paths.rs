use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use conntracct::config::ProbeConfig;
use conntracct::probe::parse::{encode_record, parse_record};
use conntracct::probe::{
    AccountingEvent, Consumer, Counters, Direction, EventKind, FlowTuple, Probe, SamplingPolicy,
};
use conntracct::sink::elastic::ElasticDoc;
use conntracct::sink::influx::line::encode_line;
use conntracct::source::{ChannelSource, FlowTable, Packet};

const FAN_OUT_CONSUMERS: usize = 4;
const FAN_OUT_EVENTS: usize = 1_000;

fn sample_event() -> AccountingEvent {
    AccountingEvent {
        kind: EventKind::Update,
        tuple: FlowTuple {
            proto: 17,
            src_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dst_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            src_port: 51_234,
            dst_port: 1342,
        },
        counters: Counters {
            packets_orig: 34,
            bytes_orig: 1_054,
            packets_ret: 9,
            bytes_ret: 576,
        },
        netns: 4_026_531_992,
        connmark: 0,
        timestamp: SystemTime::now(),
    }
}

fn bench_codecs(c: &mut Criterion) {
    let event = sample_event();
    let record = encode_record(&event);

    c.bench_function("parse_record", |b| {
        b.iter(|| parse_record(black_box(&record)).expect("parse record"))
    });

    c.bench_function("influx/encode_line", |b| {
        b.iter(|| encode_line(black_box(&event)))
    });

    c.bench_function("elastic/encode_doc", |b| {
        b.iter(|| {
            let doc = ElasticDoc::from(black_box(&event));
            serde_json::to_vec(&doc).expect("serialize doc")
        })
    });
}

fn bench_flow_table(c: &mut Criterion) {
    let mut table = FlowTable::new(SamplingPolicy::new(Duration::from_secs(2)));
    let now = Instant::now();
    let packets: Vec<Packet> = (0..256u16)
        .map(|i| Packet {
            tuple: FlowTuple {
                src_port: 32_768 + i,
                ..sample_event().tuple
            },
            netns: 1,
            connmark: 0,
            direction: if i % 4 == 3 {
                Direction::Reply
            } else {
                Direction::Orig
            },
            bytes: 64,
        })
        .collect();

    c.bench_function("flow_table/observe_256_flows", |b| {
        b.iter(|| {
            let mut emitted = 0usize;
            for packet in &packets {
                if table.observe(black_box(packet), now).is_some() {
                    emitted += 1;
                }
            }
            black_box(emitted)
        })
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("building runtime");

    let (source, events, _errors) = ChannelSource::new(FAN_OUT_EVENTS);
    let probe = Probe::new(
        ProbeConfig {
            cooldown: Duration::from_secs(2),
            consumer_buffer: FAN_OUT_EVENTS,
        },
        source,
    );

    let mut receivers = Vec::with_capacity(FAN_OUT_CONSUMERS);
    for i in 0..FAN_OUT_CONSUMERS {
        let (consumer, rx) = Consumer::with_capacity(format!("bench-{i}"), FAN_OUT_EVENTS);
        probe
            .register_consumer(Arc::clone(&consumer))
            .expect("register consumer");
        receivers.push(rx);
    }
    rt.block_on(probe.start()).expect("start probe");

    let event = sample_event();

    c.bench_function("probe/fan_out_1000x4", |b| {
        b.iter(|| {
            rt.block_on(async {
                for _ in 0..FAN_OUT_EVENTS {
                    events.send(event.clone()).await.expect("send event");
                }
                for rx in receivers.iter_mut() {
                    for _ in 0..FAN_OUT_EVENTS {
                        black_box(rx.recv().await.expect("receive event"));
                    }
                }
            })
        })
    });

    rt.block_on(probe.stop());
}

fn bench_suite(c: &mut Criterion) {
    bench_codecs(c);
    bench_flow_table(c);
    bench_fan_out(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
