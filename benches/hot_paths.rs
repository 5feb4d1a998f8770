use criterion::{black_box, criterion_group, criterion_main, Criterion};
use trafficd::source::peer::parse_dump;
use trafficd::store::rollup::COMPRESSED_BUCKET_SECS;
use trafficd::store::{PeerSample, Sample, Series, Store};

const PEERS: usize = 64;
const USERS: usize = 32;
const DAY: i64 = 24 * 3600;

fn dump_output() -> String {
    let mut out = String::from("cHJpdmF0ZQ==\tcHVibGlj\t51820\toff\n");
    for i in 0..PEERS {
        out.push_str(&format!(
            "cGVlci{i:04}=\t(none)\t198.51.100.{}:51820\t10.0.0.{}/32\t1700000000\t{}\t{}\t25\n",
            i % 250,
            i % 250,
            1_000_000 + i * 4096,
            500_000 + i * 2048,
        ));
    }
    out
}

/// One day of minute samples for every user and peer.
fn seeded_store() -> Store {
    let store = Store::open_in_memory().expect("store");

    let samples: Vec<Sample> = (0..DAY / 60)
        .flat_map(|m| {
            (0..USERS).map(move |u| Sample {
                identity: format!("user-{u}"),
                ts: m * 60,
                uplink: 1_000 + u as u64,
                downlink: 4_000 + m as u64,
            })
        })
        .collect();
    store.append_batch(&samples).expect("append traffic");

    let peers: Vec<PeerSample> = (0..DAY / 60)
        .flat_map(|m| {
            (0..PEERS).map(move |p| PeerSample {
                peer_id: format!("peer-{p}"),
                ts: m * 60,
                rx: (m as u64) * 10_000,
                tx: (m as u64) * 2_500,
                endpoint: String::new(),
            })
        })
        .collect();
    store.append_peer_batch(&peers).expect("append peers");

    store
}

fn bench_parse_dump(c: &mut Criterion) {
    let output = dump_output();

    c.bench_function("parse_dump/64_peers", |b| {
        b.iter(|| parse_dump(black_box(&output)).expect("parse dump"))
    });
}

fn bench_queries(c: &mut Criterion) {
    let store = seeded_store();

    c.bench_function("bucketed/traffic_day_15m", |b| {
        b.iter(|| {
            let points = store
                .bucketed(Series::Traffic, &[], black_box(0), black_box(DAY), 900)
                .expect("bucketed traffic");
            black_box(points.len())
        })
    });

    c.bench_function("bucketed/peers_day_15m", |b| {
        b.iter(|| {
            let points = store
                .bucketed(Series::Peers, &[], black_box(3600), black_box(DAY), 900)
                .expect("bucketed peers");
            black_box(points.len())
        })
    });

    c.bench_function("top_totals/peers_day", |b| {
        b.iter(|| {
            let top = store
                .peer_top_totals(black_box(3600), black_box(DAY), 10)
                .expect("peer top");
            black_box(top.len())
        })
    });
}

fn bench_rollup(c: &mut Criterion) {
    c.bench_function("compress_before/traffic_day", |b| {
        b.iter_with_setup(seeded_store, |store| {
            let removed = store
                .compress_before(Series::Traffic, DAY, COMPRESSED_BUCKET_SECS)
                .expect("compress");
            black_box(removed)
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_dump(c);
    bench_queries(c);
    bench_rollup(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
