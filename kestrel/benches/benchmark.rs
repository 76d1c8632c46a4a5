use std::collections::HashMap;
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use kestrel::cluster::{ClusterState, NodeInfo};
use kestrel::policies::load_balancing::{
    DcAwareRoundRobinPolicy, LoadBalancingPolicy, Plan, RoundRobinPolicy, RoutingInfo,
    TokenAwarePolicy,
};
use kestrel::routing::locator::ReplicationStrategy;
use kestrel::statement::Consistency;
use kestrel::StreamIdSet;

const NODES_PER_DC: u8 = 6;

fn cluster() -> ClusterState {
    let nodes = (0..2 * NODES_PER_DC).map(|i| {
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, i + 1)), 9042);
        let dc = if i < NODES_PER_DC { "dc1" } else { "dc2" };
        let tokens = (0..8).map(move |t| i64::from(i) * 1_000_003 + t * (i64::MAX / 8));
        NodeInfo::new(address).with_datacenter(dc).with_tokens(tokens)
    });
    let keyspaces = HashMap::from([(
        "ks".to_owned(),
        ReplicationStrategy::NetworkTopology {
            datacenter_repfactors: HashMap::from([("dc1".to_owned(), 3), ("dc2".to_owned(), 3)]),
        },
    )]);
    ClusterState::new_unpooled(nodes, keyspaces)
}

fn plan_benchmark(c: &mut Criterion) {
    let state = cluster();
    let token = state.compute_token(b"some partition key");

    let round_robin = RoundRobinPolicy::new();
    let dc_aware = DcAwareRoundRobinPolicy::builder().local_dc("dc1").build();
    dc_aware.init(&state);
    let token_aware = TokenAwarePolicy::new(Arc::new(
        DcAwareRoundRobinPolicy::builder().local_dc("dc1").build(),
    ));
    token_aware.init(&state);

    let untargeted = RoutingInfo {
        consistency: Consistency::LocalQuorum,
        ..Default::default()
    };
    let targeted = RoutingInfo {
        consistency: Consistency::LocalQuorum,
        token: Some(token),
        keyspace: Some("ks"),
        ..Default::default()
    };

    c.bench_function("plan/round_robin/first", |b| {
        b.iter(|| Plan::new(&round_robin, &untargeted, &state).next().map(|n| n.address))
    });
    c.bench_function("plan/dc_aware/full", |b| {
        b.iter(|| Plan::new(&dc_aware, &untargeted, &state).count())
    });
    c.bench_function("plan/token_aware/first", |b| {
        b.iter(|| Plan::new(&token_aware, &targeted, &state).next().map(|n| n.address))
    });
    c.bench_function("plan/token_aware/full", |b| {
        b.iter(|| Plan::new(&token_aware, &targeted, &state).count())
    });
}

fn stream_id_benchmark(c: &mut Criterion) {
    c.bench_function("stream_ids/allocate_free", |b| {
        let mut set = StreamIdSet::new(1024);
        b.iter(|| {
            let id = set.allocate();
            if let Some(id) = id {
                set.free(black_box(id));
            }
            id
        })
    });
    c.bench_function("stream_ids/fill_half", |b| {
        b.iter(|| {
            let mut set = StreamIdSet::new(32768);
            for _ in 0..16384 {
                black_box(set.allocate());
            }
        })
    });
}

fn token_benchmark(c: &mut Criterion) {
    let state = cluster();
    let long_key = vec![b'.'; 2000];
    c.bench_function("token/short_key", |b| {
        b.iter(|| state.compute_token(black_box(b"I'm prepared!!!")))
    });
    c.bench_function("token/long_key", |b| {
        b.iter(|| state.compute_token(black_box(&long_key)))
    });
    let token = state.compute_token(b"some partition key");
    c.bench_function("token/replicas", |b| {
        b.iter(|| state.get_token_endpoints("ks", black_box(token)).len())
    });
}

criterion_group!(
    benches,
    plan_benchmark,
    stream_id_benchmark,
    token_benchmark
);
criterion_main!(benches);
