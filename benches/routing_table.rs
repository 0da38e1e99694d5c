//! Micro-benchmarks for RoutingTable operations: update, find_closest, and remove
//! at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use lbry_dht::{Id, Node, RoutingTable, MAX_BUCKET_SIZE_K};
use std::net::SocketAddrV4;
use std::str::FromStr;
use std::time::Instant;

fn main() {
    println!("routing_table\n");

    bench_update();
    bench_find_closest();
    bench_remove();
}

fn bench_update() {
    println!("update");

    let addr = SocketAddrV4::from_str("127.0.0.1:4444").unwrap();

    // Pre-generate random nodes outside the timed section
    let nodes: Vec<_> = (0..1000).map(|_| Node::new(Id::random(), addr)).collect();

    {
        let mut table = RoutingTable::new(Id::random());
        let start = Instant::now();
        for node in nodes.iter().cloned() {
            table.update(node);
        }
        let per_op = start.elapsed().as_nanos() / nodes.len() as u128;
        println!(
            "empty table:   {per_op}ns/op (final size: {})",
            table.size()
        );
    }

    // Refreshing known contacts moves them to the front of their bucket.
    {
        let mut table = RoutingTable::new(Id::random());
        for node in nodes[..200].iter().cloned() {
            table.update(node);
        }

        let start = Instant::now();
        for node in nodes[..200].iter().cloned() {
            table.update(node);
        }
        let per_op = start.elapsed().as_nanos() / 200;
        println!("refresh:       {per_op}ns/op");
    }

    println!();
}

fn bench_find_closest() {
    println!("find_closest");

    let addr = SocketAddrV4::from_str("127.0.0.1:4444").unwrap();
    let targets: Vec<_> = (0..1000).map(|_| Id::random()).collect();

    for size in [50, 100, 200, 400] {
        let mut table = RoutingTable::new(Id::random());
        for _ in 0..size {
            table.update(Node::new(Id::random(), addr));
        }

        let start = Instant::now();
        for target in &targets {
            let _ = table.find_closest(target, MAX_BUCKET_SIZE_K);
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;
        println!("{size:>3} nodes: {per_op}ns/op");
    }

    println!();
}

fn bench_remove() {
    println!("remove");

    let addr = SocketAddrV4::from_str("127.0.0.1:4444").unwrap();
    let mut table = RoutingTable::new(Id::random());

    let mut ids = Vec::new();
    for _ in 0..200 {
        let id = Id::random();
        ids.push(id);
        table.update(Node::new(id, addr));
    }

    let n = ids.len();
    let start = Instant::now();
    for id in &ids {
        table.remove(id);
    }
    let per_op = start.elapsed().as_nanos() / n as u128;
    println!("{per_op}ns/op ({n} removals)");
    println!();
}
