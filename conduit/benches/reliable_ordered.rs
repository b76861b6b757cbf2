#[macro_use]
extern crate criterion;

use conduit::channel::{AckTracker, OrderedReceiveBuffer, ReliableSendWindow};
use conduit_support::time::Clock;
use criterion::{black_box, Criterion};
use std::time::Duration;

const WINDOW_SIZE: usize = 1024;
const BURST: u16 = 256;

fn send_window_fill_and_ack_bench(c: &mut Criterion) {
    c.bench_function("reliable_ordered send window fill+ack", move |b| {
        b.iter(|| {
            let mut window = ReliableSendWindow::new(WINDOW_SIZE);
            let now = Clock::now();

            for i in 0..BURST {
                window.enqueue(vec![i as u8], false);
            }
            for seq in window.due_for_send(now, Duration::from_millis(100)) {
                window.mark_sent(seq, now);
            }

            window.apply_ack(BURST, 0);
            black_box(window.len());
        })
    });
}

fn ordered_receive_out_of_order_bench(c: &mut Criterion) {
    // Worst case for the reassembly buffer: every piece arrives in
    // reverse, so nothing is deliverable until the very last insert.
    let arrivals: Vec<u16> = (0..BURST).rev().collect();

    c.bench_function("reliable_ordered reassembly reverse arrival", move |b| {
        b.iter(|| {
            let mut buf = OrderedReceiveBuffer::new();
            let mut delivered = 0usize;
            for &seq in &arrivals {
                delivered += buf.insert(seq, vec![seq as u8]).len();
            }
            black_box(delivered);
        })
    });
}

fn ack_tracker_record_bench(c: &mut Criterion) {
    c.bench_function("reliable_ordered ack tracker record", move |b| {
        b.iter(|| {
            let mut tracker = AckTracker::new();
            for seq in 0..BURST {
                black_box(tracker.record(seq));
            }
            black_box(tracker.ack_fields());
        })
    });
}

criterion_group!(
    benches,
    send_window_fill_and_ack_bench,
    ordered_receive_out_of_order_bench,
    ack_tracker_record_bench
);
criterion_main!(benches);
