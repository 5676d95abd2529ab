//! Benchmarks for event dispatch
//!
//! Compares a broadcast over the whole chain with a start-of-frame that only
//! visits subscribers, and measures the buffered interrupt path.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use stack::test_utils::{MockDriver, interface_blob};
use stack::{ClassContext, Event, Outcome, StackConfig, UsbClass, UsbdStack};

/// Counts events without recording them
struct Counter {
    blob: Vec<u8>,
    seen: u64,
}

impl UsbClass for Counter {
    fn descriptors(&self) -> &[u8] {
        &self.blob
    }

    fn event(&mut self, _ctx: &mut ClassContext<'_>, _event: &Event) -> Outcome {
        self.seen += 1;
        Outcome::Declined
    }
}

fn running_stack(instances: usize, subscribers: usize, config: StackConfig) -> UsbdStack {
    let (driver, _probe) = MockDriver::new();
    let mut usbd = UsbdStack::new(driver);
    usbd.init(config).unwrap();

    for i in 0..instances {
        let handle = usbd
            .append(Box::new(Counter {
                blob: interface_blob(i as u8, &[]),
                seen: 0,
            }))
            .unwrap();
        if i < subscribers {
            usbd.sof_register(handle).unwrap();
        }
    }

    usbd.enable().unwrap();
    usbd.start().unwrap();
    while usbd.process_queue().unwrap() {}
    usbd
}

fn benchmark_broadcast_vs_sof(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_vs_sof");

    for instances in [4usize, 16, 32] {
        let mut usbd = running_stack(instances, 2, StackConfig::immediate());
        group.throughput(Throughput::Elements(instances as u64));

        group.bench_with_input(BenchmarkId::new("all_call", instances), &instances, |b, _| {
            b.iter(|| usbd.all_call(black_box(&Event::Reset)))
        });

        group.bench_with_input(
            BenchmarkId::new("start_of_frame", instances),
            &instances,
            |b, _| {
                b.iter(|| {
                    usbd.isr_event(black_box(Event::StartOfFrame { frame: 7 }))
                        .unwrap()
                })
            },
        );
    }

    group.finish();
}

fn benchmark_buffered_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffered_path");

    let mut usbd = running_stack(8, 4, StackConfig::buffered(64));
    let irq = usbd.interrupt_handle().unwrap();

    group.bench_function("raise_and_pump", |b| {
        b.iter(|| {
            irq.raise(black_box(Event::StartOfFrame { frame: 1 })).unwrap();
            usbd.process_queue().unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_broadcast_vs_sof, benchmark_buffered_path);
criterion_main!(benches);
