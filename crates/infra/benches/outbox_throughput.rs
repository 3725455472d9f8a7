use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use courier_core::ModuleName;
use courier_events::{EventHandler, HandlerError, HandlerRegistry};
use courier_infra::store::{InMemoryMessageStore, InMemoryTransaction, PutDocument};
use courier_infra::{MessageProcessor, MessageTable, OutboxWriter, ProcessorConfig};
use courier_orders::{Order, OrderId, OrderPlaced};

struct Noop;

#[async_trait]
impl EventHandler<OrderPlaced, InMemoryTransaction> for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    async fn handle(&self, _event: OrderPlaced, _tx: &mut InMemoryTransaction) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn module() -> ModuleName {
    ModuleName::new("orders").expect("valid module name")
}

async fn place_orders(writer: &OutboxWriter<InMemoryMessageStore>, count: usize) {
    for _ in 0..count {
        let id = OrderId::new();
        let mut order = Order::draft(id, "acme", 1_000).expect("valid order");
        order.place(Utc::now()).expect("draft order can be placed");

        let value = serde_json::to_value(&order).expect("serializable order");
        let mut uow = writer.begin();
        uow.register_mutation(PutDocument::new("orders", id.to_string(), value))
            .collect_from(&mut order);
        uow.commit().await.expect("commit");
    }
}

fn bench_commit(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("unit_of_work_commit");

    for count in [10usize, 100] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let store = Arc::new(InMemoryMessageStore::new());
                let writer = OutboxWriter::new(store, MessageTable::outbox(module()));
                rt.block_on(place_orders(&writer, count));
                black_box(writer);
            });
        });
    }
    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("outbox_drain");

    for batch_size in [10usize, 50] {
        let messages = 200;
        group.throughput(Throughput::Elements(messages as u64));
        group.bench_with_input(BenchmarkId::new("batch_size", batch_size), &batch_size, |b, &batch_size| {
            b.iter(|| {
                rt.block_on(async {
                    let store = Arc::new(InMemoryMessageStore::new());
                    let writer = OutboxWriter::new(store.clone(), MessageTable::outbox(module()));
                    place_orders(&writer, messages).await;

                    let mut registry: HandlerRegistry<InMemoryTransaction> = HandlerRegistry::new();
                    registry.register::<OrderPlaced, _>(Noop).expect("register");
                    let config = ProcessorConfig::default().with_batch_size(batch_size);
                    let processor = MessageProcessor::outbox(store, module(), registry, config).expect("processor");

                    let mut processed = 0;
                    while processed < messages {
                        processed += processor.tick().await.expect("tick").processed;
                    }
                    black_box(processed);
                });
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_commit, bench_drain);
criterion_main!(benches);
