use std::sync::Arc;

use common::{RequestContext, SagaId};
use criterion::{Criterion, criterion_group, criterion_main};
use msg::headers::{MESSAGE_REPLY_NAME, MESSAGE_REPLY_OUTCOME, REPLY_OUTCOME_SUCCESS};
use msg::{
    Command, DomainCommand, Headers, InMemoryBroker, Message, MessageReceiver, Named, Outbox,
    Payload, Publisher, Success, Transactor, TypeRegistry,
};
use saga::headers::{MESSAGE_REPLY_SAGA_ID, MESSAGE_REPLY_SAGA_NAME};
use saga::{InMemoryInstanceStore, InMemoryTx, Orchestrator, SagaDefinition, Step};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderData {
    order_id: String,
    approved: bool,
}

impl Named for OrderData {
    const NAME: &'static str = "order.OrderData";
}

#[derive(Debug, Serialize, Deserialize)]
struct ReserveCredit {
    order_id: String,
}

impl Named for ReserveCredit {
    const NAME: &'static str = "customer.ReserveCredit";
}

impl Command for ReserveCredit {}

type BenchOrchestrator = Orchestrator<OrderData, InMemoryInstanceStore>;
type BenchStep = Step<OrderData, InMemoryTx>;

fn setup(remote_steps: usize) -> (Arc<InMemoryInstanceStore>, Arc<BenchOrchestrator>) {
    let registry = TypeRegistry::builder()
        .register::<OrderData>()
        .register_command::<ReserveCredit>()
        .build();
    let store = Arc::new(InMemoryInstanceStore::new(registry.clone()));
    let publisher = Arc::new(Publisher::new(Arc::new(InMemoryBroker::new()), registry));

    let mut builder = SagaDefinition::builder("create-order", "create-order-replies").step(
        BenchStep::local().action(|data: &mut OrderData| {
            data.approved = true;
            Ok(())
        }),
    );
    for _ in 0..remote_steps {
        builder = builder.step(BenchStep::remote().action(|data: &OrderData| {
            DomainCommand::new(ReserveCredit {
                order_id: data.order_id.clone(),
            })
            .to_channel("customer")
        }));
    }

    let orchestrator = Orchestrator::new(builder.build().unwrap(), store.clone(), publisher);
    (store, Arc::new(orchestrator))
}

fn order() -> OrderData {
    OrderData {
        order_id: "order-1".to_string(),
        approved: false,
    }
}

fn success_reply(saga_id: SagaId) -> Message {
    Message::new(b"{}".to_vec()).with_headers(&Headers::from([
        (MESSAGE_REPLY_NAME, Success.payload_name().to_string()),
        (MESSAGE_REPLY_OUTCOME, REPLY_OUTCOME_SUCCESS.to_string()),
        (MESSAGE_REPLY_SAGA_ID, saga_id.to_string()),
        (MESSAGE_REPLY_SAGA_NAME, "create-order".to_string()),
    ]))
}

fn bench_start_saga(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, orchestrator) = setup(1);

    c.bench_function("orchestrator/start_saga", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut tx = store.begin().await.unwrap();
                orchestrator
                    .start(&mut tx, &RequestContext::new(), order())
                    .await
                    .unwrap();
                store.commit(tx).await.unwrap();
            });
        });
    });
}

fn bench_full_run_5_steps(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, orchestrator) = setup(5);
    let outbox = Outbox::new(store.clone(), orchestrator.clone());

    c.bench_function("orchestrator/full_run_5_steps", |b| {
        b.iter(|| {
            rt.block_on(async {
                let ctx = RequestContext::new();
                let mut tx = store.begin().await.unwrap();
                let saga_id = orchestrator
                    .start(&mut tx, &ctx, order())
                    .await
                    .unwrap()
                    .saga_id();
                store.commit(tx).await.unwrap();

                for _ in 0..5 {
                    outbox
                        .receive_message(&ctx, &success_reply(saga_id))
                        .await
                        .unwrap();
                }
            });
        });
    });
}

criterion_group!(benches, bench_start_saga, bench_full_run_5_steps);
criterion_main!(benches);
