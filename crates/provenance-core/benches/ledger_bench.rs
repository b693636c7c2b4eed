use criterion::{criterion_group, criterion_main, Criterion};
use provenance_core::{
    Caller, DriverInput, FactoryInput, FarmerInput, MemoryLedger, ProvenanceLedger, ShopInput,
    TraceabilityCode, UserId, UserType,
};

fn img_hash(seed: char) -> String {
    format!("sha256:{}", seed.to_string().repeat(64))
}

fn participant(id: &str, user_type: UserType) -> Caller {
    match UserId::parse(id) {
        Ok(user_id) => Caller::new(user_id, user_type),
        Err(err) => panic!("bench participant id rejected: {err}"),
    }
}

fn lot_code(index: usize) -> TraceabilityCode {
    match TraceabilityCode::parse(&format!("LOT-{index:06}")) {
        Ok(code) => code,
        Err(err) => panic!("bench code rejected: {err}"),
    }
}

fn seeded_ledger() -> (ProvenanceLedger<MemoryLedger>, [Caller; 4]) {
    let ledger = ProvenanceLedger::new(MemoryLedger::new());
    let callers = [
        participant("bench-producer", UserType::Producer),
        participant("bench-processor", UserType::Processor),
        participant("bench-carrier", UserType::Carrier),
        participant("bench-retailer", UserType::Retailer),
    ];
    for who in &callers {
        if let Err(err) = ledger.register_user(who.user_id.clone(), who.user_type, img_hash('e')) {
            panic!("bench registration failed: {err}");
        }
    }
    (ledger, callers)
}

fn run_lot(ledger: &ProvenanceLedger<MemoryLedger>, callers: &[Caller; 4], code: &TraceabilityCode) {
    let farmer = FarmerInput {
        fruit_name: "Navel orange".to_string(),
        origin: "Ganzhou".to_string(),
        plant_time: "2019-03-01".to_string(),
        picking_time: "2025-11-20".to_string(),
        farmer_name: "bench".to_string(),
        img_hash: img_hash('a'),
    };
    let factory = FactoryInput {
        product_name: "Sorted oranges".to_string(),
        production_batch: "B-1".to_string(),
        production_time: "2025-11-21".to_string(),
        factory_name: "bench packing".to_string(),
        contact_number: "000".to_string(),
        img_hash: img_hash('b'),
    };
    let driver = DriverInput {
        name: "bench".to_string(),
        age: "40".to_string(),
        phone: "000".to_string(),
        car_number: "B-0001".to_string(),
        transport: "cold chain".to_string(),
        img_hash: img_hash('c'),
    };
    let shop = ShopInput {
        store_time: "2025-11-23".to_string(),
        sell_time: "2025-11-24".to_string(),
        shop_name: "bench shop".to_string(),
        shop_address: "1 Bench St".to_string(),
        shop_phone: "000".to_string(),
        img_hash: img_hash('d'),
    };

    let results = [
        ledger.submit_farmer_stage(&callers[0], code, farmer).map(|_| ()),
        ledger.submit_factory_stage(&callers[1], code, factory).map(|_| ()),
        ledger.submit_driver_stage(&callers[2], code, driver).map(|_| ()),
        ledger.submit_shop_stage(&callers[3], code, shop).map(|_| ()),
    ];
    for result in results {
        if let Err(err) = result {
            panic!("bench stage submission failed: {err}");
        }
    }
}

fn bench_submissions(c: &mut Criterion) {
    let (ledger, callers) = seeded_ledger();
    let mut next = 0_usize;

    c.bench_function("submit_four_stages", |b| {
        b.iter(|| {
            next += 1;
            run_lot(&ledger, &callers, &lot_code(next));
        });
    });
}

fn bench_history(c: &mut Criterion) {
    let (ledger, callers) = seeded_ledger();
    for index in 0..200 {
        run_lot(&ledger, &callers, &lot_code(index));
    }
    let code = lot_code(100);

    c.bench_function("replay_and_verify_history", |b| {
        b.iter(|| {
            let history = ledger.collect_fruit_history(&code);
            if let Err(err) = history {
                panic!("bench history replay failed: {err}");
            }
            if let Err(err) = ledger.verify_history(&code) {
                panic!("bench history verification failed: {err}");
            }
        });
    });
}

criterion_group!(ledger_benches, bench_submissions, bench_history);
criterion_main!(ledger_benches);
